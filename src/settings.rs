use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use config::Config;
use serde::{Deserialize, Serialize};

use crate::parser::feed::FeedRoute;
use crate::reconcile::ArchiveMode;

/// Runtime settings: built-in defaults, then an optional file, then `PRICEWATCH_*` env vars.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    /// Where downloaded feeds are cached.
    pub feed_dir: PathBuf,
    pub archive_mode: ArchiveMode,
    /// Pause between consecutive tasks, successful or not.
    pub cooldown_ms: u64,
    pub task_timeout_secs: u64,
    pub feed_retries: u32,
    pub feed_timeout_secs: u64,
    pub feed_max_age_secs: u64,
    pub default_currency: String,
    pub log_filter: String,
    pub taxonomy: Taxonomy,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: PathBuf::from("data/prices.db"),
            feed_dir: PathBuf::from("data/feeds"),
            archive_mode: ArchiveMode::Always,
            cooldown_ms: 1500,
            task_timeout_secs: 90,
            feed_retries: 2,
            feed_timeout_secs: 30,
            feed_max_age_secs: 3600,
            default_currency: "TRY".to_string(),
            log_filter: "info".to_string(),
            taxonomy: Taxonomy::builtin(),
        }
    }
}

pub fn load(file: Option<&Path>) -> Result<Settings> {
    let mut builder = Config::builder();
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path));
    }
    let settings: Settings = builder
        .add_source(config::Environment::with_prefix("PRICEWATCH").try_parsing(true))
        .build()
        .context("Failed to read settings")?
        .try_deserialize()
        .context("Invalid settings")?;

    if settings.default_currency.trim().is_empty() {
        bail!("default_currency must not be empty");
    }
    Ok(settings)
}

// ── Taxonomy ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Tr,
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub label: String,
    /// Feed entries mentioning any of these belong to the game.
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub game: String,
    pub region: Region,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub label: String,
}

/// Static lookup tables for the comparison view. Built once, passed by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    /// In display order.
    pub games: Vec<Game>,
    pub categories: Vec<Category>,
    /// In display priority order; unknown sites go last.
    pub sites: Vec<Site>,
}

const BUILTIN_GAMES: &[(&str, &str, &[&str])] = &[
    ("pubgm", "PUBG Mobile UC", &["pubg"]),
    ("mlbb", "Mobile Legends Elmas", &["mobile legends", "mlbb"]),
];

const BUILTIN_SITES: &[(&str, &str)] = &[
    ("oyuneks", "Oyuneks"),
    ("oyunfor", "Oyunfor"),
    ("bynogame", "ByNoGame"),
    ("btkgame", "BTK Game"),
    ("kabasakalonline", "Kabasakal Online"),
    ("dijipin", "Dijipin"),
    ("foxepin", "Foxepin"),
    ("viora", "Viora"),
    ("hesapcomtr", "Hesap.com.tr"),
];

impl Default for Taxonomy {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Taxonomy {
    /// Every site carries a `<site>-<game>-tr` and `<site>-<game>-global` category.
    pub fn builtin() -> Self {
        let games = BUILTIN_GAMES
            .iter()
            .map(|(id, label, keywords)| Game {
                id: id.to_string(),
                label: label.to_string(),
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
            })
            .collect();
        let sites = BUILTIN_SITES
            .iter()
            .map(|(id, label)| Site {
                id: id.to_string(),
                label: label.to_string(),
            })
            .collect();

        let mut categories = Vec::new();
        for (site, _) in BUILTIN_SITES {
            for (game, _, _) in BUILTIN_GAMES {
                for (suffix, region) in [("tr", Region::Tr), ("global", Region::Global)] {
                    categories.push(Category {
                        id: format!("{site}-{game}-{suffix}"),
                        game: game.to_string(),
                        region,
                    });
                }
            }
        }

        Taxonomy {
            games,
            categories,
            sites,
        }
    }

    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    /// Default feed routing for a site: one route per game, `<site>-<game>` base.
    pub fn feed_routes(&self, site: &str) -> Vec<FeedRoute> {
        self.games
            .iter()
            .map(|g| FeedRoute {
                game: g.id.clone(),
                keywords: g.keywords.clone(),
                category_base: format!("{site}-{}", g.id),
            })
            .collect()
    }

    pub fn allow_list(&self) -> Vec<String> {
        self.categories.iter().map(|c| c.id.clone()).collect()
    }

    pub fn site_label<'a>(&'a self, site: &'a str) -> &'a str {
        self.sites
            .iter()
            .find(|s| s.id == site)
            .map_or(site, |s| s.label.as_str())
    }

    pub fn site_rank(&self, site: &str) -> usize {
        self.sites
            .iter()
            .position(|s| s.id == site)
            .unwrap_or(self.sites.len())
    }

    pub fn game_rank(&self, game: &str) -> usize {
        self.games
            .iter()
            .position(|g| g.id == game)
            .unwrap_or(self.games.len())
    }
}

// ── Tasks file ──

/// One storefront job of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub site: String,
    pub url: String,
    #[serde(flatten)]
    pub kind: TaskKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TaskKind {
    /// Rendered storefront page; every listing lands in one category.
    Page { category: String },
    /// Merchant XML feed; entries are routed to categories by game.
    /// Without routes the taxonomy's per-game defaults apply.
    Feed {
        #[serde(default)]
        routes: Vec<FeedRoute>,
        #[serde(default)]
        cache: Option<PathBuf>,
    },
}

impl TaskSpec {
    /// Category for reporting: the page category or the feed's first route base.
    pub fn label(&self) -> &str {
        match &self.kind {
            TaskKind::Page { category } => category,
            TaskKind::Feed { routes, .. } => routes
                .first()
                .map_or(self.url.as_str(), |r| r.category_base.as_str()),
        }
    }
}

pub fn load_tasks(path: &Path) -> Result<Vec<TaskSpec>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tasks file {}", path.display()))?;
    let tasks: Vec<TaskSpec> = serde_json::from_str(&text)
        .with_context(|| format!("Invalid tasks file {}", path.display()))?;

    for (i, task) in tasks.iter().enumerate() {
        if task.site.trim().is_empty() || task.url.trim().is_empty() {
            bail!("Task[{i}] is missing site or url");
        }
        match &task.kind {
            TaskKind::Page { category } if category.trim().is_empty() => {
                bail!("Task[{i}] ({}) is missing category", task.site)
            }
            _ => {}
        }
    }
    Ok(tasks)
}
