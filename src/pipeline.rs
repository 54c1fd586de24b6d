use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StoreError, TaskError, UpsertError};
use crate::fetch::{self, FeedFetchOptions};
use crate::parser::feed::{self, FeedRoute};
use crate::parser::listing;
use crate::parser::select::{select_price, SelectorPolicy};
use crate::parser::{Listing, PriceNode};
use crate::price;
use crate::reconcile::{Reconciler, UpsertOptions, UpsertOutcome};
use crate::record::NewRecord;
use crate::scraper::PageFetcher;
use crate::settings::{Settings, TaskKind, TaskSpec};
use crate::store::PriceStore;
use crate::title;

/// Raw price as a collaborator hands it over: text to parse, or an already numeric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriceRaw {
    Number(f64),
    Text(String),
}

/// A `{title, priceRaw}` pair from a scraping collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCandidate {
    pub title: String,
    pub price_raw: PriceRaw,
    #[serde(default)]
    pub struck: bool,
    #[serde(default)]
    pub price_class: bool,
    #[serde(default)]
    pub url: Option<String>,
}

/// A selected price ready to become a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub category: String,
    pub title: String,
    pub value: f64,
    pub currency: String,
    pub url: String,
}

/// Outcome of one task. Errors stay here; they never abort the run unless the store is gone.
#[derive(Debug, Default)]
pub struct TaskReport {
    pub site: String,
    pub label: String,
    /// Candidates that produced a price.
    pub found: usize,
    pub stored: usize,
    pub unchanged: usize,
    /// Parse failures, unrouted entries and duplicates.
    pub skipped: usize,
    /// Failed validation at the store boundary.
    pub rejected: usize,
    pub error: Option<TaskError>,
}

impl TaskReport {
    pub fn new(site: &str, label: &str) -> Self {
        TaskReport {
            site: site.to_string(),
            label: label.to_string(),
            ..Default::default()
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.error, Some(TaskError::Store(StoreError::Unavailable(_))))
    }
}

/// Where task documents come from. The live source hits the network.
pub trait CandidateSource {
    async fn page_markdown(&self, url: &str) -> Result<String, TaskError>;

    async fn feed_xml(&self, site: &str, url: &str, cache: Option<&Path>) -> Result<String, TaskError>;
}

pub struct LiveSource {
    feed_options: FeedFetchOptions,
    feed_dir: PathBuf,
    page_timeout: Duration,
}

impl LiveSource {
    pub fn new(settings: &Settings, force_feeds: bool) -> Self {
        LiveSource {
            feed_options: FeedFetchOptions::from_settings(settings, force_feeds),
            feed_dir: settings.feed_dir.clone(),
            page_timeout: Duration::from_secs(settings.task_timeout_secs),
        }
    }
}

impl CandidateSource for LiveSource {
    async fn page_markdown(&self, url: &str) -> Result<String, TaskError> {
        PageFetcher::from_env(self.page_timeout)?.fetch_markdown(url).await
    }

    async fn feed_xml(&self, site: &str, url: &str, cache: Option<&Path>) -> Result<String, TaskError> {
        let path = cache
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.feed_dir.join(format!("{site}.xml")));
        fetch::fetch_feed(url, &path, &self.feed_options).await
    }
}

pub struct Pipeline<'a, S, C> {
    reconciler: &'a Reconciler<S>,
    source: &'a C,
    settings: &'a Settings,
    options: UpsertOptions,
    policy: SelectorPolicy,
}

impl<'a, S: PriceStore, C: CandidateSource> Pipeline<'a, S, C> {
    pub fn new(
        reconciler: &'a Reconciler<S>,
        source: &'a C,
        settings: &'a Settings,
        options: UpsertOptions,
    ) -> Self {
        Pipeline {
            reconciler,
            source,
            settings,
            options,
            policy: SelectorPolicy::default(),
        }
    }

    /// Run tasks one after another with the cooldown after each.
    ///
    /// Only an unavailable store stops the run early.
    pub async fn run_tasks(&self, tasks: &[TaskSpec]) -> Result<Vec<TaskReport>, StoreError> {
        let pb = ProgressBar::new(tasks.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        let cooldown = Duration::from_millis(self.settings.cooldown_ms);
        let mut reports = Vec::with_capacity(tasks.len());

        for (i, task) in tasks.iter().enumerate() {
            pb.set_message(format!("{} {}", task.site, task.label()));
            let mut report = self.run_task(task).await;
            pb.inc(1);

            if report.is_fatal() {
                pb.finish_and_clear();
                if let Some(TaskError::Store(e)) = report.error.take() {
                    return Err(e);
                }
            }
            reports.push(report);

            if i + 1 < tasks.len() && !cooldown.is_zero() {
                tokio::time::sleep(cooldown).await;
            }
        }

        pb.finish_and_clear();
        Ok(reports)
    }

    pub async fn run_task(&self, task: &TaskSpec) -> TaskReport {
        let mut report = TaskReport::new(&task.site, task.label());
        info!(site = %task.site, url = %task.url, "Task started");

        let result = match &task.kind {
            TaskKind::Page { category } => match self.source.page_markdown(&task.url).await {
                Ok(md) => {
                    let found = self.page_observations(&md, category, &task.url);
                    self.persist(&task.site, found, &mut report)
                }
                Err(e) => Err(e),
            },
            TaskKind::Feed { routes, cache } => {
                match self.source.feed_xml(&task.site, &task.url, cache.as_deref()).await {
                    Ok(xml) => self.ingest_feed(&task.site, &xml, routes, &task.url, &mut report),
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = result {
            warn!(site = %task.site, url = %task.url, "Task failed: {}", e);
            report.error = Some(e);
        }
        info!(
            site = %task.site,
            found = report.found,
            stored = report.stored,
            unchanged = report.unchanged,
            skipped = report.skipped,
            rejected = report.rejected,
            "Task finished"
        );
        report
    }

    /// Parse a feed document, route its entries and persist them.
    ///
    /// Empty `routes` falls back to the taxonomy's defaults for the site.
    pub fn ingest_feed(
        &self,
        site: &str,
        xml: &str,
        routes: &[FeedRoute],
        fallback_url: &str,
        report: &mut TaskReport,
    ) -> Result<(), TaskError> {
        let default_routes;
        let routes = if routes.is_empty() {
            default_routes = self.settings.taxonomy.feed_routes(site);
            &default_routes
        } else {
            routes
        };

        let entries = feed::parse_feed(xml)?;
        let total = entries.len();
        let policy = &self.policy;
        let default_currency = self.settings.default_currency.as_str();
        let found: Vec<Observation> = entries
            .par_iter()
            .filter_map(|entry| {
                let category = feed::route(entry, routes)?;
                observe(&entry.listing(), &category, fallback_url, policy, default_currency)
            })
            .collect();

        report.skipped += total - found.len();
        debug!(site, total, routed = found.len(), "Feed parsed");
        self.persist(site, found, report)
    }

    /// Turn `{title, priceRaw}` candidates into observations for one category.
    ///
    /// Candidates sharing a title are one listing; the selector picks among them.
    pub fn candidate_observations(
        &self,
        candidates: &[RawCandidate],
        category: &str,
        url: &str,
    ) -> Vec<Observation> {
        let mut order: Vec<&str> = Vec::new();
        let mut groups: HashMap<&str, Vec<&RawCandidate>> = HashMap::new();
        for c in candidates {
            let title = c.title.trim();
            if !groups.contains_key(title) {
                order.push(title);
            }
            groups.entry(title).or_default().push(c);
        }

        order
            .into_iter()
            .filter_map(|title| {
                let group = groups.get(title)?;
                let listing = Listing {
                    title: title.to_string(),
                    url: group.iter().find_map(|c| c.url.clone()),
                    nodes: group.iter().filter_map(|c| candidate_node(c)).collect(),
                };
                self.observe(&listing, category, url)
            })
            .collect()
    }

    fn page_observations(&self, markdown: &str, category: &str, url: &str) -> Vec<Observation> {
        listing::listings(markdown)
            .iter()
            .filter_map(|l| self.observe(l, category, url))
            .collect()
    }

    fn observe(&self, listing: &Listing, category: &str, url: &str) -> Option<Observation> {
        observe(listing, category, url, &self.policy, &self.settings.default_currency)
    }

    /// Dedup and upsert one task's observations.
    pub fn persist(
        &self,
        site: &str,
        observations: Vec<Observation>,
        report: &mut TaskReport,
    ) -> Result<(), TaskError> {
        let before = observations.len();
        let records: Vec<NewRecord> = dedup_lowest(observations)
            .into_iter()
            .filter_map(|o| {
                NewRecord::from_value(site, &o.category, &o.title, o.value, &o.currency, &o.url)
            })
            .collect();
        report.found += before;
        report.skipped += before - records.len();

        for record in &records {
            match self.reconciler.upsert_and_archive(record, self.options) {
                Ok(UpsertOutcome::Unchanged) => report.unchanged += 1,
                Ok(outcome) => {
                    report.stored += 1;
                    debug!(
                        category = %record.category_name,
                        item = %record.item_name,
                        value = record.sell_price_value,
                        ?outcome,
                        "Upsert"
                    );
                }
                Err(UpsertError::Validation(e)) => {
                    report.rejected += 1;
                    warn!(category = %record.category_name, item = %record.item_name, "Rejected: {}", e);
                }
                Err(UpsertError::Store(e)) => return Err(TaskError::Store(e)),
            }
        }
        Ok(())
    }
}

/// Select a listing's price; the currency comes from the node that carried it.
fn observe(
    listing: &Listing,
    category: &str,
    url: &str,
    policy: &SelectorPolicy,
    default_currency: &str,
) -> Option<Observation> {
    let Some(selected) = select_price(&listing.nodes, policy) else {
        debug!(title = %listing.title, "No price survived selection");
        return None;
    };
    let currency = listing
        .nodes
        .iter()
        .filter(|n| !n.struck && n.text.contains(&selected.raw))
        .find_map(|n| price::detect_currency(&n.text))
        .unwrap_or(default_currency);

    Some(Observation {
        category: category.to_string(),
        title: listing.title.clone(),
        value: selected.value,
        currency: currency.to_string(),
        url: listing.url.clone().unwrap_or_else(|| url.to_string()),
    })
}

fn candidate_node(c: &RawCandidate) -> Option<PriceNode> {
    match &c.price_raw {
        PriceRaw::Text(text) => Some(PriceNode {
            struck: c.struck,
            price_class: c.price_class,
            ..PriceNode::plain(text)
        }),
        // Already a number: nothing textual to corroborate, so the collaborator vouches for it.
        PriceRaw::Number(v) if v.is_finite() && *v > 0.0 => Some(PriceNode {
            struck: c.struck,
            price_class: true,
            ..PriceNode::plain(&price::format_canonical(*v))
        }),
        PriceRaw::Number(_) => None,
    }
}

/// One observation per (category, comparison key), the lowest price winning.
fn dedup_lowest(observations: Vec<Observation>) -> Vec<Observation> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut kept: Vec<Observation> = Vec::with_capacity(observations.len());

    for o in observations {
        let key = (o.category.clone(), title::normalize_key(&title::sanitize_display(&o.title)));
        match index.get(&key) {
            Some(&i) => {
                if o.value < kept[i].value {
                    kept[i] = o;
                }
            }
            None => {
                index.insert(key, kept.len());
                kept.push(o);
            }
        }
    }
    kept
}

/// Print the run summary table.
pub fn print_reports(reports: &[TaskReport]) {
    println!(
        "{:<16} | {:<28} | {:>5} | {:>6} | {:>9} | {:>7} | {:>8} | {}",
        "Site", "Category", "Found", "Stored", "Unchanged", "Skipped", "Rejected", "Error"
    );
    println!("{}", "-".repeat(110));
    for r in reports {
        println!(
            "{:<16} | {:<28} | {:>5} | {:>6} | {:>9} | {:>7} | {:>8} | {}",
            r.site,
            r.label,
            r.found,
            r.stored,
            r.unchanged,
            r.skipped,
            r.rejected,
            r.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
        );
    }

    let stored: usize = reports.iter().map(|r| r.stored).sum();
    let failed = reports.iter().filter(|r| r.error.is_some()).count();
    println!("\n{} tasks, {} records stored, {} failed", reports.len(), stored, failed);
}
