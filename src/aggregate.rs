use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::price;
use crate::record::PriceRecord;
use crate::settings::{Region, Taxonomy};
use crate::title;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameView {
    pub game: String,
    pub label: String,
    pub sites: Vec<SiteView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteView {
    pub site: String,
    pub label: String,
    pub rows: Vec<ViewRow>,
}

/// One logical product on one site, with its TR and GLOBAL prices side by side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewRow {
    pub key: String,
    pub name: String,
    pub tr: Option<PriceCell>,
    pub global: Option<PriceCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceCell {
    pub sell_price: String,
    pub currency: String,
    pub url: String,
    pub updated_at: DateTime<Utc>,
}

impl ViewRow {
    /// Sort price: TR first, GLOBAL as fallback. `None` when neither parses.
    fn sort_value(&self) -> Option<f64> {
        self.tr
            .as_ref()
            .and_then(|c| price::parse_value(&c.sell_price))
            .or_else(|| self.global.as_ref().and_then(|c| price::parse_value(&c.sell_price)))
    }
}

/// Group current records into game → site → row for the comparison view.
///
/// Records whose category is not in the taxonomy are ignored. Read-only.
pub fn build_view(records: &[PriceRecord], taxonomy: &Taxonomy) -> Vec<GameView> {
    let mut games: HashMap<&str, HashMap<&str, Vec<ViewRow>>> = HashMap::new();

    for record in records {
        let Some(category) = taxonomy.category(&record.key.category_name) else {
            continue;
        };
        let rows = games
            .entry(category.game.as_str())
            .or_default()
            .entry(record.key.site_name.as_str())
            .or_default();

        let row = match rows.iter_mut().position(|r| r.key == record.key.item_key) {
            Some(i) => &mut rows[i],
            None => {
                rows.push(ViewRow {
                    key: record.key.item_key.clone(),
                    name: record.item_name.clone(),
                    tr: None,
                    global: None,
                });
                let last = rows.len() - 1;
                &mut rows[last]
            }
        };

        let slot = match category.region {
            Region::Tr => &mut row.tr,
            Region::Global => &mut row.global,
        };
        // Records arrive oldest first; the first one claims the slot.
        if slot.is_none() {
            *slot = Some(PriceCell {
                sell_price: record.sell_price.clone(),
                currency: record.currency.clone(),
                url: record.url.clone(),
                updated_at: record.updated_at,
            });
            if category.region == Region::Tr {
                row.name = record.item_name.clone();
            }
        }
    }

    let mut views: Vec<GameView> = games
        .into_iter()
        .map(|(game, sites)| {
            let mut sites: Vec<SiteView> = sites
                .into_iter()
                .map(|(site, mut rows)| {
                    rows.sort_by(compare_rows);
                    SiteView {
                        site: site.to_string(),
                        label: taxonomy.site_label(site).to_string(),
                        rows,
                    }
                })
                .collect();
            sites.sort_by(|a, b| {
                taxonomy
                    .site_rank(&a.site)
                    .cmp(&taxonomy.site_rank(&b.site))
                    .then_with(|| a.site.cmp(&b.site))
            });

            let label = taxonomy
                .games
                .iter()
                .find(|g| g.id == game)
                .map_or(game, |g| g.label.as_str());
            GameView {
                game: game.to_string(),
                label: label.to_string(),
                sites,
            }
        })
        .collect();

    views.sort_by(|a, b| {
        taxonomy
            .game_rank(&a.game)
            .cmp(&taxonomy.game_rank(&b.game))
            .then_with(|| a.game.cmp(&b.game))
    });
    views
}

fn compare_rows(a: &ViewRow, b: &ViewRow) -> Ordering {
    let by_name = || title::fold(&a.name).cmp(&title::fold(&b.name));
    match (a.sort_value(), b.sort_value()) {
        (Some(x), Some(y)) => x.total_cmp(&y).then_with(by_name),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => by_name(),
    }
}
