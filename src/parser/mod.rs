pub mod feed;
pub mod listing;
pub mod select;

/// A price-like fragment of a listing plus the structural hints the page gave for it.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceNode {
    pub text: String,
    /// Rendered struck-through; never the current price.
    pub struck: bool,
    /// Labelled as a price by the page structure.
    pub price_class: bool,
    /// Labelled as an old/list price.
    pub old_class: bool,
}

impl PriceNode {
    pub fn plain(text: &str) -> Self {
        PriceNode {
            text: text.to_string(),
            struck: false,
            price_class: false,
            old_class: false,
        }
    }
}

/// One product block: a title and the price nodes found under it.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub title: String,
    pub url: Option<String>,
    pub nodes: Vec<PriceNode>,
}
