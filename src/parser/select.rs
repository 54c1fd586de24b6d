use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use super::PriceNode;
use crate::price::{self, INSTALLMENT_RE};

static NUMBER_RES: LazyLock<[Regex; 4]> = LazyLock::new(|| {
    [
        Regex::new(r"\b\d{1,3}(?:\.\d{3})+,\d{2}\b").unwrap(), // 1.234,56
        Regex::new(r"\b\d+,\d{2}\b").unwrap(),                 // 39,90
        Regex::new(r"\b\d{1,3}(?:,\d{3})+\.\d{2}\b").unwrap(), // 1,234.56
        Regex::new(r"\b\d+\.\d{2}\b").unwrap(),                // 39.90
    ]
});
static STRIKE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"~~[^~]*~~").unwrap());

const CURRENCY_WEIGHT: f64 = 3.0;
const PRICE_CLASS_WEIGHT: f64 = 5.0;

/// Tunables for [`select_price`]; sites with odd markup override these.
#[derive(Debug, Clone)]
pub struct SelectorPolicy {
    /// Values at or above this make sub-threshold candidates noise.
    pub bulk_threshold: f64,
    /// Characters either side of a numeral searched for a currency marker.
    pub currency_window: usize,
    /// Accept numerals with neither a nearby currency nor a price-class hint.
    pub allow_bare_numbers: bool,
}

impl Default for SelectorPolicy {
    fn default() -> Self {
        SelectorPolicy {
            bulk_threshold: 1000.0,
            currency_window: 15,
            allow_bare_numbers: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selected {
    pub raw: String,
    pub value: f64,
}

#[derive(Debug, Clone)]
struct Candidate {
    raw: String,
    value: f64,
    score: f64,
    old: bool,
}

/// Pick the single authoritative price among the nodes of one listing.
///
/// Struck prices and installment figures never win. Old-price labelled
/// figures only win when no current price is present. Returns `None`
/// when nothing survives; callers skip the listing rather than default.
pub fn select_price(nodes: &[PriceNode], policy: &SelectorPolicy) -> Option<Selected> {
    let mut candidates: Vec<Candidate> = nodes
        .iter()
        .filter(|n| !n.struck)
        .flat_map(|n| node_candidates(n, policy))
        .collect();

    if candidates.is_empty() {
        return None;
    }

    if candidates.iter().any(|c| !c.old) {
        candidates.retain(|c| !c.old);
    }

    let has_bulk = candidates.iter().any(|c| c.value >= policy.bulk_threshold);
    if has_bulk {
        candidates.retain(|c| c.value >= policy.bulk_threshold);
    }

    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(b.value.total_cmp(&a.value))
    });

    candidates.into_iter().next().map(|c| Selected {
        raw: c.raw,
        value: c.value,
    })
}

fn node_candidates(node: &PriceNode, policy: &SelectorPolicy) -> Vec<Candidate> {
    let text = node.text.as_str();
    let excluded: Vec<Range<usize>> = STRIKE_RE
        .find_iter(text)
        .chain(INSTALLMENT_RE.find_iter(text))
        .map(|m| m.range())
        .collect();

    numeral_spans(text)
        .into_iter()
        .filter(|span| !excluded.iter().any(|ex| overlaps(ex, span)))
        .map(|span| signed(text, span))
        .filter_map(|span| {
            let raw = &text[span.clone()];
            let value = price::parse_value(raw).filter(|v| v.is_finite() && *v > 0.0)?;

            let near_currency = price::has_currency(window(text, &span, policy.currency_window));
            if !near_currency && !node.price_class && !policy.allow_bare_numbers {
                return None;
            }

            let mut score = value.max(1.0).log10();
            if near_currency {
                score += CURRENCY_WEIGHT;
            }
            if node.price_class {
                score += PRICE_CLASS_WEIGHT;
            }

            Some(Candidate {
                raw: raw.to_string(),
                value,
                score,
                old: node.old_class,
            })
        })
        .collect()
}

/// Non-overlapping numeral spans, longest match first at each position.
fn numeral_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans: Vec<Range<usize>> = NUMBER_RES
        .iter()
        .flat_map(|re| re.find_iter(text).map(|m| m.range()))
        .collect();
    spans.sort_by(|a, b| a.start.cmp(&b.start).then(b.len().cmp(&a.len())));

    let mut kept: Vec<Range<usize>> = Vec::with_capacity(spans.len());
    for span in spans {
        if !kept.iter().any(|k| overlaps(k, &span)) {
            kept.push(span);
        }
    }
    kept
}

/// Widen a numeral span over a leading minus sign, unless the dash joins a range like `10-20`.
fn signed(text: &str, span: Range<usize>) -> Range<usize> {
    let before = &text[..span.start];
    match before.strip_suffix('-') {
        Some(rest) if !rest.ends_with(|c: char| c.is_ascii_digit()) => span.start - 1..span.end,
        _ => span,
    }
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

fn window<'a>(text: &'a str, span: &Range<usize>, pad: usize) -> &'a str {
    let mut lo = span.start.saturating_sub(pad);
    while !text.is_char_boundary(lo) {
        lo -= 1;
    }
    let mut hi = (span.end + pad).min(text.len());
    while !text.is_char_boundary(hi) {
        hi += 1;
    }
    &text[lo..hi]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(text: &str) -> PriceNode {
        PriceNode::plain(text)
    }

    fn pick(nodes: &[PriceNode]) -> Option<f64> {
        select_price(nodes, &SelectorPolicy::default()).map(|s| s.value)
    }

    #[test]
    fn installment_only_yields_nothing() {
        assert_eq!(pick(&[node("12x199,99 TL")]), None);
    }

    #[test]
    fn struck_price_loses_to_discount() {
        let nodes = [
            PriceNode {
                struck: true,
                ..node("₺39,90")
            },
            node("₺29,90"),
        ];
        let s = select_price(&nodes, &SelectorPolicy::default()).unwrap();
        assert_eq!(s.raw, "29,90");
        assert_eq!(s.value, 29.90);
    }

    #[test]
    fn inline_strike_markup_is_excluded() {
        assert_eq!(pick(&[node("~~₺39,90~~ ₺29,90")]), Some(29.90));
    }

    #[test]
    fn old_class_loses_to_current() {
        let nodes = [
            PriceNode {
                old_class: true,
                ..node("₺49,90")
            },
            node("₺39,90"),
        ];
        assert_eq!(pick(&nodes), Some(39.90));
    }

    #[test]
    fn old_list_price_in_bulk_range_loses_to_current() {
        let nodes = [
            PriceNode {
                old_class: true,
                ..node("Eski fiyat ₺1.200,00")
            },
            node("₺899,00"),
        ];
        let s = select_price(&nodes, &SelectorPolicy::default()).unwrap();
        assert_eq!(s.raw, "899,00");
    }

    #[test]
    fn old_price_alone_still_counts() {
        let old = PriceNode {
            old_class: true,
            ..node("Liste fiyatı ₺49,90")
        };
        assert_eq!(pick(&[old]), Some(49.90));
    }

    #[test]
    fn negative_amounts_are_rejected() {
        assert_eq!(pick(&[node("-29,90 TL")]), None);
        assert_eq!(pick(&[node("-1.500,00 TL"), node("₺29,90")]), Some(29.90));
        assert_eq!(pick(&[node("10-29,90 TL")]), Some(29.90));
    }

    #[test]
    fn bulk_total_beats_per_unit_figure() {
        let nodes = [
            PriceNode {
                price_class: true,
                ..node("₺45,00")
            },
            node("₺1.350,00"),
        ];
        assert_eq!(pick(&nodes), Some(1350.0));
    }

    #[test]
    fn bare_numbers_need_corroboration() {
        assert_eq!(pick(&[node("Ürün kodu 12.50")]), None);
        let hinted = PriceNode {
            price_class: true,
            ..node("12.50")
        };
        assert_eq!(pick(&[hinted]), Some(12.5));
    }

    #[test]
    fn ties_go_to_larger_value() {
        assert_eq!(pick(&[node("₺0,50"), node("₺0,90")]), Some(0.90));
    }

    #[test]
    fn overlapping_patterns_do_not_split_numbers() {
        assert_eq!(pick(&[node("₺1.234,56")]), Some(1234.56));
        assert_eq!(pick(&[node("$1,234.56")]), Some(1234.56));
    }

    #[test]
    fn currency_far_away_does_not_count() {
        let text = format!("9.99{}TL", " ".repeat(40));
        assert_eq!(pick(&[node(&text)]), None);
    }
}
