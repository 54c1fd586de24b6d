use std::sync::LazyLock;

use regex::Regex;

use super::{Listing, PriceNode};
use crate::price;

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#{1,6}\s+(.+)$").unwrap());
static SINGLE_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^\]]*)\]\(([^)\s]+)[^)]*\)$").unwrap());
static BOLD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\*\*([^*]+)\*\*$").unwrap());
static INLINE_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static WHOLE_STRIKE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[*_\s]*~~[^~]+~~[*_\s]*$").unwrap());

static PRICE_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(fiyat\w*|price|indirim\w*|sale|new|final|satış fiyatı)\b").unwrap()
});
static OLD_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(eski fiyat|old price|liste fiyatı|list price|was)\b").unwrap()
});
static CTA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(sepete ekle|satın al|hemen al|incele|detay\w*|add to cart|buy now|view)$")
        .unwrap()
});
static JUNK_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(nedir|nasıl|yapımcısı|app ?store|buradasın|çerez|cookie|ayarlar|analitik|pazarlama|kvkk|geri dön|sıkça sorulan|\bfaq\b|giriş yap|üye ol|sepetim|kategoriler)",
    )
    .unwrap()
});
static OUT_OF_STOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(stokta yok|stok tükendi|tükendi|tedarik aşamasında|out of stock|sold out)")
        .unwrap()
});

/// Split page markdown into product listings.
///
/// A heading, standalone link or bold line opens a listing and becomes its title.
/// Lines until the next title are its price nodes.
pub fn listings(markdown: &str) -> Vec<Listing> {
    let cleaned = strip_images(markdown);
    let mut out = Vec::new();
    let mut current: Option<(Listing, bool)> = None;

    for raw in cleaned.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some((title, url)) = title_line(line) {
            flush(current.take(), &mut out);
            let mut listing = Listing {
                title,
                url,
                nodes: Vec::new(),
            };
            // Cards often render "60 UC ₺29,90" as one link.
            if price::has_currency(&listing.title) {
                listing.nodes.push(PriceNode::plain(&listing.title));
            }
            current = Some((listing, false));
            continue;
        }

        if let Some((listing, out_of_stock)) = current.as_mut() {
            if OUT_OF_STOCK_RE.is_match(line) {
                *out_of_stock = true;
            }
            listing.nodes.push(price_node(line));
        }
    }
    flush(current, &mut out);
    out
}

/// Remove markdown image syntax: ![alt](url) and [![alt](url)](link)
pub fn strip_images(md: &str) -> String {
    let cleaned = IMAGE_RE.replace_all(md, "");
    BLANKS_RE.replace_all(&cleaned, "\n\n").to_string()
}

fn title_line(line: &str) -> Option<(String, Option<String>)> {
    let (text, url) = if let Some(caps) = HEADING_RE.captures(line) {
        let inner = caps[1].trim();
        match SINGLE_LINK_RE.captures(inner) {
            Some(link) => (link[1].to_string(), Some(link[2].to_string())),
            None => (inner.to_string(), None),
        }
    } else if let Some(caps) = SINGLE_LINK_RE.captures(line) {
        (caps[1].to_string(), Some(caps[2].to_string()))
    } else if let Some(caps) = BOLD_RE.captures(line) {
        (caps[1].to_string(), None)
    } else {
        return None;
    };

    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() || CTA_RE.is_match(&text) || !text.chars().any(|c| c.is_alphabetic()) {
        return None;
    }
    Some((text, url))
}

fn price_node(line: &str) -> PriceNode {
    let text = INLINE_LINK_RE.replace_all(line, "$1").to_string();
    PriceNode {
        struck: WHOLE_STRIKE_RE.is_match(&text),
        price_class: PRICE_LABEL_RE.is_match(&text),
        old_class: OLD_LABEL_RE.is_match(&text),
        text,
    }
}

fn flush(current: Option<(Listing, bool)>, out: &mut Vec<Listing>) {
    let Some((listing, out_of_stock)) = current else {
        return;
    };
    if out_of_stock || listing.nodes.is_empty() || JUNK_TITLE_RE.is_match(&listing.title) {
        return;
    }
    out.push(listing);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::select::{select_price, SelectorPolicy};

    const PAGE: &str = "\
# PUBG Mobile UC

![banner](https://cdn.example.com/b.png)

### [60 UC](https://shop.example.com/60-uc)
~~₺39,90~~
₺29,90
[Sepete Ekle](https://shop.example.com/cart?add=1)

### [325 UC](https://shop.example.com/325-uc)
Fiyat: ₺149,90
12x12,49 TL taksit

### [660 UC](https://shop.example.com/660-uc)
₺299,90
Stok Tükendi

## Çerez Ayarları
Bu sitede ₺0,00 çerez kullanılır
";

    #[test]
    fn splits_cards_and_drops_noise() {
        let found = listings(PAGE);
        let titles: Vec<_> = found.iter().map(|l| l.title.as_str()).collect();
        assert_eq!(titles, ["60 UC", "325 UC"]);
        assert_eq!(found[0].url.as_deref(), Some("https://shop.example.com/60-uc"));
    }

    #[test]
    fn marks_struck_and_labelled_nodes() {
        let found = listings(PAGE);
        let nodes = &found[0].nodes;
        assert!(nodes[0].struck);
        assert!(!nodes[1].struck);
        assert_eq!(nodes[2].text, "Sepete Ekle");
        assert!(found[1].nodes[0].price_class);
    }

    #[test]
    fn cards_select_current_price() {
        let found = listings(PAGE);
        let policy = SelectorPolicy::default();
        let prices: Vec<_> = found
            .iter()
            .map(|l| select_price(&l.nodes, &policy).map(|s| s.value))
            .collect();
        assert_eq!(prices, [Some(29.90), Some(149.90)]);
    }

    #[test]
    fn price_inside_title_link_counts() {
        let found = listings("[100 Elmas ₺39,90](https://x.example/100)");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].nodes[0].text, "100 Elmas ₺39,90");
    }

    #[test]
    fn lines_before_first_title_are_ignored() {
        assert!(listings("₺10,00\n₺20,00").is_empty());
    }

    #[test]
    fn strip_images_removes_markup() {
        assert_eq!(strip_images("a ![x](y.png) b"), "a  b");
    }
}
