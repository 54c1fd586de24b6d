use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use super::{Listing, PriceNode};
use crate::error::TaskError;
use crate::price;
use crate::title::fold;

/// One product entry of a merchant feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedEntry {
    pub title: String,
    pub price: String,
    pub sale_price: String,
    pub brand: String,
    pub product_type: String,
    pub link: Option<String>,
}

impl FeedEntry {
    /// The entry as a listing for the selector. Both price fields are structural
    /// prices; a usable `sale_price` demotes `price` to the old list price.
    pub fn listing(&self) -> Listing {
        let on_sale = price::parse_value(&self.sale_price).is_some_and(|v| v > 0.0);
        let mut nodes = vec![PriceNode {
            price_class: true,
            old_class: on_sale,
            ..PriceNode::plain(&self.price)
        }];
        if on_sale {
            nodes.push(PriceNode {
                price_class: true,
                ..PriceNode::plain(&self.sale_price)
            });
        }
        Listing {
            title: self.title.clone(),
            url: self.link.clone(),
            nodes,
        }
    }
}

/// Sends feed entries of one game into its category pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRoute {
    pub game: String,
    /// Matched against brand, product type and title after folding.
    pub keywords: Vec<String>,
    /// Entries land in `<base>-tr` or `<base>-global`.
    pub category_base: String,
}

#[derive(Clone, Copy)]
enum Field {
    Title,
    Price,
    SalePrice,
    Brand,
    ProductType,
    Link,
}

impl Field {
    fn from_local_name(name: &[u8]) -> Option<Self> {
        match name {
            b"title" => Some(Field::Title),
            b"price" => Some(Field::Price),
            b"sale_price" => Some(Field::SalePrice),
            b"brand" => Some(Field::Brand),
            b"product_type" => Some(Field::ProductType),
            b"link" => Some(Field::Link),
            _ => None,
        }
    }
}

/// Parse RSS `item` (or Atom `entry`) elements. Field names match without
/// their namespace prefix, so `g:price` and `price` are the same field.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, TaskError> {
    let mut reader = Reader::from_str(xml);
    let mut entries = Vec::new();
    let mut current: Option<FeedEntry> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"item" | b"entry" => current = Some(FeedEntry::default()),
                name if current.is_some() => {
                    field = Field::from_local_name(name);
                    text.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if current.is_some() && e.local_name().as_ref() == b"link" => {
                if let (Some(entry), Ok(Some(href))) = (current.as_mut(), e.try_get_attribute("href")) {
                    entry.link = Some(String::from_utf8_lossy(&href.value).into_owned());
                }
            }
            Ok(Event::Text(e)) if field.is_some() => {
                let chunk = e.unescape().map_err(|err| TaskError::Feed(err.to_string()))?;
                text.push_str(&chunk);
            }
            Ok(Event::CData(e)) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"item" | b"entry" => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                    field = None;
                }
                _ => {
                    if let (Some(entry), Some(f)) = (current.as_mut(), field.take()) {
                        assign(entry, f, text.trim());
                    }
                }
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(TaskError::Feed(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(entries)
}

/// First non-empty value wins; feeds often repeat `title` and `g:title`.
fn assign(entry: &mut FeedEntry, field: Field, value: &str) {
    if value.is_empty() {
        return;
    }
    let slot = match field {
        Field::Title => &mut entry.title,
        Field::Price => &mut entry.price,
        Field::SalePrice => &mut entry.sale_price,
        Field::Brand => &mut entry.brand,
        Field::ProductType => &mut entry.product_type,
        Field::Link => {
            if entry.link.is_none() {
                entry.link = Some(value.to_string());
            }
            return;
        }
    };
    if slot.is_empty() {
        *slot = value.to_string();
    }
}

/// Category for an entry, or `None` when no route claims it.
pub fn route(entry: &FeedEntry, routes: &[FeedRoute]) -> Option<String> {
    let haystack = fold(&format!(
        "{} {} {}",
        entry.brand, entry.product_type, entry.title
    ));
    let matched = routes.iter().find(|r| {
        r.keywords
            .iter()
            .map(|k| fold(k))
            .any(|k| !k.is_empty() && haystack.contains(&k))
    })?;

    let region = if fold(&entry.title).contains("global") {
        "global"
    } else {
        "tr"
    };
    Some(format!("{}-{}", matched.category_base, region))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::select::{select_price, SelectorPolicy};

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:g="http://base.google.com/ns/1.0">
  <channel>
    <title>Dijital Kodlar</title>
    <link>https://shop.example.com</link>
    <item>
      <g:title><![CDATA[PUBG Mobile 60 UC]]></g:title>
      <title>ignored duplicate</title>
      <g:price>29.90 TRY</g:price>
      <g:brand>PUBG Mobile</g:brand>
      <g:product_type>Oyun &gt; E-Pin</g:product_type>
      <link>https://shop.example.com/pubg-60</link>
    </item>
    <item>
      <g:title>Mobile Legends Global 100 Elmas</g:title>
      <g:price>45,00 TRY</g:price>
      <g:sale_price>39,90 TRY</g:sale_price>
      <g:brand>Moonton</g:brand>
    </item>
    <item>
      <g:title>Steam Cüzdan 100 TL</g:title>
      <g:price>100.00 TRY</g:price>
    </item>
  </channel>
</rss>"#;

    fn routes() -> Vec<FeedRoute> {
        vec![
            FeedRoute {
                game: "pubgm".into(),
                keywords: vec!["pubg".into()],
                category_base: "dijipin-pubgm".into(),
            },
            FeedRoute {
                game: "mlbb".into(),
                keywords: vec!["mobile legends".into(), "mlbb".into()],
                category_base: "dijipin-mlbb".into(),
            },
        ]
    }

    #[test]
    fn parses_namespaced_items() {
        let entries = parse_feed(FEED).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].title, "PUBG Mobile 60 UC");
        assert_eq!(entries[0].price, "29.90 TRY");
        assert_eq!(entries[0].product_type, "Oyun > E-Pin");
        assert_eq!(entries[0].link.as_deref(), Some("https://shop.example.com/pubg-60"));
    }

    #[test]
    fn sale_price_wins_over_list_price() {
        let entries = parse_feed(FEED).unwrap();
        let policy = SelectorPolicy::default();
        let pick = |e: &FeedEntry| select_price(&e.listing().nodes, &policy).map(|s| s.raw);
        assert_eq!(pick(&entries[1]).as_deref(), Some("39,90"));
        assert_eq!(pick(&entries[0]).as_deref(), Some("29.90"));
        assert!(entries[1].listing().nodes[0].old_class);
    }

    #[test]
    fn routes_by_keyword_and_region() {
        let entries = parse_feed(FEED).unwrap();
        let routes = routes();
        assert_eq!(route(&entries[0], &routes).as_deref(), Some("dijipin-pubgm-tr"));
        assert_eq!(route(&entries[1], &routes).as_deref(), Some("dijipin-mlbb-global"));
        assert_eq!(route(&entries[2], &routes), None);
    }

    #[test]
    fn malformed_feed_is_an_error() {
        assert!(parse_feed("<rss><channel><item><title>x</item></channel>").is_err());
    }

    #[test]
    fn atom_entries_with_href_links() {
        let xml = r#"<feed><entry><title>60 UC</title><price>₺29,90</price><link href="https://a.example/60"/></entry></feed>"#;
        let entries = parse_feed(xml).unwrap();
        assert_eq!(entries[0].link.as_deref(), Some("https://a.example/60"));
        assert_eq!(entries[0].price, "₺29,90");
    }
}
