use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::price;
use crate::title;

/// Identity of a current record: one row per (site, category, normalized title).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub site_name: String,
    pub category_name: String,
    pub item_key: String,
}

/// A normalized observation on its way into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub site_name: String,
    pub category_name: String,
    pub item_name: String,
    pub sell_price: String,
    pub sell_price_value: f64,
    pub currency: String,
    pub url: String,
}

impl NewRecord {
    /// Build from a selected price. Returns `None` for non-finite or non-positive values.
    pub fn from_value(
        site_name: &str,
        category_name: &str,
        raw_title: &str,
        value: f64,
        currency: &str,
        url: &str,
    ) -> Option<Self> {
        let (sell_price, sell_price_value) = price::canonical_pair(value)?;
        Some(NewRecord {
            site_name: site_name.trim().to_string(),
            category_name: category_name.trim().to_string(),
            item_name: title::sanitize_display(raw_title),
            sell_price,
            sell_price_value,
            currency: currency.to_string(),
            url: url.to_string(),
        })
    }

    /// Checks the store-boundary rules and derives the record's key.
    pub fn validate(&self) -> Result<RecordKey, ValidationError> {
        for (field, value) in [
            ("siteName", &self.site_name),
            ("categoryName", &self.category_name),
            ("itemName", &self.item_name),
            ("sellPrice", &self.sell_price),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(field));
            }
        }

        let v = self.sell_price_value;
        if !v.is_finite() {
            return Err(ValidationError::NonFinitePrice);
        }
        if v <= 0.0 {
            return Err(ValidationError::NonPositivePrice(v));
        }
        if price::parse_value(&self.sell_price) != Some(v) {
            return Err(ValidationError::PriceMismatch {
                text: self.sell_price.clone(),
                value: v,
            });
        }

        let item_key = title::normalize_key(&self.item_name);
        if item_key.is_empty() {
            return Err(ValidationError::EmptyKey(self.item_name.clone()));
        }

        Ok(RecordKey {
            site_name: self.site_name.trim().to_string(),
            category_name: self.category_name.trim().to_string(),
            item_key,
        })
    }
}

/// The single authoritative price for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    #[serde(flatten)]
    pub key: RecordKey,
    pub item_name: String,
    pub sell_price: String,
    pub sell_price_value: f64,
    pub currency: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PriceRecord {
    pub fn first_seen(key: RecordKey, new: &NewRecord, now: DateTime<Utc>) -> Self {
        PriceRecord {
            key,
            item_name: new.item_name.clone(),
            sell_price: new.sell_price.clone(),
            sell_price_value: new.sell_price_value,
            currency: new.currency.clone(),
            url: new.url.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Next current state: new observation, original `created_at`.
    pub fn superseded_by(&self, new: &NewRecord, now: DateTime<Utc>) -> Self {
        PriceRecord {
            key: self.key.clone(),
            item_name: new.item_name.clone(),
            sell_price: new.sell_price.clone(),
            sell_price_value: new.sell_price_value,
            currency: new.currency.clone(),
            url: new.url.clone(),
            created_at: self.created_at,
            updated_at: now,
        }
    }

    pub fn archive(&self, archived_at: DateTime<Utc>) -> ArchivedPriceRecord {
        ArchivedPriceRecord {
            record: self.clone(),
            archived_at,
        }
    }

    pub fn cents(&self) -> i64 {
        price::to_cents(self.sell_price_value)
    }
}

/// Immutable snapshot of a superseded current record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedPriceRecord {
    #[serde(flatten)]
    pub record: PriceRecord,
    pub archived_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NewRecord {
        NewRecord::from_value(
            "oyuneks",
            "oyuneks-mlbb-tr",
            "Mobile Legends 100 Elmas Sepete Ekle",
            39.9,
            "TRY",
            "https://example.com/mlbb",
        )
        .unwrap()
    }

    #[test]
    fn from_value_canonicalizes() {
        let r = sample();
        assert_eq!(r.sell_price, "39.90");
        assert_eq!(r.sell_price_value, 39.9);
        assert_eq!(r.item_name, "Mobile Legends 100 Elmas");
        assert!(NewRecord::from_value("s", "c", "t", 0.0, "TRY", "u").is_none());
    }

    #[test]
    fn validate_derives_key() {
        let key = sample().validate().unwrap();
        assert_eq!(key.site_name, "oyuneks");
        assert_eq!(key.item_key, "mobile legends 100 elmas");
    }

    #[test]
    fn validate_rejects_bad_fields() {
        let mut r = sample();
        r.category_name = "   ".into();
        assert_eq!(r.validate(), Err(ValidationError::EmptyField("categoryName")));

        let mut r = sample();
        r.sell_price_value = f64::NAN;
        assert_eq!(r.validate(), Err(ValidationError::NonFinitePrice));

        let mut r = sample();
        r.sell_price_value = -1.0;
        assert_eq!(r.validate(), Err(ValidationError::NonPositivePrice(-1.0)));

        let mut r = sample();
        r.sell_price = "41.00".into();
        assert!(matches!(r.validate(), Err(ValidationError::PriceMismatch { .. })));

        let mut r = sample();
        r.item_name = "Global TR".into();
        assert!(matches!(r.validate(), Err(ValidationError::EmptyKey(_))));
    }
}
