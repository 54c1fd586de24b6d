use std::sync::LazyLock;

use regex::Regex;

static SYMBOL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[₺$€£]").unwrap());
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:^|[^a-z])(tl|try|usd|eur|gbp)(?:[^a-z]|$)").unwrap());
static NUMERAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-?\d[\d.,]*").unwrap());
static GROUP_SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d)[ \u{a0}\u{202f}](\d{3})\b").unwrap());

/// "<small-int> x <amount>" installment counts, e.g. `12x199,99` or `3 × 40.00`.
pub static INSTALLMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}\s*[xX×]\s*\d+(?:[.,]\d{2})?\b").unwrap());

/// Result of parsing free-form price text. `value: None` means "reject", never zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedPrice {
    pub value: Option<f64>,
    pub currency: Option<&'static str>,
}

/// Parse localized price text such as `₺1.234,56`, `1,234.56 USD` or `39,90 TL`.
///
/// The separator convention is decided per input: when exactly two digits follow
/// the last `,`/`.` that separator is the decimal point and every other
/// separator is thousands grouping. Otherwise all separators are grouping.
pub fn parse_price(text: &str) -> ParsedPrice {
    ParsedPrice {
        value: parse_value(text),
        currency: detect_currency(text),
    }
}

/// Numeric part of [`parse_price`].
pub fn parse_value(text: &str) -> Option<f64> {
    let text = join_space_groups(text);
    let raw = NUMERAL_RE.find(&text)?.as_str();
    numeral_value(raw)
}

/// ISO code of the first currency symbol or code found, case-insensitively.
pub fn detect_currency(text: &str) -> Option<&'static str> {
    let symbol = SYMBOL_RE.find(text).map(|m| (m.start(), m.as_str()));
    let code = CODE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| (m.start(), m.as_str()));

    let token = match (symbol, code) {
        (Some(s), Some(c)) => {
            if s.0 <= c.0 {
                s.1
            } else {
                c.1
            }
        }
        (Some(s), None) => s.1,
        (None, Some(c)) => c.1,
        (None, None) => return None,
    };

    match token.to_ascii_uppercase().as_str() {
        "₺" | "TL" | "TRY" => Some("TRY"),
        "$" | "USD" => Some("USD"),
        "€" | "EUR" => Some("EUR"),
        "£" | "GBP" => Some("GBP"),
        _ => None,
    }
}

/// True when the text carries any currency symbol or code.
pub fn has_currency(text: &str) -> bool {
    detect_currency(text).is_some()
}

/// Canonical display string: two fractional digits, `.` decimal, no grouping.
pub fn format_canonical(value: f64) -> String {
    format!("{:.2}", value)
}

/// Value rounded to integer cents. Used for equality so float noise never
/// registers as a price change.
pub fn to_cents(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

/// Rounds to cents and returns `(sell_price, sell_price_value)` satisfying
/// `sell_price_value == parse_value(sell_price)`. Rejects non-finite and
/// non-positive values.
pub fn canonical_pair(value: f64) -> Option<(String, f64)> {
    if !value.is_finite() {
        return None;
    }
    let text = format_canonical(value);
    let rounded = parse_value(&text)?;
    if rounded <= 0.0 {
        return None;
    }
    Some((text, rounded))
}

fn join_space_groups(text: &str) -> String {
    let mut out = text.to_string();
    // Each pass can only join every other group ("1 234 567"), so repeat.
    while GROUP_SPACE_RE.is_match(&out) {
        out = GROUP_SPACE_RE.replace_all(&out, "$1$2").into_owned();
    }
    out
}

fn numeral_value(raw: &str) -> Option<f64> {
    let negative = raw.starts_with('-');
    let body = raw.trim_start_matches('-').trim_end_matches(['.', ',']);
    let digits: String = body.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    let frac_len = match body.rfind(['.', ',']) {
        Some(idx) => match body.len() - idx - 1 {
            2 => 2,
            _ => 0,
        },
        None => 0,
    };

    let (int, frac) = digits.split_at(digits.len() - frac_len);
    let int = if int.is_empty() { "0" } else { int };
    let canonical = if frac.is_empty() {
        int.to_string()
    } else {
        format!("{}.{}", int, frac)
    };

    let value: f64 = canonical.parse().ok()?;
    let value = if negative { -value } else { value };
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_disambiguation() {
        assert_eq!(parse_value("1.234,56"), Some(1234.56));
        assert_eq!(parse_value("1,234.56"), Some(1234.56));
        assert_eq!(parse_value("39,90"), Some(39.90));
        assert_eq!(parse_value("39.90"), Some(39.90));
    }

    #[test]
    fn grouping_only_separators() {
        assert_eq!(parse_value("1.234"), Some(1234.0));
        assert_eq!(parse_value("12,345,678"), Some(12345678.0));
        assert_eq!(parse_value("7 023,80 TL"), Some(7023.80));
        assert_eq!(parse_value("1\u{a0}234\u{a0}567,00"), Some(1234567.0));
    }

    #[test]
    fn only_two_fraction_digits_are_decimal() {
        assert_eq!(parse_value("12,5"), Some(125.0));
        assert_eq!(parse_value("1.5 TL"), Some(15.0));
        assert_eq!(parse_value("12,50"), Some(12.5));
    }

    #[test]
    fn currency_symbols_and_codes() {
        let p = parse_price("₺39,90");
        assert_eq!(p.value, Some(39.90));
        assert_eq!(p.currency, Some("TRY"));

        assert_eq!(parse_price("199,99TL").currency, Some("TRY"));
        assert_eq!(parse_price("15.00 try").currency, Some("TRY"));
        assert_eq!(parse_price("$4.99").currency, Some("USD"));
        assert_eq!(parse_price("4,99 EUR").currency, Some("EUR"));
        assert_eq!(parse_price("£1").currency, Some("GBP"));
        assert_eq!(parse_price("1234").currency, None);
    }

    #[test]
    fn code_inside_word_is_not_currency() {
        assert_eq!(detect_currency("TLX gift card"), None);
        assert_eq!(detect_currency("entry pack"), None);
    }

    #[test]
    fn unparseable_is_none_not_zero() {
        let p = parse_price("Stok tükendi");
        assert_eq!(p.value, None);
        assert_eq!(parse_value(""), None);
        assert_eq!(parse_value(",."), None);
    }

    #[test]
    fn canonical_round_trip() {
        for v in [0.01, 0.1, 1.0, 29.9, 39.9, 199.99, 1234.56, 7023.8, 99999.99, 1_000_000.01] {
            let text = format_canonical(v);
            assert_eq!(parse_value(&text), Some(v), "round trip for {}", text);
        }
        assert_eq!(format_canonical(7023.8), "7023.80");
    }

    #[test]
    fn canonical_pair_rejects_non_positive() {
        assert_eq!(canonical_pair(29.9), Some(("29.90".to_string(), 29.9)));
        assert_eq!(canonical_pair(0.0), None);
        assert_eq!(canonical_pair(-5.0), None);
        assert_eq!(canonical_pair(f64::NAN), None);
        assert_eq!(canonical_pair(f64::INFINITY), None);
    }

    #[test]
    fn negative_values_are_signed() {
        assert_eq!(parse_value("-12,50"), Some(-12.5));
    }

    #[test]
    fn installment_pattern() {
        assert!(INSTALLMENT_RE.is_match("12x199,99 TL"));
        assert!(INSTALLMENT_RE.is_match("3 × 40.00"));
        assert!(!INSTALLMENT_RE.is_match("₺199,99"));
    }
}
