use std::sync::LazyLock;

use regex::Regex;

/// Region qualifiers dropped from comparison keys (already folded to ASCII).
const NOISE_WORDS: &[&str] = &[
    "tr", "turkiye", "turkey", "turk", "global", "world", "worldwide", "server", "sunucu",
    "dunya", "bolge", "region", "int", "international",
];

static EMBEDDED_PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(₺\s*)?(\d{1,3}(?:[.,]\d{3})*|\d+)[.,]\d{2}(?:\s*(?:TL|TRY)\b|\b)").unwrap()
});
static BOILERPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(stokta var|stokta|stok tükendi|tükendi|tedarik aşamasında|sepete ekle|hemen al|satın al|şimdi al|add to cart|buy now|in stock|out of stock|sold out)\b",
    )
    .unwrap()
});
static UNIT_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[/|]\s*(adet|birim|unit|pcs)\b").unwrap());
static COUNT_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(\d+\)\s*$").unwrap());

/// Locale fold: Turkish dotted/dotless i and common diacritics map to ASCII,
/// everything lowercased.
pub fn fold(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'İ' | 'I' | 'ı' | 'î' | 'Î' => out.push('i'),
            'Ş' | 'ş' => out.push('s'),
            'Ğ' | 'ğ' => out.push('g'),
            'Ü' | 'ü' | 'û' | 'Û' => out.push('u'),
            'Ö' | 'ö' => out.push('o'),
            'Ç' | 'ç' => out.push('c'),
            'Â' | 'â' => out.push('a'),
            '\u{307}' => {}
            _ => out.extend(c.to_lowercase()),
        }
    }
    out
}

/// Comparison key used to match listings of the same logical product.
///
/// Insensitive to case, Turkish casing, region words and incidental
/// punctuation. Keeps digits, `+`, and `.` between digits so denominations
/// such as `600 UC` and `6000 UC` stay distinct.
pub fn normalize_key(title: &str) -> String {
    let folded: Vec<char> = fold(title).chars().collect();
    let mut cleaned = String::with_capacity(folded.len());

    for (i, &c) in folded.iter().enumerate() {
        let keep = match c {
            '+' => true,
            '.' => {
                let prev = i.checked_sub(1).and_then(|p| folded.get(p));
                let next = folded.get(i + 1);
                matches!((prev, next), (Some(p), Some(n)) if p.is_ascii_digit() && n.is_ascii_digit())
            }
            c => c.is_alphanumeric(),
        };
        cleaned.push(if keep { c } else { ' ' });
    }

    cleaned
        .split_whitespace()
        .filter(|w| !NOISE_WORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Human-facing item name: boilerplate, embedded prices and repeated
/// denomination suffixes removed. Never used for key derivation.
pub fn sanitize_display(title: &str) -> String {
    let s = EMBEDDED_PRICE_RE.replace_all(title, " ");
    let s = BOILERPLATE_RE.replace_all(&s, " ");
    let s = UNIT_LABEL_RE.replace_all(&s, " ");
    let s = COUNT_SUFFIX_RE.replace(&s, " ");

    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    trim_separators(&mut tokens);
    drop_repeated_suffix(&mut tokens);
    trim_separators(&mut tokens);
    tokens.join(" ")
}

fn is_separator(token: &str) -> bool {
    token.chars().all(|c| matches!(c, '-' | '–' | '—' | '|' | '/' | ':' | '·'))
}

fn trim_separators(tokens: &mut Vec<&str>) {
    while tokens.last().is_some_and(|t| is_separator(t)) {
        tokens.pop();
    }
    while tokens.first().is_some_and(|t| is_separator(t)) {
        tokens.remove(0);
    }
}

/// "PUBG Mobile 60 UC - 60 UC" -> "PUBG Mobile 60 UC".
fn drop_repeated_suffix(tokens: &mut Vec<&str>) {
    for k in [2usize, 1] {
        if tokens.len() <= k {
            continue;
        }
        let split = tokens.len() - k;
        let tail = &tokens[split..];
        if !tail[0].chars().all(|c| c.is_ascii_digit() || c == '.') {
            continue;
        }
        let head: Vec<&str> = tokens[..split]
            .iter()
            .copied()
            .filter(|t| !is_separator(t))
            .collect();
        let repeated = head.windows(k).any(|w| {
            w.iter()
                .zip(tail)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
        });
        if repeated {
            tokens.truncate(split);
            return;
        }
    }
}
