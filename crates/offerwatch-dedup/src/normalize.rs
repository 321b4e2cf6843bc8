//! Raw offer -> comparison key.

use std::collections::HashSet;

use offerwatch_core::{NormalizedKey, RawOffer};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Marketing tokens dropped from titles ("okazja", "hit", ...).
    pub boilerplate_tokens: Vec<String>,
    /// Currency words dropped from titles, also stripped as a suffix of numbers ("999zł").
    pub currency_tokens: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        let boilerplate = [
            "okazja", "promocja", "promo", "hit", "mega", "super", "wyprzedaz", "wyprzedaż",
            "tanio", "bestseller", "nowosc", "nowość", "sale", "deal", "hot", "bargain",
        ];
        let currency = ["zl", "zł", "pln", "eur", "euro", "usd", "gbp"];
        Self {
            boilerplate_tokens: boilerplate.iter().map(|s| s.to_string()).collect(),
            currency_tokens: currency.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Pure, infallible key derivation. Malformed input produces a best-effort key.
#[derive(Debug, Clone)]
pub struct Normalizer {
    boilerplate: HashSet<String>,
    currencies: Vec<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&NormalizerConfig::default())
    }
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        let mut currencies: Vec<String> = config
            .currency_tokens
            .iter()
            .map(|t| t.to_lowercase())
            .collect();
        // longest first so "euro" wins over "eur" when stripping suffixes
        currencies.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
        Self {
            boilerplate: config
                .boilerplate_tokens
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
            currencies,
        }
    }

    pub fn normalize(&self, offer: &RawOffer) -> NormalizedKey {
        let mut title_key = self.title_key(&offer.title);
        if title_key.is_empty() {
            let link = offer.link.trim().to_lowercase();
            if !link.is_empty() {
                title_key = format!("link:{link}");
            }
        }

        let price_cents = offer.price_text.as_deref().and_then(|text| {
            let parsed = parse_price_cents(text);
            if parsed.is_none() && !text.trim().is_empty() {
                debug!(link = %offer.link, price_text = text, "unparsable price; treating as unknown");
            }
            parsed
        });

        NormalizedKey {
            title_key,
            price_cents,
        }
    }

    pub fn title_key(&self, title: &str) -> String {
        let lowered = title.to_lowercase();
        let spaced: String = lowered
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        let tokens: Vec<&str> = spaced.split_whitespace().collect();

        let kept: Vec<String> = tokens
            .iter()
            .filter(|t| !self.boilerplate.contains(**t) && !self.currencies.iter().any(|c| c == **t))
            .map(|t| self.strip_currency_suffix(t))
            .collect();

        if kept.is_empty() {
            // a title made only of noise still needs to distinguish itself
            return tokens.join(" ");
        }
        kept.join(" ")
    }

    fn strip_currency_suffix(&self, token: &str) -> String {
        for currency in &self.currencies {
            if let Some(prefix) = token.strip_suffix(currency.as_str()) {
                if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) {
                    return prefix.to_string();
                }
            }
        }
        token.to_string()
    }
}

fn is_group_separator(c: char) -> bool {
    matches!(c, ' ' | '\u{a0}' | '\u{202f}' | '\'' | '.' | ',')
}

/// Parse the first price-like number in `text` into minor units.
///
/// A trailing `.` or `,` followed by one or two digits is the decimal mark; every other
/// separator (spaces, apostrophes, three-digit groups) is a thousands separator.
/// Numbers followed by `%` are discounts and are skipped.
pub fn parse_price_cents(text: &str) -> Option<i64> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }

        let start = i;
        let mut end = i;
        while end < chars.len() {
            let c = chars[end];
            if c.is_ascii_digit() {
                end += 1;
            } else if is_group_separator(c) && chars.get(end + 1).is_some_and(|n| n.is_ascii_digit()) {
                end += 1;
            } else {
                break;
            }
        }

        let rest = chars[end..].iter().find(|c| !c.is_whitespace());
        if rest == Some(&'%') {
            i = end;
            continue;
        }

        let run: String = chars[start..end]
            .iter()
            .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}' | '\''))
            .collect();
        return run_to_cents(&run);
    }
    None
}

fn run_to_cents(run: &str) -> Option<i64> {
    let (integer, fraction) = match run.rfind(|c: char| c == '.' || c == ',') {
        Some(pos) => {
            let tail = &run[pos + 1..];
            if (1..=2).contains(&tail.len()) {
                (&run[..pos], tail)
            } else {
                (run, "")
            }
        }
        None => (run, ""),
    };

    let mut units: i64 = 0;
    for c in integer.chars().filter(|c| c.is_ascii_digit()) {
        let digit = i64::from(c.to_digit(10)?);
        units = units.checked_mul(10)?.checked_add(digit)?;
    }

    let cents = match fraction.len() {
        0 => 0,
        1 => i64::from(fraction.parse::<u8>().ok()?) * 10,
        _ => i64::from(fraction.parse::<u8>().ok()?),
    };
    units.checked_mul(100)?.checked_add(cents)
}
