use std::collections::HashMap;

use serde_json::Value;

/// Strategy describing how to interpret a rating field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RatingStrategy {
    /// Value is a 0-5 float (RAWG user rating).
    ZeroToFive,
    /// Value is a 0-10 float.
    ZeroToTen,
    /// Value is already 0-100 (Metacritic style).
    ZeroToHundred,
    /// Value is a string like "4.5 stars" or "E - Everyone 4.5/5".
    StarString,
}

impl RatingStrategy {
    fn scale(&self) -> f64 {
        match self {
            RatingStrategy::ZeroToFive | RatingStrategy::StarString => 20.0,
            RatingStrategy::ZeroToTen => 10.0,
            RatingStrategy::ZeroToHundred => 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RatingAlias {
    pub field: &'static str,
    pub strategy: RatingStrategy,
}

impl RatingAlias {
    pub const fn new(field: &'static str, strategy: RatingStrategy) -> Self {
        Self { field, strategy }
    }
}

/// Maps provider payloads onto the catalogue rating scale [0, 100].
///
/// Each provider may register several aliases; the first field present with a
/// usable value wins.
#[derive(Debug, Default, Clone)]
pub struct RatingMapper {
    aliases: HashMap<String, Vec<RatingAlias>>,
}

impl RatingMapper {
    pub fn with_defaults() -> Self {
        Self::default()
            .register(
                "rawg",
                RatingAlias::new("metacritic", RatingStrategy::ZeroToHundred),
            )
            .register("rawg", RatingAlias::new("rating", RatingStrategy::ZeroToFive))
            .register(
                "nexarda",
                RatingAlias::new("rating", RatingStrategy::ZeroToHundred),
            )
            .register(
                "itad",
                RatingAlias::new("review_score", RatingStrategy::ZeroToHundred),
            )
            .register("tgdb", RatingAlias::new("rating", RatingStrategy::StarString))
            .register(
                "giantbomb",
                RatingAlias::new("score", RatingStrategy::ZeroToFive),
            )
    }

    /// Append an alias for a provider key.
    pub fn register(mut self, provider_key: impl Into<String>, alias: RatingAlias) -> Self {
        self.aliases
            .entry(provider_key.into().to_ascii_lowercase())
            .or_default()
            .push(alias);
        self
    }

    /// Map the given payload into a 0-100 rating, or `None` when no alias
    /// yields an in-range value.
    pub fn map(&self, provider_key: &str, payload: &Value) -> Option<f64> {
        let aliases = self.aliases.get(&provider_key.to_ascii_lowercase())?;
        aliases.iter().find_map(|alias| {
            let value = payload.get(alias.field)?;
            let raw = match alias.strategy {
                RatingStrategy::StarString => match value {
                    Value::String(s) => parse_star_string(s)?,
                    other => numeric(other)?,
                },
                _ => numeric(value)?,
            };
            let scaled = raw * alias.strategy.scale();
            // zero means "unrated" for every provider we ingest
            if scaled > 0.0 && scaled <= 100.0 {
                Some((scaled * 100.0).round() / 100.0)
            } else {
                None
            }
        })
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Pull the first decimal number out of a free-text rating. "x/10" style
/// denominators are rescaled onto five stars.
fn parse_star_string(input: &str) -> Option<f64> {
    let start = input.find(|c: char| c.is_ascii_digit())?;
    let rest = &input[start..];
    let digits: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value = digits.parse::<f64>().ok()?;
    let after = rest[digits.len()..].trim_start();
    if let Some(denominator) = after.strip_prefix('/') {
        let den: String = denominator
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let den = den.parse::<f64>().ok().filter(|d| *d > 0.0)?;
        return Some(value / den * 5.0);
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rawg_prefers_metacritic_then_user_rating() {
        let mapper = RatingMapper::with_defaults();
        assert_eq!(
            mapper.map("rawg", &json!({"metacritic": 86, "rating": 4.1})),
            Some(86.0)
        );
        assert_eq!(
            mapper.map("rawg", &json!({"metacritic": null, "rating": 4.1})),
            Some(82.0)
        );
        assert_eq!(mapper.map("RAWG", &json!({"rating": 0})), None);
    }

    #[test]
    fn star_strings_are_parsed() {
        let mapper = RatingMapper::with_defaults();
        assert_eq!(mapper.map("tgdb", &json!({"rating": "4.5 stars"})), Some(90.0));
        assert_eq!(mapper.map("tgdb", &json!({"rating": "7/10"})), Some(70.0));
        assert_eq!(mapper.map("tgdb", &json!({"rating": "Not Rated"})), None);
    }

    #[test]
    fn rejects_out_of_bounds_values() {
        let mapper = RatingMapper::with_defaults();
        assert!(mapper.map("rawg", &json!({"rating": 7.5})).is_none());
        assert!(mapper.map("unknown", &json!({"rating": 3})).is_none());
    }

    #[test]
    fn allows_custom_alias() {
        let mapper = RatingMapper::default().register(
            "custom",
            RatingAlias::new("score", RatingStrategy::ZeroToTen),
        );
        assert_eq!(mapper.map("custom", &json!({"score": "8.5"})), Some(85.0));
    }
}
