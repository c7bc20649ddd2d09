//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;
use tracing::{info, warn};

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        // Working directory first, then the manifest dir.
        if dotenv::dotenv().is_err() {
            let candidate = format!("{}/.env", env!("CARGO_MANIFEST_DIR"));
            let _ = dotenv::from_filename(candidate);
        }
    });
}

/// Common bootstrap for CLI binaries: load dotenv and report which storage
/// backend the process will end up with.
pub fn bootstrap_cli(bin_name: &str) {
    init_env();
    if db_url().is_some() {
        info!(target = "bootstrap", bin = bin_name, "database URL detected");
    } else {
        warn!(
            target = "bootstrap",
            bin = bin_name,
            "no database URL configured; stores will be in-memory for this process"
        );
    }
}

/// Get required env var; error if missing.
pub fn env_req(key: &str) -> anyhow::Result<String> {
    init_env();
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env var {key}"))
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback. Unparseable values fall back to the
/// default with a warning so a typo never silently becomes zero.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Clone,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(env_key = key, raw_value = %raw, "invalid env value; using default");
                default
            }
        },
        _ => default,
    }
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    init_env();
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        _ => default,
    }
}

/// Optional parsed value.
pub fn env_parse_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    init_env();
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Comma separated list; empty items are dropped. `None` when unset so callers
/// can tell "not configured" from "configured empty".
pub fn env_list(key: &str) -> Option<Vec<String>> {
    init_env();
    std::env::var(key).ok().map(|raw| split_list(&raw))
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Database URL, first match wins.
pub fn db_url() -> Option<String> {
    for k in ["INGEST_DATABASE_URL", "DATABASE_URL", "DB_URL"] {
        if let Some(v) = env_opt(k) {
            return Some(v);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_trims_and_drops_empty_items() {
        assert_eq!(
            split_list(" rawg, ,nexarda_feed ,,tgdb_mirror"),
            vec!["rawg", "nexarda_feed", "tgdb_mirror"]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("CATALOGUE_INGEST_TEST_PARSE", "not-a-number");
        assert_eq!(env_parse("CATALOGUE_INGEST_TEST_PARSE", 7u32), 7);
        std::env::set_var("CATALOGUE_INGEST_TEST_PARSE", " 12 ");
        assert_eq!(env_parse("CATALOGUE_INGEST_TEST_PARSE", 7u32), 12);
        std::env::remove_var("CATALOGUE_INGEST_TEST_PARSE");
    }
}
