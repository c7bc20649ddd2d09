//! Title normalization and cross-provider identity keys.
//!
//! Everything here is pure and total: malformed input degrades to a weaker key,
//! it never panics.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::platform::PlatformFamily;

fn bracketed() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\([^)]*\)|\[[^\]]*\]|\{[^}]*\}").expect("bracket pattern is valid")
    })
}

/// Dedup key for titles across every cross-reference source.
///
/// Strips bracketed/parenthetical annotations, folds to ASCII, lowercases and
/// collapses non-alphanumeric runs to single spaces. Returns `None` only for
/// blank input; if stripping leaves nothing (e.g. a title that is entirely
/// non-Latin) the raw lowercase title is used instead.
pub fn normalize_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let without_annotations = bracketed().replace_all(trimmed, " ");
    let primary = collapse(&transliterate(&without_annotations));
    if !primary.is_empty() {
        return Some(primary);
    }
    let unbracketed = collapse(&transliterate(trimmed));
    if !unbracketed.is_empty() {
        return Some(unbracketed);
    }
    Some(trimmed.to_lowercase())
}

fn collapse(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            out.push(ch.to_ascii_lowercase());
            pending_space = false;
        } else {
            pending_space = true;
        }
    }
    out
}

/// URL-safe slug: ASCII-folded, lowercase, dash separated, no leading/trailing dashes.
pub fn slugify(input: &str) -> String {
    let folded = transliterate(input);
    let mut out = String::with_capacity(folded.len());
    let mut last_dash = false;
    for ch in folded.chars() {
        let c = ch.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Dedup key used by the aggregator: prefer the provider slug, fall back to the name.
pub fn dedupe_slug(slug: Option<&str>, name: &str) -> String {
    let from_slug = slug.map(slugify).filter(|s| !s.is_empty());
    from_slug.unwrap_or_else(|| slugify(name))
}

/// Stable identity hash for a Product.
///
/// `sha256(normalized title | release date or "unknown" | family or "unknown")`.
/// Provider-specific ids are deliberately absent so that two providers
/// describing the same title/date/family collapse onto one Product.
pub fn compute_uid(
    title: &str,
    release_date: Option<NaiveDate>,
    family: Option<PlatformFamily>,
) -> String {
    let name = normalize_name(title).unwrap_or_default();
    let date = release_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let family = family.map(|f| f.as_str()).unwrap_or("unknown");
    let digest = Sha256::digest(format!("{name}|{date}|{family}").as_bytes());
    format!("{:x}", digest)
}

/// Fold Latin diacritics and ligatures to ASCII. Characters without a mapping
/// are kept so the caller's separator logic can decide what to do with them.
pub fn transliterate(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii() {
            out.push(ch);
            continue;
        }
        match fold_char(ch) {
            Some(rep) => out.push_str(rep),
            None => out.push(ch),
        }
    }
    out
}

fn fold_char(ch: char) -> Option<&'static str> {
    let rep = match ch {
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => "A",
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'Æ' => "AE",
        'æ' => "ae",
        'Ç' | 'Ć' | 'Č' | 'Ĉ' => "C",
        'ç' | 'ć' | 'č' | 'ĉ' => "c",
        'Ð' | 'Đ' | 'Ď' => "D",
        'ð' | 'đ' | 'ď' => "d",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' | 'Ě' => "E",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'Ğ' | 'Ģ' => "G",
        'ğ' | 'ģ' => "g",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'İ' | 'Į' => "I",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'ı' | 'į' => "i",
        'Ł' | 'Ľ' | 'Ĺ' => "L",
        'ł' | 'ľ' | 'ĺ' => "l",
        'Ñ' | 'Ń' | 'Ň' => "N",
        'ñ' | 'ń' | 'ň' => "n",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => "O",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'Œ' => "OE",
        'œ' => "oe",
        'Ř' | 'Ŕ' => "R",
        'ř' | 'ŕ' => "r",
        'Ś' | 'Š' | 'Ş' | 'Ș' => "S",
        'ś' | 'š' | 'ş' | 'ș' => "s",
        'ß' => "ss",
        'Ť' | 'Ţ' | 'Ț' => "T",
        'ť' | 'ţ' | 'ț' => "t",
        'Þ' => "TH",
        'þ' => "th",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' | 'Ų' => "U",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => "u",
        'Ý' | 'Ÿ' => "Y",
        'ý' | 'ÿ' => "y",
        'Ź' | 'Ż' | 'Ž' => "Z",
        'ź' | 'ż' | 'ž' => "z",
        '‘' | '’' | 'ʼ' => "'",
        '“' | '”' => "\"",
        '–' | '—' => "-",
        _ => return None,
    };
    Some(rep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_annotations_case_and_punctuation() {
        assert_eq!(
            normalize_name("  Halo: Infinite (Campaign) [PC] ").as_deref(),
            Some("halo infinite")
        );
        assert_eq!(normalize_name("halo   infinite").as_deref(), Some("halo infinite"));
        assert_eq!(normalize_name("Pokémon™ Scarlet").as_deref(), Some("pokemon scarlet"));
        assert_eq!(normalize_name("Ōkami HD").as_deref(), Some("okami hd"));
    }

    #[test]
    fn normalization_is_total() {
        assert_eq!(normalize_name(""), None);
        assert_eq!(normalize_name("   "), None);
        assert_eq!(normalize_name("(Beta)").as_deref(), Some("beta"));
        assert_eq!(normalize_name("ファイナルファンタジー").as_deref(), Some("ファイナルファンタジー"));
    }

    #[test]
    fn slugs_collapse_separators() {
        assert_eq!(slugify("Halo: Infinite"), "halo-infinite");
        assert_eq!(slugify("halo infinite"), "halo-infinite");
        assert_eq!(slugify("--Déjà  Vu!!"), "deja-vu");
        assert_eq!(dedupe_slug(Some("Halo-Infinite"), "ignored"), "halo-infinite");
        assert_eq!(dedupe_slug(Some(""), "Halo: Infinite"), "halo-infinite");
        assert_eq!(dedupe_slug(None, "halo infinite"), "halo-infinite");
    }

    #[test]
    fn uid_is_stable_across_formatting_variants() {
        let date = NaiveDate::from_ymd_opt(2023, 9, 6);
        let a = compute_uid("Starfield", date, Some(PlatformFamily::Xbox));
        let b = compute_uid("  STARFIELD ", date, Some(PlatformFamily::Xbox));
        let c = compute_uid("starfield", date, Some(PlatformFamily::Xbox));
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 64);

        assert_ne!(a, compute_uid("Starfield", date, Some(PlatformFamily::Pc)));
        assert_ne!(a, compute_uid("Starfield", None, Some(PlatformFamily::Xbox)));
    }

    #[test]
    fn uid_matches_documented_preimage() {
        let expected = format!("{:x}", Sha256::digest(b"starfield|unknown|unknown"));
        assert_eq!(compute_uid("Starfield", None, None), expected);
    }
}
