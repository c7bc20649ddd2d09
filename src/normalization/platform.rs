use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strsim::jaro_winkler;

/// Minimum similarity score (Jaro-Winkler) required for two platform names
/// to be treated as equivalent.
pub const MIN_PLATFORM_SIMILARITY: f64 = 0.80;

/// Coarse platform bucket used for identity hashing and source targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PlatformFamily {
    Playstation,
    Xbox,
    Nintendo,
    Pc,
    Mobile,
    Sega,
    Arcade,
    Retro,
}

impl PlatformFamily {
    pub const ALL: [PlatformFamily; 8] = [
        PlatformFamily::Playstation,
        PlatformFamily::Xbox,
        PlatformFamily::Nintendo,
        PlatformFamily::Pc,
        PlatformFamily::Mobile,
        PlatformFamily::Sega,
        PlatformFamily::Arcade,
        PlatformFamily::Retro,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformFamily::Playstation => "playstation",
            PlatformFamily::Xbox => "xbox",
            PlatformFamily::Nintendo => "nintendo",
            PlatformFamily::Pc => "pc",
            PlatformFamily::Mobile => "mobile",
            PlatformFamily::Sega => "sega",
            PlatformFamily::Arcade => "arcade",
            PlatformFamily::Retro => "retro",
        }
    }

    /// Keywords that place a platform label into this family. Multi-word
    /// keywords are matched on token boundaries.
    fn keywords(&self) -> &'static [&'static str] {
        match self {
            PlatformFamily::Retro => &[
                "pc engine",
                "pc 98",
                "pc 88",
                "atari",
                "commodore",
                "amiga",
                "c64",
                "msx",
                "zx spectrum",
                "amstrad",
                "3do",
                "colecovision",
                "intellivision",
                "turbografx",
                "jaguar",
                "vectrex",
            ],
            PlatformFamily::Arcade => &["arcade", "neo geo", "neogeo", "mame"],
            PlatformFamily::Sega => &[
                "sega",
                "dreamcast",
                "saturn",
                "genesis",
                "mega drive",
                "megadrive",
                "game gear",
                "master system",
            ],
            PlatformFamily::Playstation => &[
                "playstation",
                "ps1",
                "ps2",
                "ps3",
                "ps4",
                "ps5",
                "psx",
                "psp",
                "ps vita",
                "vita",
                "psone",
            ],
            PlatformFamily::Xbox => &["xbox", "series x", "series s"],
            PlatformFamily::Nintendo => &[
                "nintendo",
                "switch",
                "wii",
                "gamecube",
                "3ds",
                "nds",
                "game boy",
                "gameboy",
                "gba",
                "n64",
                "nes",
                "snes",
                "famicom",
                "virtual boy",
            ],
            PlatformFamily::Mobile => &["ios", "android", "iphone", "ipad", "mobile"],
            PlatformFamily::Pc => &[
                "pc", "windows", "linux", "mac", "macos", "osx", "steam", "steamos", "dos",
            ],
        }
    }
}

/// Families are probed in this order so that e.g. "PC Engine" lands in
/// `retro` before the bare `pc` keyword is considered.
const CLASSIFY_ORDER: [PlatformFamily; 8] = [
    PlatformFamily::Retro,
    PlatformFamily::Arcade,
    PlatformFamily::Sega,
    PlatformFamily::Playstation,
    PlatformFamily::Xbox,
    PlatformFamily::Nintendo,
    PlatformFamily::Mobile,
    PlatformFamily::Pc,
];

impl fmt::Display for PlatformFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lc = s.trim().to_ascii_lowercase();
        PlatformFamily::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == lc)
            .ok_or_else(|| format!("unknown platform family: {s}"))
    }
}

/// Best-effort keyword classification of a free-text platform label.
///
/// Returns `None` for anything unrecognised; callers must tolerate an unknown
/// family.
pub fn classify_platform_family(raw: &str) -> Option<PlatformFamily> {
    let tokens = tokenize(raw);
    if tokens.trim().is_empty() {
        return None;
    }
    CLASSIFY_ORDER.into_iter().find(|family| {
        family
            .keywords()
            .iter()
            .any(|kw| tokens.contains(&format!(" {kw} ")))
    })
}

/// Family of the first platform in the list that classifies.
pub fn primary_family<S: AsRef<str>>(platforms: &[S]) -> Option<PlatformFamily> {
    platforms
        .first()
        .and_then(|p| classify_platform_family(p.as_ref()))
}

/// Lowercase, split letters from digits ("ps5" stays one token, "playstation5"
/// becomes "playstation 5") and pad with spaces for boundary matching.
fn tokenize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push(' ');
    let mut last_alpha: Option<bool> = None;
    for ch in raw.chars() {
        let c = ch.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            let is_alpha = c.is_ascii_alphabetic();
            // split "playstation5" but keep short codes like "ps5"/"n64"/"3ds"
            if let Some(prev_alpha) = last_alpha {
                if prev_alpha && !is_alpha && trailing_word_len(&out) > 3 {
                    out.push(' ');
                }
            }
            out.push(c);
            last_alpha = Some(is_alpha);
        } else {
            if !out.ends_with(' ') {
                out.push(' ');
            }
            last_alpha = None;
        }
    }
    if !out.ends_with(' ') {
        out.push(' ');
    }
    out
}

fn trailing_word_len(s: &str) -> usize {
    s.rsplit(' ').next().map(|w| w.len()).unwrap_or(0)
}

/// Canonicalized platform key used for upsert-by-code and fuzzy comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformKey {
    normalized: String,
    numeric_sig: Option<String>,
}

impl PlatformKey {
    /// Build a normalized comparison key from a raw platform label.
    ///
    /// Normalization steps:
    /// - trim whitespace
    /// - lowercase and remove punctuation/whitespace
    /// - remove PAL/NTSC/JPY style region prefixes
    /// - expand PSx abbreviations to "playstationx"
    /// - record the numeric signature so PS4 ≠ PS5
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim().to_ascii_lowercase();
        let without_prefix = strip_region_prefixes(&trimmed);
        let alnum_only: String = without_prefix
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        let expanded = expand_common_abbreviations(&alnum_only);
        let digits: String = expanded.chars().filter(|c| c.is_ascii_digit()).collect();
        let numeric_sig = if digits.is_empty() {
            None
        } else {
            Some(digits)
        };

        Self {
            normalized: expanded,
            numeric_sig,
        }
    }

    /// Stable code used as the Platform lookup key.
    pub fn code(&self) -> &str {
        &self.normalized
    }

    /// Optional numeric signature extracted from the normalized form (e.g., "5" for PS5).
    pub fn numeric_signature(&self) -> Option<&str> {
        self.numeric_sig.as_deref()
    }

    /// Whether the numeric signatures are compatible (both empty or equal).
    pub fn numeric_compatible(&self, other: &Self) -> bool {
        match (&self.numeric_sig, &other.numeric_sig) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Jaro-Winkler similarity between two normalized keys.
    pub fn similarity(&self, other: &Self) -> f64 {
        jaro_winkler(self.code(), other.code())
    }

    /// Same platform under fuzzy matching.
    pub fn matches(&self, other: &Self) -> bool {
        self.numeric_compatible(other) && self.similarity(other) >= MIN_PLATFORM_SIMILARITY
    }
}

fn strip_region_prefixes(input: &str) -> &str {
    const PREFIXES: [&str; 3] = ["pal", "ntsc", "jpy"];
    for prefix in PREFIXES {
        for sep in ["-", "_", " "] {
            if let Some(rest) = input
                .strip_prefix(prefix)
                .and_then(|r| r.strip_prefix(sep))
            {
                return rest.trim();
            }
        }
    }
    input
}

fn expand_common_abbreviations(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("ps") {
        if rest.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return format!("playstation{rest}");
        }
    }
    input.to_string()
}
