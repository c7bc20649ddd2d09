use chrono::NaiveDate;

use crate::database_ops::models::MirrorGameUpsert;
use crate::normalization::{classify_platform_family, PlatformFamily};

/// PC titles released before this date are kept out of the trending mirror.
pub fn pc_cutoff() -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Excluded iff the family is PC and a release date exists before the cutoff.
pub fn is_excluded(family: Option<PlatformFamily>, released: Option<NaiveDate>) -> bool {
    family == Some(PlatformFamily::Pc) && released.is_some_and(|d| d < pc_cutoff())
}

pub fn excludes_upsert(game: &MirrorGameUpsert) -> bool {
    let family = game.platform.as_deref().and_then(classify_platform_family);
    is_excluded(family, game.release_date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(platform: &str, date: &str) -> MirrorGameUpsert {
        MirrorGameUpsert {
            external_id: 1,
            title: "Old Game".into(),
            platform: Some(platform.into()),
            platform_id: None,
            release_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok(),
            overview: None,
            rating: None,
            genres: vec![],
            payload: json!({}),
        }
    }

    #[test]
    fn pc_before_2015_only() {
        assert!(excludes_upsert(&upsert("PC", "2012-01-01")));
        assert!(!excludes_upsert(&upsert("PlayStation 5", "2012-01-01")));
        assert!(!excludes_upsert(&upsert("PC", "2015-01-01")));
        assert!(!is_excluded(Some(PlatformFamily::Pc), None));
    }
}
