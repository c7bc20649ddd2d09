pub mod identity;
pub mod platform;
pub mod rating;

pub use identity::{compute_uid, dedupe_slug, normalize_name, slugify};
pub use platform::{classify_platform_family, primary_family, PlatformFamily, PlatformKey};
pub use rating::RatingMapper;
