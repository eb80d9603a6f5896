//! Image tag parsing and formatting.
//!
//! Compose image tags follow the upstream naming convention
//! `<major>.<minor>.<patch>[-<flavor>]` (e.g. `28.0.4-fpm`). The flavor is a
//! packaging variant, not a pre-release: it is stripped before semver parsing
//! and re-attached when rendering, so `parse_tag` followed by `format_tag`
//! round-trips the original tag.

use semver::Version;

use crate::error::CuoError;

/// Parse an image tag into a semantic version.
///
/// When `flavor` is set, the tag must carry the `-<flavor>` suffix; tags
/// without it do not belong to the service's naming convention.
pub fn parse_tag(tag: &str, flavor: Option<&str>) -> Result<Version, CuoError> {
    let core = match flavor {
        Some(f) => tag
            .strip_suffix(&format!("-{f}"))
            .ok_or_else(|| CuoError::TagParse(tag.to_string()))?,
        None => tag,
    };

    Version::parse(core).map_err(|_| CuoError::TagParse(tag.to_string()))
}

/// Render a semantic version back into an image tag.
pub fn format_tag(version: &Version, flavor: Option<&str>) -> String {
    match flavor {
        Some(f) => format!("{version}-{f}"),
        None => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag_plain() {
        let v = parse_tag("28.0.4", None).unwrap();
        assert_eq!((v.major, v.minor, v.patch), (28, 0, 4));
    }

    #[test]
    fn test_parse_tag_with_flavor() {
        let v = parse_tag("28.0.4-fpm", Some("fpm")).unwrap();
        assert_eq!((v.major, v.minor, v.patch), (28, 0, 4));
        assert!(v.pre.is_empty());
    }

    #[test]
    fn test_parse_tag_missing_flavor_suffix() {
        assert!(matches!(
            parse_tag("28.0.4", Some("fpm")),
            Err(CuoError::TagParse(_))
        ));
    }

    #[test]
    fn test_parse_tag_rejects_non_versions() {
        assert!(parse_tag("latest", None).is_err());
        assert!(parse_tag("stable-fpm", Some("fpm")).is_err());
        assert!(parse_tag("28.0", None).is_err());
    }

    #[test]
    fn test_round_trip() {
        for (tag, flavor) in [
            ("28.0.4", None),
            ("29.0.0", None),
            ("28.0.4-fpm", Some("fpm")),
            ("30.0.1-alpine", Some("alpine")),
        ] {
            let v = parse_tag(tag, flavor).unwrap();
            assert_eq!(format_tag(&v, flavor), tag);
        }
    }

    #[test]
    fn test_prerelease_sorts_before_release() {
        let rc = parse_tag("29.0.0-rc.1", None).unwrap();
        let release = parse_tag("29.0.0", None).unwrap();
        assert!(rc < release);
    }

    #[test]
    fn test_total_order() {
        let a = parse_tag("27.1.9", None).unwrap();
        let b = parse_tag("28.0.0", None).unwrap();
        let c = parse_tag("28.0.5", None).unwrap();
        assert!(a < b && b < c);
    }
}
