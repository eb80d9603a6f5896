//! Upgrade path calculation.
//!
//! Major versions must be passed through sequentially: skipping one breaks
//! the upgraded application's internal migration assumptions. The planner
//! therefore emits one step per major boundary, taking the highest published
//! build inside every intermediate major and the exact target at the end.

use semver::Version;
use tracing::info;

use crate::error::CuoError;
use crate::session::{ServiceDescriptor, UpgradePath, UpgradeStep};

/// Compute the ordered upgrade path from `current` towards `target`.
///
/// Without an explicit target the highest available version is used. Returns
/// an empty path when the service is already up to date (not an error).
pub fn plan(
    service: &ServiceDescriptor,
    current: &Version,
    available: &[Version],
    target: Option<&Version>,
) -> Result<UpgradePath, CuoError> {
    let target = match target {
        Some(t) if t < current => {
            return Err(CuoError::InvalidDowngrade {
                current: current.to_string(),
                target: t.to_string(),
            });
        }
        Some(t) if t == current => return Ok(UpgradePath::default()),
        Some(t) => {
            if !available.contains(t) {
                return Err(CuoError::NoPathAvailable(format!(
                    "target {t} is not published for {}",
                    service.repository
                )));
            }
            t.clone()
        }
        // No target: aim at the highest published version, if any is newer.
        None => match available.iter().filter(|v| *v > current).max() {
            Some(max) => max.clone(),
            None => return Ok(UpgradePath::default()),
        },
    };

    let mut steps = Vec::new();
    let mut from = current.clone();

    for major in (current.major + 1)..=target.major {
        let to = if major == target.major {
            target.clone()
        } else {
            available
                .iter()
                .filter(|v| v.major == major && *v > current)
                .max()
                .cloned()
                .ok_or_else(|| {
                    CuoError::NoPathAvailable(format!(
                        "no published version for required major {major} between {current} and {target}"
                    ))
                })?
        };

        steps.push(UpgradeStep {
            service: service.name.clone(),
            from_version: from.clone(),
            to_version: to.clone(),
            ordinal: steps.len() as u32 + 1,
        });
        from = to;
    }

    // Same-major target: one step straight to it.
    if steps.is_empty() {
        steps.push(UpgradeStep {
            service: service.name.clone(),
            from_version: current.clone(),
            to_version: target.clone(),
            ordinal: 1,
        });
    }

    info!(
        service = %service.name,
        steps = steps.len(),
        from = %current,
        to = %target,
        "Upgrade path planned"
    );

    Ok(UpgradePath(steps))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn versions(list: &[&str]) -> Vec<Version> {
        list.iter().map(|s| version(s)).collect()
    }

    fn service() -> ServiceDescriptor {
        ServiceDescriptor {
            name: "nextcloud-fpm".to_string(),
            repository: "library/nextcloud".to_string(),
            image: "nextcloud:27.1.0-fpm".to_string(),
            flavor: Some("fpm".to_string()),
            depends_on: Vec::new(),
            linked_services: Vec::new(),
            maintenance: Vec::new(),
        }
    }

    #[test]
    fn test_plan_crosses_each_major_once() {
        let available = versions(&["27.1.0", "27.1.9", "28.0.0", "28.0.5", "29.0.0"]);
        let path = plan(
            &service(),
            &version("27.1.0"),
            &available,
            Some(&version("29.0.0")),
        )
        .unwrap();

        let rendered: Vec<(String, String)> = path
            .steps()
            .iter()
            .map(|s| (s.from_version.to_string(), s.to_version.to_string()))
            .collect();
        assert_eq!(
            rendered,
            vec![
                ("27.1.0".to_string(), "28.0.5".to_string()),
                ("28.0.5".to_string(), "29.0.0".to_string()),
            ]
        );
        assert_eq!(path.steps()[0].ordinal, 1);
        assert_eq!(path.steps()[1].ordinal, 2);
    }

    #[test]
    fn test_plan_majors_advance_by_one() {
        let available = versions(&["26.0.2", "27.1.11", "28.0.5", "29.0.1", "30.0.0"]);
        let path = plan(&service(), &version("26.0.1"), &available, None).unwrap();

        assert_eq!(path.final_version(), Some(&version("30.0.0")));
        for pair in path.steps().windows(2) {
            assert_eq!(pair[1].from_version, pair[0].to_version);
            assert_eq!(pair[1].from_version.major, pair[0].from_version.major + 1);
            assert!(pair[0].to_version < pair[1].to_version);
        }
    }

    #[test]
    fn test_plan_same_version_is_empty() {
        let available = versions(&["27.1.0", "28.0.5"]);
        let path = plan(
            &service(),
            &version("27.1.0"),
            &available,
            Some(&version("27.1.0")),
        )
        .unwrap();
        assert!(path.is_empty());
    }

    #[test]
    fn test_plan_already_at_max_is_empty() {
        // Idempotence: re-planning once the target is live yields nothing.
        let available = versions(&["27.1.0", "28.0.5", "29.0.0"]);
        let path = plan(&service(), &version("29.0.0"), &available, None).unwrap();
        assert!(path.is_empty());
    }

    #[test]
    fn test_plan_downgrade_rejected() {
        let available = versions(&["28.0.5", "29.0.0"]);
        let err = plan(
            &service(),
            &version("29.0.0"),
            &available,
            Some(&version("28.0.5")),
        )
        .unwrap_err();
        assert!(matches!(err, CuoError::InvalidDowngrade { .. }));
    }

    #[test]
    fn test_plan_missing_intermediate_major() {
        // 28.x was never published: the registry history has a gap.
        let available = versions(&["27.1.0", "29.0.0"]);
        let err = plan(
            &service(),
            &version("27.1.0"),
            &available,
            Some(&version("29.0.0")),
        )
        .unwrap_err();
        assert!(matches!(err, CuoError::NoPathAvailable(_)));
        assert!(err.to_string().contains("major 28"));
    }

    #[test]
    fn test_plan_unpublished_target() {
        let available = versions(&["28.0.5"]);
        let err = plan(
            &service(),
            &version("27.1.0"),
            &available,
            Some(&version("29.0.0")),
        )
        .unwrap_err();
        assert!(matches!(err, CuoError::NoPathAvailable(_)));
    }

    #[test]
    fn test_plan_same_major_single_step() {
        let available = versions(&["27.1.5", "27.1.9"]);
        let path = plan(
            &service(),
            &version("27.1.0"),
            &available,
            Some(&version("27.1.9")),
        )
        .unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path.steps()[0].to_version, version("27.1.9"));
    }

    #[test]
    fn test_plan_no_target_uses_highest_available() {
        let available = versions(&["27.1.9", "28.0.0", "28.0.5"]);
        let path = plan(&service(), &version("27.1.0"), &available, None).unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path.final_version(), Some(&version("28.0.5")));
    }

    #[test]
    fn test_plan_no_newer_versions_is_empty() {
        let available = versions(&["26.0.0", "27.1.0"]);
        let path = plan(&service(), &version("27.1.0"), &available, None).unwrap();
        assert!(path.is_empty());
    }

    #[test]
    fn test_plan_no_duplicate_versions() {
        let available = versions(&["27.1.0", "28.0.5", "29.0.0", "30.0.2"]);
        let path = plan(&service(), &version("27.1.0"), &available, None).unwrap();

        let mut seen: Vec<&Version> = path.steps().iter().map(|s| &s.to_version).collect();
        seen.dedup();
        assert_eq!(seen.len(), path.len());
    }
}
