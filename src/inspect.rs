//! Current deployed-state inspection.

use semver::Version;
use tracing::info;

use crate::error::CuoError;
use crate::runtime::ControlPlane;
use crate::session::ServiceDescriptor;
use crate::version::parse_tag;

/// Read the version the service currently runs from the control plane.
///
/// An unparsable running tag (e.g. `latest`) is a terminal condition
/// requiring operator intervention; it is never retried.
pub async fn current_version<C: ControlPlane>(
    control: &C,
    service: &ServiceDescriptor,
) -> Result<Version, CuoError> {
    let tag = control.running_image_tag(&service.name).await?;

    let version = parse_tag(&tag, service.flavor.as_deref()).map_err(|_| {
        CuoError::VersionUnparsable {
            service: service.name.clone(),
            tag: tag.clone(),
        }
    })?;

    info!(service = %service.name, %version, "Detected running version");
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{HealthStatus, MaintenanceOutcome};

    struct StubPlane {
        tag: Result<String, ()>,
    }

    impl ControlPlane for StubPlane {
        async fn running_image_tag(&self, service: &str) -> Result<String, CuoError> {
            self.tag
                .clone()
                .map_err(|()| CuoError::ServiceNotFound(service.to_string()))
        }

        async fn recreate(&self, _services: &[String]) -> Result<(), CuoError> {
            Ok(())
        }

        async fn health_status(&self, _service: &str) -> Result<HealthStatus, CuoError> {
            Ok(HealthStatus::Healthy)
        }

        async fn run_maintenance(
            &self,
            _service: &str,
            _command: &[String],
        ) -> Result<MaintenanceOutcome, CuoError> {
            Ok(MaintenanceOutcome {
                exit_code: 0,
                output: String::new(),
            })
        }
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

    #[tokio::test]
    async fn test_current_version_parses_running_tag() {
        let plane = StubPlane {
            tag: Ok("27.1.0-fpm".to_string()),
        };
        let version = current_version(&plane, &service()).await.unwrap();
        assert_eq!(version, Version::parse("27.1.0").unwrap());
    }

    #[tokio::test]
    async fn test_current_version_latest_is_unparsable() {
        let plane = StubPlane {
            tag: Ok("latest".to_string()),
        };
        let err = current_version(&plane, &service()).await.unwrap_err();
        assert!(matches!(err, CuoError::VersionUnparsable { .. }));
        assert!(err.to_string().contains("latest"));
    }

    #[tokio::test]
    async fn test_current_version_service_not_found() {
        let plane = StubPlane { tag: Err(()) };
        let err = current_version(&plane, &service()).await.unwrap_err();
        assert!(matches!(err, CuoError::ServiceNotFound(_)));
    }
}
