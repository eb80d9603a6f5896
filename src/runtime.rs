//! Container control plane interface.
//!
//! The orchestrator only consumes four operations from the runtime: reading
//! the running image tag, recreating services from the descriptor, probing
//! health, and running maintenance commands inside a service container. The
//! [`ControlPlane`] trait is the seam; [`DockerCompose`] implements it by
//! shelling out to `docker` / `docker compose`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::CuoError;

/// Health of a running service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Captured outcome of a maintenance command.
#[derive(Debug, Clone)]
pub struct MaintenanceOutcome {
    pub exit_code: i32,
    pub output: String,
}

impl MaintenanceOutcome {
    pub const fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Operations consumed from the container control plane.
pub trait ControlPlane {
    /// Image tag of the running instance of `service`.
    fn running_image_tag(
        &self,
        service: &str,
    ) -> impl Future<Output = Result<String, CuoError>> + Send;

    /// Recreate the given services from the current deployment descriptor.
    fn recreate(&self, services: &[String]) -> impl Future<Output = Result<(), CuoError>> + Send;

    /// Readiness probe for `service`.
    fn health_status(
        &self,
        service: &str,
    ) -> impl Future<Output = Result<HealthStatus, CuoError>> + Send;

    /// Run one maintenance command inside `service`, capturing exit code and
    /// output. A non-zero exit is an outcome, not an error.
    fn run_maintenance(
        &self,
        service: &str,
        command: &[String],
    ) -> impl Future<Output = Result<MaintenanceOutcome, CuoError>> + Send;
}

/// `docker compose` backed control plane.
pub struct DockerCompose {
    compose_file: PathBuf,
    command_timeout: Duration,
}

impl DockerCompose {
    pub fn new<P: AsRef<Path>>(compose_file: P) -> Self {
        Self {
            compose_file: compose_file.as_ref().to_path_buf(),
            command_timeout: Duration::from_secs(120),
        }
    }

    async fn container_id(&self, service: &str) -> Result<String, CuoError> {
        let output = self
            .compose(&["ps", "-q", service], "runtime::ps")
            .await?;
        let id = output.lines().next().unwrap_or("").trim().to_string();
        if id.is_empty() {
            return Err(CuoError::ServiceNotFound(service.to_string()));
        }
        Ok(id)
    }

    async fn compose(&self, args: &[&str], component: &str) -> Result<String, CuoError> {
        let compose_file = self.compose_file.to_string_lossy();
        let mut full_args = vec!["compose", "-f", compose_file.as_ref()];
        full_args.extend_from_slice(args);
        run_command("docker", &full_args, self.command_timeout, component).await
    }
}

impl ControlPlane for DockerCompose {
    async fn running_image_tag(&self, service: &str) -> Result<String, CuoError> {
        let id = self.container_id(service).await?;
        let image = run_command(
            "docker",
            &["inspect", "--format", "{{.Config.Image}}", &id],
            self.command_timeout,
            "runtime::inspect",
        )
        .await?;
        let tag = image_tag(image.trim()).to_string();
        debug!(service, tag, "Resolved running image tag");
        Ok(tag)
    }

    async fn recreate(&self, services: &[String]) -> Result<(), CuoError> {
        info!(services = ?services, "Recreating services");
        let mut args = vec!["up", "-d", "--no-deps"];
        args.extend(services.iter().map(String::as_str));
        self.compose(&args, "runtime::recreate").await?;
        Ok(())
    }

    async fn health_status(&self, service: &str) -> Result<HealthStatus, CuoError> {
        let id = match self.container_id(service).await {
            Ok(id) => id,
            // Not listed yet (still being created) counts as not-yet-known
            Err(CuoError::ServiceNotFound(_)) => return Ok(HealthStatus::Unknown),
            Err(e) => return Err(e),
        };

        let state = run_command(
            "docker",
            &[
                "inspect",
                "--format",
                "{{.State.Status}} {{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}",
                &id,
            ],
            self.command_timeout,
            "runtime::health",
        )
        .await?;

        Ok(parse_health(state.trim()))
    }

    async fn run_maintenance(
        &self,
        service: &str,
        command: &[String],
    ) -> Result<MaintenanceOutcome, CuoError> {
        let compose_file = self.compose_file.to_string_lossy();
        let mut args = vec!["compose", "-f", compose_file.as_ref(), "exec", "-T", service];
        args.extend(command.iter().map(String::as_str));

        info!(service, command = ?command, "Running maintenance command");

        let result = tokio::time::timeout(
            self.command_timeout,
            Command::new("docker")
                .args(&args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| CuoError::control_plane("runtime::maintenance", "command timed out"))?
        .map_err(|e| CuoError::control_plane("runtime::maintenance", e))?;

        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&result.stderr));

        Ok(MaintenanceOutcome {
            exit_code: result.status.code().unwrap_or(-1),
            output,
        })
    }
}

/// Run a control-plane command, failing on non-zero exit.
async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
    component: &str,
) -> Result<String, CuoError> {
    debug!(program, args = ?args, "Running control plane command");

    let result = tokio::time::timeout(
        timeout,
        Command::new(program).args(args).stdin(Stdio::null()).output(),
    )
    .await
    .map_err(|_| CuoError::control_plane(component, "command timed out"))?
    .map_err(|e| CuoError::control_plane(component, e))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(CuoError::control_plane(
            component,
            format!("{} exited with {}: {}", program, result.status, stderr.trim()),
        ));
    }

    Ok(String::from_utf8_lossy(&result.stdout).into_owned())
}

/// Tag portion of an image reference; an untagged reference means `latest`.
fn image_tag(image: &str) -> &str {
    match image.rsplit_once(':') {
        Some((_, tag)) if !tag.contains('/') => tag,
        _ => "latest",
    }
}

fn parse_health(state: &str) -> HealthStatus {
    let mut parts = state.split_whitespace();
    let status = parts.next().unwrap_or("");
    let health = parts.next().unwrap_or("none");

    match health {
        "healthy" => HealthStatus::Healthy,
        "unhealthy" => HealthStatus::Unhealthy,
        "starting" => HealthStatus::Unknown,
        // No healthcheck defined: fall back to the container state
        _ => match status {
            "running" => HealthStatus::Healthy,
            "created" | "restarting" => HealthStatus::Unknown,
            _ => HealthStatus::Unhealthy,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tag() {
        assert_eq!(image_tag("nextcloud:28.0.4-fpm"), "28.0.4-fpm");
        assert_eq!(image_tag("postgres:17.2.0"), "17.2.0");
        assert_eq!(image_tag("nextcloud"), "latest");
        assert_eq!(image_tag("registry:5000/app"), "latest");
        assert_eq!(image_tag("registry:5000/app:1.2.3"), "1.2.3");
    }

    #[test]
    fn test_parse_health_with_healthcheck() {
        assert_eq!(parse_health("running healthy"), HealthStatus::Healthy);
        assert_eq!(parse_health("running unhealthy"), HealthStatus::Unhealthy);
        assert_eq!(parse_health("running starting"), HealthStatus::Unknown);
    }

    #[test]
    fn test_parse_health_without_healthcheck() {
        assert_eq!(parse_health("running none"), HealthStatus::Healthy);
        assert_eq!(parse_health("created none"), HealthStatus::Unknown);
        assert_eq!(parse_health("restarting none"), HealthStatus::Unknown);
        assert_eq!(parse_health("exited none"), HealthStatus::Unhealthy);
        assert_eq!(parse_health("dead none"), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_maintenance_outcome_succeeded() {
        let ok = MaintenanceOutcome {
            exit_code: 0,
            output: String::new(),
        };
        let failed = MaintenanceOutcome {
            exit_code: 1,
            output: "migration error".to_string(),
        };
        assert!(ok.succeeded());
        assert!(!failed.succeeded());
    }
}
