//! Single-step execution pipeline.
//!
//! One step applies one version transition: rewrite the deployment
//! descriptor, recreate the service, wait for readiness, run the service's
//! maintenance commands, and re-verify health. The executor is stateless;
//! failures after the descriptor write leave the new version deployed —
//! rolling back a partially migrated schema is unsafe in general, so recovery
//! is an operator decision.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::compose::{Descriptor, DescriptorLock, SessionLock};
use crate::config::ExecutionConfig;
use crate::error::CuoError;
use crate::runtime::{ControlPlane, HealthStatus};
use crate::session::{ServiceDescriptor, StepResult, StepStatus, UpgradeStep};
use crate::version::format_tag;

/// Attempts to take the descriptor lock before giving up on a step.
const LOCK_ATTEMPTS: u32 = 10;
const LOCK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Executes one upgrade step against the live stack.
pub struct StepExecutor<'a, C> {
    control: &'a C,
    execution: &'a ExecutionConfig,
}

impl<'a, C: ControlPlane> StepExecutor<'a, C> {
    pub const fn new(control: &'a C, execution: &'a ExecutionConfig) -> Self {
        Self { control, execution }
    }

    /// Apply `step` to `service`.
    ///
    /// `Ok` carries the step outcome, including `Failed` and `TimedOut`. An
    /// `Err` means the transition never reached the runtime (lock contention
    /// or a descriptor write failure) and the descriptor is unchanged or
    /// consistent.
    pub async fn execute(
        &self,
        step: &UpgradeStep,
        service: &ServiceDescriptor,
        descriptor_path: &Path,
    ) -> Result<StepResult, CuoError> {
        let started_at = Utc::now();

        info!(
            service = %service.name,
            ordinal = step.ordinal,
            from = %step.from_version,
            to = %step.to_version,
            "Executing upgrade step"
        );

        // Only one session may drive this service's step at a time; held for
        // the whole pipeline so no other invocation interleaves between the
        // rewrite and the maintenance commands.
        let _session = SessionLock::acquire(descriptor_path, &service.name)?;

        // 1. Rewrite the image reference, atomically. The write lock covers
        // only the read-modify-write window; concurrent sessions for other
        // services on the same descriptor wait their turn.
        let (image, retries) = {
            let _write = self.acquire_write_lock(descriptor_path, &service.name).await?;

            let mut descriptor = Descriptor::read(descriptor_path)
                .map_err(|e| CuoError::DescriptorWrite(e.to_string()))?;
            let current_image = descriptor.image_for(&service.name)?;
            let image = format!(
                "{}:{}",
                image_name(&current_image),
                format_tag(&step.to_version, service.flavor.as_deref())
            );

            descriptor.set_image(&service.name, &image)?;
            for linked in &service.linked_services {
                descriptor.set_image(linked, &image)?;
            }
            let retries = descriptor.write_atomic()?;
            (image, retries)
        };

        let done = |status: StepStatus, output: String| StepResult {
            step: step.clone(),
            status,
            output,
            retries,
            started_at,
            completed_at: Utc::now(),
        };

        // 2. Recreate the service (and linked sidecars) on the new version.
        let mut services = vec![service.name.clone()];
        services.extend(service.linked_services.iter().cloned());
        if let Err(e) = self.control.recreate(&services).await {
            return Ok(done(StepStatus::Failed, e.to_string()));
        }

        // 3. Readiness, bounded by the configured ceiling.
        if !self.wait_ready(&service.name).await {
            warn!(
                service = %service.name,
                ceiling_secs = self.execution.readiness_ceiling_secs,
                "Service did not become ready within the ceiling"
            );
            return Ok(done(
                StepStatus::TimedOut,
                format!(
                    "service not ready within {}s after recreate to {image}",
                    self.execution.readiness_ceiling_secs
                ),
            ));
        }

        // 4. Maintenance commands: run each exactly once, stop at the first
        // failure. Re-running a migration on an already-migrated schema is
        // not assumed safe, so no automatic retry.
        let mut output = String::new();
        for command in &service.maintenance {
            match self.control.run_maintenance(&service.name, command).await {
                Ok(outcome) => {
                    output.push_str(&outcome.output);
                    if !outcome.succeeded() {
                        warn!(
                            service = %service.name,
                            command = ?command,
                            exit_code = outcome.exit_code,
                            "Maintenance command failed"
                        );
                        return Ok(done(StepStatus::Failed, output));
                    }
                }
                Err(e) => {
                    output.push_str(&e.to_string());
                    return Ok(done(StepStatus::Failed, output));
                }
            }
        }

        // 5. Re-verify health after maintenance.
        if !self.wait_ready(&service.name).await {
            output.push_str("\nservice unhealthy after maintenance");
            return Ok(done(StepStatus::Failed, output));
        }

        info!(
            service = %service.name,
            ordinal = step.ordinal,
            to = %step.to_version,
            "Upgrade step completed"
        );
        Ok(done(StepStatus::Success, output))
    }

    /// Take the descriptor write lock, waiting briefly on contention. The
    /// lock is held only across a rewrite, so a held lock clears quickly
    /// unless the holder died and left it behind.
    async fn acquire_write_lock(
        &self,
        descriptor_path: &Path,
        service: &str,
    ) -> Result<DescriptorLock, CuoError> {
        let mut last = None;
        for attempt in 1..=LOCK_ATTEMPTS {
            match DescriptorLock::acquire(descriptor_path, service) {
                Ok(lock) => return Ok(lock),
                Err(e @ CuoError::LockHeld { .. }) => {
                    info!(service, attempt, "Descriptor lock held, waiting");
                    last = Some(e);
                    sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| CuoError::LockHeld {
            service: service.to_string(),
            path: descriptor_path.display().to_string(),
        }))
    }

    /// Poll the readiness probe until healthy or the ceiling is exceeded.
    async fn wait_ready(&self, service: &str) -> bool {
        let deadline = Instant::now() + self.execution.readiness_ceiling();
        let interval = self.execution.poll_interval();

        loop {
            match self.control.health_status(service).await {
                Ok(HealthStatus::Healthy) => return true,
                Ok(status) => {
                    info!(service, ?status, "Waiting for readiness");
                }
                Err(e) => {
                    warn!(service, error = %e, "Readiness probe failed, retrying");
                }
            }

            if Instant::now() + interval > deadline {
                return false;
            }
            sleep(interval).await;
        }
    }
}

/// Name portion of an image reference (everything before the tag).
fn image_name(image: &str) -> &str {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => name,
        _ => image,
    }
}
