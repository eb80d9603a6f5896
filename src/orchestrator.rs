//! Upgrade session orchestration.
//!
//! Drives the planned path strictly sequentially: each step depends on the
//! previous step's version being live, so steps never run concurrently within
//! a session. Independent services may run as separate concurrent sessions; a
//! session whose service declares dependencies waits on the session board for
//! each dependency to reach a terminal state first.

use std::collections::HashMap;
use std::path::Path;

use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ExecutionConfig, FailurePolicy};
use crate::error::CuoError;
use crate::executor::StepExecutor;
use crate::runtime::ControlPlane;
use crate::session::{SessionStatus, StepResult, StepStatus, UpgradeSession, UpgradeStep};

/// Shared view of concurrent sessions, keyed by service name.
///
/// Registered before any session starts; orchestrators publish their status
/// transitions and dependents block until a dependency turns terminal.
#[derive(Default)]
pub struct SessionBoard {
    channels: HashMap<String, (watch::Sender<SessionStatus>, watch::Receiver<SessionStatus>)>,
}

impl SessionBoard {
    pub fn register(&mut self, service: &str) {
        self.channels
            .entry(service.to_string())
            .or_insert_with(|| watch::channel(SessionStatus::Planned));
    }

    pub fn publish(&self, service: &str, status: SessionStatus) {
        if let Some((tx, _)) = self.channels.get(service) {
            let _ = tx.send(status);
        }
    }

    /// Wait until the named service's session reaches a terminal status.
    /// Services without a registered session are not being upgraded in this
    /// run and resolve immediately as `Completed`.
    pub async fn wait_terminal(&self, service: &str) -> SessionStatus {
        let Some((_, rx)) = self.channels.get(service) else {
            return SessionStatus::Completed;
        };
        let mut rx = rx.clone();
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

/// Drives one [`UpgradeSession`] to a terminal state.
pub struct UpgradeOrchestrator<'a, C> {
    control: &'a C,
    execution: &'a ExecutionConfig,
    descriptor_path: &'a Path,
    cancel: CancellationToken,
}

impl<'a, C: ControlPlane> UpgradeOrchestrator<'a, C> {
    pub const fn new(
        control: &'a C,
        execution: &'a ExecutionConfig,
        descriptor_path: &'a Path,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            control,
            execution,
            descriptor_path,
            cancel,
        }
    }

    /// Run the session to completion (or abort) and return it with the full
    /// ordered step history.
    pub async fn run(&self, mut session: UpgradeSession, board: &SessionBoard) -> UpgradeSession {
        let service = session.service.name.clone();

        // Block on declared dependencies before mutating anything.
        for dependency in session.service.depends_on.clone() {
            info!(service, dependency, "Waiting for dependency session");
            let status = board.wait_terminal(&dependency).await;
            if status != SessionStatus::Completed {
                session.abort(format!("dependency {dependency} session ended {status}"));
                board.publish(&service, session.status);
                return session;
            }
        }

        if session.path.is_empty() {
            info!(service, "Already up to date, nothing to execute");
            session.start();
            session.annotate("Already at target version");
            session.complete();
            board.publish(&service, session.status);
            return session;
        }

        let executor = StepExecutor::new(self.control, self.execution);
        let steps = session.path.steps().to_vec();
        let total = steps.len();

        session.start();
        board.publish(&service, session.status);

        for (index, step) in steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(service, "Cancelled by operator, aborting before next step");
                session.abort("cancelled by operator");
                break;
            }

            // Settle delay between steps, to absorb startup races in the
            // runtime. Cancellable; the in-flight step never is.
            if index > 0 {
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        warn!(service, "Cancelled by operator during settle delay");
                        session.abort("cancelled by operator");
                        break;
                    }
                    () = sleep(self.execution.settle_delay()) => {}
                }
            }

            info!(
                service,
                step = index + 1,
                total,
                from = %step.from_version,
                to = %step.to_version,
                "Starting upgrade step"
            );

            match executor
                .execute(step, &session.service, self.descriptor_path)
                .await
            {
                Ok(result) => {
                    let status = result.status;
                    let ordinal = result.step.ordinal;
                    session.record(result);

                    if status == StepStatus::Success {
                        continue;
                    }
                    if self.execution.failure_policy == FailurePolicy::Halt {
                        session.abort(format!("step {ordinal} of {total} ended {status}"));
                        break;
                    }
                    warn!(
                        service,
                        step = index + 1,
                        %status,
                        "Step did not succeed, continuing per failure policy"
                    );
                }
                Err(e) => {
                    // The transition never reached the runtime; continuing
                    // would upgrade from a version that is not live.
                    error!(
                        service,
                        step = index + 1,
                        error = %e,
                        transient = e.is_transient(),
                        "Step execution error"
                    );
                    session.record(step_error_result(step, &e));
                    session.abort(format!("step {} of {total} error: {e}", index + 1));
                    break;
                }
            }
        }

        // Completion requires every recorded step to have succeeded; under
        // the continue policy the loop runs to the end even with failures.
        if session.status == SessionStatus::InProgress {
            let failed: Vec<String> = session
                .results
                .iter()
                .filter(|r| r.status != StepStatus::Success)
                .map(|r| r.step.ordinal.to_string())
                .collect();
            if failed.is_empty() {
                session.complete();
            } else {
                session.abort(format!(
                    "{} of {total} steps did not succeed: step(s) {}",
                    failed.len(),
                    failed.join(", ")
                ));
            }
        }

        match session.status {
            SessionStatus::Completed => info!(service, "Upgrade session completed"),
            _ => warn!(
                service,
                status = %session.status,
                message = session.message.as_deref().unwrap_or(""),
                deployed = %session
                    .deployed_version()
                    .map_or_else(|| "unknown".to_string(), ToString::to_string),
                "Upgrade session did not complete"
            ),
        }

        board.publish(&service, session.status);
        session
    }
}

fn step_error_result(step: &UpgradeStep, err: &CuoError) -> StepResult {
    let now = chrono::Utc::now();
    StepResult {
        step: step.clone(),
        status: StepStatus::Failed,
        output: err.to_string(),
        retries: 0,
        started_at: now,
        completed_at: now,
    }
}
