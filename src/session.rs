//! Upgrade session data model.
//!
//! An [`UpgradeSession`] aggregates the planned path and the ordered step
//! results for one service. It is owned and mutated exclusively by the
//! orchestrator; terminal statuses accept no further transitions.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::Serialize;
use tracing::warn;

use crate::compose::Descriptor;
use crate::config::ServiceConfig;
use crate::error::CuoError;

/// A deployable unit eligible for staged upgrades.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    /// Compose service name.
    pub name: String,
    /// Registry repository the image is published under.
    pub repository: String,
    /// Image reference currently recorded in the deployment descriptor.
    pub image: String,
    /// Packaging variant suffix on tags.
    pub flavor: Option<String>,
    /// Services that must be healthy (and upgraded first) before this one.
    pub depends_on: Vec<String>,
    /// Sidecar services rewritten to the same image in each step.
    pub linked_services: Vec<String>,
    /// Post-upgrade maintenance commands.
    pub maintenance: Vec<Vec<String>>,
}

impl ServiceDescriptor {
    /// Build a descriptor from configuration plus the compose file's current
    /// image reference.
    pub fn from_config(
        name: &str,
        config: &ServiceConfig,
        descriptor: &Descriptor,
    ) -> Result<Self, CuoError> {
        let image = descriptor.image_for(name)?;
        Ok(Self {
            name: name.to_string(),
            repository: config.repository.clone(),
            image,
            flavor: config.flavor.clone(),
            depends_on: config.depends_on.clone(),
            linked_services: config.linked_services.clone(),
            maintenance: config.maintenance.clone(),
        })
    }
}

/// One planned version transition. Immutable once planned.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStep {
    pub service: String,
    pub from_version: Version,
    pub to_version: Version,
    /// 1-based position in the path.
    pub ordinal: u32,
}

/// Ordered sequence of upgrade steps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpgradePath(pub Vec<UpgradeStep>);

impl UpgradePath {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn steps(&self) -> &[UpgradeStep] {
        &self.0
    }

    /// Final version the path arrives at, if any.
    pub fn final_version(&self) -> Option<&Version> {
        self.0.last().map(|s| &s.to_version)
    }
}

/// Outcome status of a single executed step.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    Failed,
    TimedOut,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Failed => write!(f, "Failed"),
            Self::TimedOut => write!(f, "TimedOut"),
        }
    }
}

/// Outcome of executing one upgrade step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: UpgradeStep,
    pub status: StepStatus,
    /// Captured diagnostic output (maintenance command output or failure
    /// detail).
    pub output: String,
    /// Descriptor write retries consumed during the step.
    pub retries: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Lifecycle status of an upgrade session.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum SessionStatus {
    Planned,
    InProgress,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planned => write!(f, "Planned"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Completed => write!(f, "Completed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// A single service's upgrade session: target, path, and ordered results.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSession {
    pub service: ServiceDescriptor,
    pub path: UpgradePath,
    pub results: Vec<StepResult>,
    pub status: SessionStatus,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UpgradeSession {
    pub const fn new(service: ServiceDescriptor, path: UpgradePath) -> Self {
        Self {
            service,
            path,
            results: Vec::new(),
            status: SessionStatus::Planned,
            message: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Planned → InProgress on first step execution.
    pub fn start(&mut self) {
        if self.status != SessionStatus::Planned {
            warn!(status = %self.status, "Ignoring start on non-planned session");
            return;
        }
        self.status = SessionStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    /// Record one step's result, preserving execution order.
    pub fn record(&mut self, result: StepResult) {
        if self.status.is_terminal() {
            warn!(status = %self.status, "Ignoring step result on terminal session");
            return;
        }
        self.results.push(result);
    }

    /// InProgress → Completed once all steps succeeded.
    pub fn complete(&mut self) {
        if self.status != SessionStatus::InProgress {
            warn!(status = %self.status, "Ignoring complete on session not in progress");
            return;
        }
        self.status = SessionStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Attach an operator-facing note to a live session.
    pub fn annotate(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            warn!(status = %self.status, "Ignoring annotate on terminal session");
            return;
        }
        self.message = Some(message.into());
    }

    /// Any non-terminal status → Aborted with an operator-facing message.
    pub fn abort(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            warn!(status = %self.status, "Ignoring abort on terminal session");
            return;
        }
        self.status = SessionStatus::Aborted;
        self.message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    /// Version the service runs after the recorded results: the last step
    /// that reached the runtime, or the path's start when nothing ran.
    pub fn deployed_version(&self) -> Option<&Version> {
        self.results
            .last()
            .map(|r| &r.step.to_version)
            .or_else(|| self.path.steps().first().map(|s| &s.from_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn step(from: &str, to: &str, ordinal: u32) -> UpgradeStep {
        UpgradeStep {
            service: "nextcloud-fpm".to_string(),
            from_version: version(from),
            to_version: version(to),
            ordinal,
        }
    }

    fn descriptor() -> ServiceDescriptor {
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

    fn result(status: StepStatus, s: UpgradeStep) -> StepResult {
        StepResult {
            step: s,
            status,
            output: String::new(),
            retries: 0,
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let path = UpgradePath(vec![step("27.1.0", "28.0.5", 1), step("28.0.5", "29.0.0", 2)]);
        let mut session = UpgradeSession::new(descriptor(), path);
        assert_eq!(session.status, SessionStatus::Planned);

        session.start();
        assert_eq!(session.status, SessionStatus::InProgress);
        assert!(session.started_at.is_some());

        session.record(result(StepStatus::Success, step("27.1.0", "28.0.5", 1)));
        session.record(result(StepStatus::Success, step("28.0.5", "29.0.0", 2)));
        session.complete();

        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.completed_at.is_some());
        assert_eq!(session.results.len(), 2);
    }

    #[test]
    fn test_terminal_rejects_transitions() {
        let mut session = UpgradeSession::new(descriptor(), UpgradePath::default());
        session.start();
        session.abort("readiness timeout");
        assert_eq!(session.status, SessionStatus::Aborted);

        session.complete();
        assert_eq!(session.status, SessionStatus::Aborted);
        session.start();
        assert_eq!(session.status, SessionStatus::Aborted);
        session.record(result(StepStatus::Success, step("27.1.0", "28.0.5", 1)));
        assert!(session.results.is_empty());
        assert_eq!(session.message.as_deref(), Some("readiness timeout"));
    }

    #[test]
    fn test_annotate_only_on_live_sessions() {
        let mut session = UpgradeSession::new(descriptor(), UpgradePath::default());
        session.start();
        session.annotate("nothing to do");
        assert_eq!(session.message.as_deref(), Some("nothing to do"));

        session.abort("cancelled");
        session.annotate("overwritten");
        assert_eq!(session.message.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_abort_from_planned() {
        let mut session = UpgradeSession::new(descriptor(), UpgradePath::default());
        session.abort("operator cancelled");
        assert_eq!(session.status, SessionStatus::Aborted);
    }

    #[test]
    fn test_results_preserve_order() {
        let mut session = UpgradeSession::new(
            descriptor(),
            UpgradePath(vec![step("27.1.0", "28.0.5", 1), step("28.0.5", "29.0.0", 2)]),
        );
        session.start();
        session.record(result(StepStatus::Success, step("27.1.0", "28.0.5", 1)));
        session.record(result(StepStatus::TimedOut, step("28.0.5", "29.0.0", 2)));

        assert_eq!(session.results[0].step.ordinal, 1);
        assert_eq!(session.results[1].step.ordinal, 2);
        assert_eq!(session.results[1].status, StepStatus::TimedOut);
    }

    #[test]
    fn test_deployed_version_tracks_last_result() {
        let path = UpgradePath(vec![step("27.1.0", "28.0.5", 1), step("28.0.5", "29.0.0", 2)]);
        let mut session = UpgradeSession::new(descriptor(), path);
        assert_eq!(session.deployed_version(), Some(&version("27.1.0")));

        session.start();
        session.record(result(StepStatus::Success, step("27.1.0", "28.0.5", 1)));
        assert_eq!(session.deployed_version(), Some(&version("28.0.5")));

        // A timed-out step still left the new version deployed
        session.record(result(StepStatus::TimedOut, step("28.0.5", "29.0.0", 2)));
        assert_eq!(session.deployed_version(), Some(&version("29.0.0")));
    }

    #[test]
    fn test_path_final_version() {
        let path = UpgradePath(vec![step("27.1.0", "28.0.5", 1), step("28.0.5", "29.0.0", 2)]);
        assert_eq!(path.final_version(), Some(&version("29.0.0")));
        assert!(UpgradePath::default().final_version().is_none());
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let session = UpgradeSession::new(descriptor(), UpgradePath::default());
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "Planned");
        assert!(json["service"]["linkedServices"].is_array());
        assert!(json.get("startedAt").is_some());
    }
}
