//! Deployment state machine.
//!
//! States are persisted as strings; legal transitions are checked at the
//! store boundary so no caller can move a deployment along an edge that
//! doesn't exist.
//!
//! ```text
//! pending_upload ──▶ uploaded ──▶ pending_deploy ──▶ deployed
//!                                      │    ▲
//!                                      ▼    │
//!                                  deploy_failed
//! ```
//!
//! `deployed → deployed` is also legal: a metadata-only republish
//! re-affirms the deployed state without moving through the machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a deployment is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Created; the bundle has not been uploaded yet.
    PendingUpload,
    /// The bundle is in object storage but not prepared for deploying.
    Uploaded,
    /// Queued for the deploy worker.
    PendingDeploy,
    /// Live; the webroot is published.
    Deployed,
    /// The deploy worker gave up on this deployment.
    DeployFailed,
}

impl DeploymentState {
    /// State name as persisted and exposed over the API.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PendingUpload => "pending_upload",
            Self::Uploaded => "uploaded",
            Self::PendingDeploy => "pending_deploy",
            Self::Deployed => "deployed",
            Self::DeployFailed => "deploy_failed",
        }
    }

    /// Whether moving from `self` to `to` is a legal transition.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::PendingUpload, Self::Uploaded)
                | (Self::Uploaded, Self::PendingDeploy)
                | (Self::PendingDeploy, Self::Deployed)
                | (Self::PendingDeploy, Self::DeployFailed)
                | (Self::DeployFailed, Self::PendingDeploy)
                | (Self::Deployed, Self::Deployed)
        )
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeploymentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_upload" => Ok(Self::PendingUpload),
            "uploaded" => Ok(Self::Uploaded),
            "pending_deploy" => Ok(Self::PendingDeploy),
            "deployed" => Ok(Self::Deployed),
            "deploy_failed" => Ok(Self::DeployFailed),
            _ => Err(format!("unknown deployment state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        use DeploymentState::*;

        assert!(PendingUpload.can_transition(Uploaded));
        assert!(Uploaded.can_transition(PendingDeploy));
        assert!(PendingDeploy.can_transition(Deployed));
    }

    #[test]
    fn failure_and_retry_transitions() {
        use DeploymentState::*;

        assert!(PendingDeploy.can_transition(DeployFailed));
        assert!(DeployFailed.can_transition(PendingDeploy));
    }

    #[test]
    fn republish_reaffirms_deployed() {
        use DeploymentState::*;

        assert!(Deployed.can_transition(Deployed));
    }

    #[test]
    fn illegal_transitions_rejected() {
        use DeploymentState::*;

        assert!(!Uploaded.can_transition(Deployed));
        assert!(!Deployed.can_transition(PendingDeploy));
        assert!(!Deployed.can_transition(DeployFailed));
        assert!(!PendingUpload.can_transition(Deployed));
        assert!(!DeployFailed.can_transition(Deployed));
    }

    #[test]
    fn name_roundtrip() {
        use DeploymentState::*;

        for state in [PendingUpload, Uploaded, PendingDeploy, Deployed, DeployFailed] {
            assert_eq!(state.as_str().parse::<DeploymentState>(), Ok(state));
        }
        assert!("live".parse::<DeploymentState>().is_err());
    }
}
