// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The instance status enum and its allowed-transition table.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Local record inserted, upstream `createInstance` not yet acknowledged.
    Creating,
    /// Upstream acknowledged creation; not yet started.
    Created,
    /// A start operation has been issued and is being monitored.
    Starting,
    /// Upstream reports the instance is running; health checks not started
    /// or not yet conclusive.
    Running,
    /// Health checks are in progress.
    HealthChecking,
    /// Healthy and serving; `connection` is populated.
    Ready,
    /// A stop has been issued and is being monitored.
    Stopping,
    /// Stopped cleanly.
    Stopped,
    /// Upstream reports the instance no longer exists (e.g. spot reclaim).
    Exited,
    /// Creation, start, or health checking failed terminally.
    Failed,
    /// Deleted via an explicit delete intent. Terminal; no further
    /// transitions are valid from this status.
    Terminated,
}

impl InstanceStatus {
    /// Whether a transition from `self` to `to` is one of the edges named
    /// in the lifecycle diagram.
    pub fn can_transition_to(self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if self == Terminated {
            return false;
        }
        if matches!(to, Exited | Terminated | Failed) {
            return true;
        }
        matches!(
            (self, to),
            (Creating, Created)
                | (Created, Starting)
                | (Stopped, Starting)
                | (Exited, Starting)
                | (Starting, Running)
                | (Running, Ready)
                | (Running, HealthChecking)
                | (HealthChecking, Ready)
                | (Running, Stopping)
                | (Ready, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Validate and describe a transition as a [`CoreError::Conflict`] when
    /// it isn't legal for a given instance.
    pub fn validate_transition(
        self,
        to: InstanceStatus,
        instance_id: &str,
    ) -> Result<(), CoreError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoreError::Conflict {
                instance_id: instance_id.to_string(),
                expected: format!("a state that can advance to {to:?}"),
                actual: format!("{self:?}"),
            })
        }
    }

    /// Parse an upstream-reported status string into the matching local
    /// status, case-insensitively. Returns `None` for upstream vocabulary
    /// this core has no corresponding status for, in which case the caller
    /// should leave the local status alone rather than guess.
    pub fn from_upstream_str(s: &str) -> Option<InstanceStatus> {
        match s.to_ascii_lowercase().as_str() {
            "creating" => Some(InstanceStatus::Creating),
            "created" => Some(InstanceStatus::Created),
            "starting" => Some(InstanceStatus::Starting),
            "running" => Some(InstanceStatus::Running),
            "health_checking" | "healthchecking" => Some(InstanceStatus::HealthChecking),
            "ready" => Some(InstanceStatus::Ready),
            "stopping" => Some(InstanceStatus::Stopping),
            "stopped" => Some(InstanceStatus::Stopped),
            "exited" => Some(InstanceStatus::Exited),
            "failed" => Some(InstanceStatus::Failed),
            "terminated" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Created => "created",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::HealthChecking => "health_checking",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Exited => "exited",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    #[test]
    fn happy_path_edges_are_legal() {
        assert!(Creating.can_transition_to(Created));
        assert!(Created.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Ready));
        assert!(Running.can_transition_to(HealthChecking));
        assert!(HealthChecking.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn restart_from_stopped_or_exited_is_legal() {
        assert!(Stopped.can_transition_to(Starting));
        assert!(Exited.can_transition_to(Starting));
    }

    #[test]
    fn reverse_edges_are_illegal() {
        assert!(!Running.can_transition_to(Starting));
        assert!(!Ready.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Ready));
    }

    #[test]
    fn terminated_is_a_sink() {
        assert!(!Terminated.can_transition_to(Failed));
        assert!(!Terminated.can_transition_to(Exited));
    }

    #[test]
    fn any_non_terminal_state_can_fail_or_exit_or_be_deleted() {
        for status in [Creating, Created, Starting, Running, HealthChecking, Ready, Stopping, Stopped, Exited, Failed] {
            assert!(status.can_transition_to(Failed));
            assert!(status.can_transition_to(Exited));
            assert!(status.can_transition_to(Terminated));
        }
    }

    #[test]
    fn from_upstream_str_is_case_insensitive_and_round_trips_display() {
        for status in [
            Creating, Created, Starting, Running, HealthChecking, Ready, Stopping, Stopped, Exited, Failed,
            Terminated,
        ] {
            let rendered = status.to_string();
            assert_eq!(InstanceStatus::from_upstream_str(&rendered), Some(status));
            assert_eq!(InstanceStatus::from_upstream_str(&rendered.to_uppercase()), Some(status));
        }
    }

    #[test]
    fn from_upstream_str_rejects_unknown_vocabulary() {
        assert_eq!(InstanceStatus::from_upstream_str("reclaimed"), None);
    }
}
