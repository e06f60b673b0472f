//! When the traced process has to die.
//!
//! ```text
//! Running --(stop decision)--> Terminating --(kill issued)--> Terminated
//! ```
//!
//! Only `Running` reacts to signals, so a session asks for at most one kill.

use serde::Serialize;
use tracing::info;

use crate::events::Signal;

/// Chosen once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitPolicy {
    /// Stop at the first URL, before anything is downloaded.
    StopOnUrl,
    /// Let downloads happen but stop before a payload is started.
    StopOnProcess,
    /// Never stop. The document runs unsupervised.
    RunToCompletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionState {
    Running,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StopReason {
    UrlFound { url: String },
    ProcessCreated { app: String },
    /// A process appeared under `StopOnUrl` before any URL was seen; a
    /// payload may already have been fetched some other way.
    ProcessBeforeUrl { app: String },
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UrlFound { url } => write!(f, "first URL found: {url}"),
            Self::ProcessCreated { app } => write!(f, "process created: {app}"),
            Self::ProcessBeforeUrl { app } => {
                write!(f, "process created before any URL: {app}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitController {
    policy: ExitPolicy,
    state: ExecutionState,
}

impl ExitController {
    pub fn new(policy: ExitPolicy) -> Self {
        Self { policy, state: ExecutionState::Running }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ExecutionState::Running
    }

    /// Feeds one signal through the policy. Returns the reason to stop when
    /// this signal moves the session to `Terminating`.
    pub fn observe(&mut self, signal: &Signal) -> Option<StopReason> {
        if !self.is_running() {
            return None;
        }

        let reason = match (self.policy, signal) {
            (ExitPolicy::StopOnUrl, Signal::UrlFound(url)) => {
                info!("Exiting on first URL, bye!");
                StopReason::UrlFound { url: url.clone() }
            }
            // Still running under StopOnUrl means no URL has been seen yet.
            // The spooler exemption deliberately does not apply here.
            (ExitPolicy::StopOnUrl, Signal::ProcessCreated { app, .. }) => {
                info!("Process created before URL was found, exiting for \
                       safety.");
                StopReason::ProcessBeforeUrl { app: app.clone() }
            }
            (ExitPolicy::StopOnProcess,
             Signal::ProcessCreated { app, exempt: false }) => {
                info!("Exiting on process creation, bye!");
                StopReason::ProcessCreated { app: app.clone() }
            }
            _ => return None,
        };

        self.state = ExecutionState::Terminating;
        Some(reason)
    }

    /// Moves to `Terminating` for a reason outside the policy (operator
    /// interrupt, fatal error). `false` if a stop is already under way.
    pub fn force_stop(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.state = ExecutionState::Terminating;
        true
    }

    /// The kill request has been issued.
    pub fn mark_terminated(&mut self) {
        self.state = ExecutionState::Terminated;
    }
}
