//! One tracing session: owns the interception table, the results and the
//! exit controller, and reacts to what the debug loop reports.
//!
//! Nothing in here touches Win32 directly. The backend forwards process
//! start, module loads, breakpoint hits and the process exit; whatever has
//! to happen to the process goes back through `Debuggee`.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::breakpoints::{BreakpointRegistry, FailurePolicy, Hook, OfficeVersion};
use crate::context::Context;
use crate::error::Error;
use crate::events::Interpreter;
use crate::policy::{ExecutionState, ExitController, ExitPolicy, StopReason};
use crate::results::{Aggregator, ResultStore, Stats};
use crate::target::Debuggee;

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    /// The Office (or script host) executable to start.
    pub target: PathBuf,
    /// Document handed to `target` as its only argument.
    pub document: PathBuf,
    pub exit_policy: ExitPolicy,
    pub verbose: bool,
    pub writes_only: bool,
    pub failure_policy: FailurePolicy,
    /// Selects the VBA string-compare offset. `None` leaves it out.
    pub office_version: Option<OfficeVersion>,
}

impl SessionConfig {
    /// Command line for the traced process, program first.
    pub fn command_line(&self) -> Vec<String> {
        [&self.target, &self.document].iter()
            .map(|p| p.display().to_string())
            .collect()
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// The process exited on its own.
    Completed,
    /// The exit policy killed the process.
    PolicyTerminated(StopReason),
    /// A required interception could not be put in place.
    ConfigurationError(String),
    /// Tracing could not continue safely, e.g. a query could not be
    /// neutralized.
    InternalError(String),
    /// The operator asked to stop.
    Interrupted,
}

impl Outcome {
    /// Process exit status the CLI reports for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed | Self::PolicyTerminated(_) => 0,
            Self::ConfigurationError(_) => 2,
            Self::InternalError(_) => 3,
            Self::Interrupted => 130,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "process exited"),
            Self::PolicyTerminated(reason) => write!(f, "terminated, {reason}"),
            Self::ConfigurationError(e) => write!(f, "configuration error: {e}"),
            Self::InternalError(e) => write!(f, "internal error: {e}"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// The final record of a session.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub outcome: Outcome,
    pub stats: Stats,
    pub results: ResultStore,
}

#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    interpreter: Interpreter,
    /// Built on process start, once the bitness is known.
    registry: Option<BreakpointRegistry>,
    aggregator: Aggregator,
    controller: ExitController,
    outcome: Option<Outcome>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            interpreter: Interpreter::new(config.writes_only),
            controller: ExitController::new(config.exit_policy),
            registry: None,
            aggregator: Aggregator::new(),
            outcome: None,
            config,
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.aggregator.stats
    }

    pub fn results(&self) -> &ResultStore {
        &self.aggregator.results
    }

    pub fn state(&self) -> ExecutionState {
        self.controller.state()
    }

    pub fn registry(&self) -> Option<&BreakpointRegistry> {
        self.registry.as_ref()
    }

    pub fn on_process_start<D: Debuggee + ?Sized>(&mut self, dbg: &D) {
        info!("Tracing {} process", dbg.bits());
        self.registry = Some(BreakpointRegistry::new(self.config.office_version,
                                                     dbg.bits(),
                                                     self.config.failure_policy));
    }

    /// Places the breakpoints of a freshly mapped module.
    pub fn on_module_load<D: Debuggee + ?Sized>(&mut self, dbg: &mut D,
                                                image_name: &str, base: u64) {
        if !self.controller.is_running() {
            return;
        }
        debug!("module {image_name} at {base:#x}");

        let registry = self.registry.get_or_insert_with(|| {
            BreakpointRegistry::new(self.config.office_version, dbg.bits(),
                                    self.config.failure_policy)
        });
        if let Err(e) = registry.on_module_load(dbg, image_name, base) {
            self.stop(dbg, Outcome::ConfigurationError(e.to_string()));
        }
    }

    /// Handles one hit of an installed breakpoint. Hits arriving after a
    /// stop decision are ignored.
    pub fn on_breakpoint<D: Debuggee + ?Sized>(&mut self, dbg: &mut D,
                                               hook: Hook, ctx: &Context) {
        if !self.controller.is_running() {
            debug!("{hook:?} hit while stopping, ignored");
            return;
        }

        let event = match self.interpreter.interpret(hook, dbg, ctx) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e @ Error::MemoryRead { .. }) => {
                warn!("{hook:?}: {e}, call not recorded");
                return;
            }
            Err(e) => {
                error!("{hook:?}: {e}, killing the process");
                self.stop(dbg, Outcome::InternalError(e.to_string()));
                return;
            }
        };

        self.aggregator.merge(&event);

        if let Some(reason) = event.signal()
                .and_then(|signal| self.controller.observe(&signal)) {
            self.finish_stop(dbg, Outcome::PolicyTerminated(reason));
        }
    }

    /// Operator interrupt. Kills the process unless a stop is under way.
    pub fn interrupt<D: Debuggee + ?Sized>(&mut self, dbg: &mut D) {
        info!("Interrupted, terminating the traced process");
        self.stop(dbg, Outcome::Interrupted);
    }

    /// The debug loop itself failed. Whatever was collected so far is kept
    /// and the process is killed unless a stop is already under way.
    pub fn abort<D: Debuggee + ?Sized>(&mut self, dbg: &mut D, err: &Error) {
        error!("debug loop failed: {err}, killing the process");
        self.stop(dbg, Outcome::InternalError(err.to_string()));
    }

    /// The traced process is gone.
    pub fn on_exit(&mut self, exit_code: u32) {
        info!("Process exited with {exit_code:#x}");
        if self.outcome.is_none() {
            self.outcome = Some(Outcome::Completed);
        }
        self.controller.force_stop();
        self.controller.mark_terminated();
    }

    /// Snapshot of the session so far. A session that never saw the process
    /// exit or stop reports `Completed`.
    pub fn report(&self) -> Report {
        Report {
            outcome: self.outcome.clone().unwrap_or(Outcome::Completed),
            stats: self.aggregator.stats,
            results: self.aggregator.results.clone(),
        }
    }

    pub fn into_report(self) -> Report {
        Report {
            outcome: self.outcome.unwrap_or(Outcome::Completed),
            stats: self.aggregator.stats,
            results: self.aggregator.results,
        }
    }

    fn stop<D: Debuggee + ?Sized>(&mut self, dbg: &mut D, outcome: Outcome) {
        if self.controller.force_stop() {
            self.finish_stop(dbg, outcome);
        }
    }

    /// Records the outcome and issues the kill. The controller is already
    /// in `Terminating`.
    fn finish_stop<D: Debuggee + ?Sized>(&mut self, dbg: &mut D,
                                         outcome: Outcome) {
        self.outcome = Some(outcome);
        if let Err(e) = dbg.terminate() {
            error!("cannot terminate the traced process: {e}");
        }
        self.controller.mark_terminated();
    }
}
