//! Dynamic analysis of malicious Office documents: the document is opened
//! under a debugger, the Win32 and VBA calls its macros rely on are
//! intercepted, and the process is killed according to an exit policy.
//!
//! Everything except the Windows backend (`debugger`, `trace`) is plain
//! Rust over the `Debuggee` trait and builds on any platform.

pub mod args;
pub mod breakpoints;
pub mod context;
pub mod error;
pub mod events;
pub mod patch;
pub mod pe;
pub mod policy;
pub mod results;
pub mod session;
pub mod target;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(windows)]
pub mod dbg_callbacks;
#[cfg(windows)]
pub mod debugger;
#[cfg(windows)]
pub mod trace;
#[cfg(windows)]
pub mod windows;

pub use breakpoints::{FailurePolicy, Hook, OfficeVersion};
pub use error::{Error, Result};
pub use policy::{ExitPolicy, StopReason};
pub use results::{ResultStore, Stats};
pub use session::{Outcome, Report, Session, SessionConfig};
pub use target::{Bitness, Debuggee};
