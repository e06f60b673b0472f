//! Error type shared by the tracer core and the Windows backend.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A symbol or offset could not be turned into an address inside a
    /// loaded module.
    #[error("cannot resolve {module}!{target}: {reason}")]
    Resolution {
        module: String,
        target: String,
        reason: String,
    },

    /// The traced process refused a read at `addr`.
    #[error("cannot read debuggee memory at {addr:#x}")]
    MemoryRead { addr: u64 },

    #[error("cannot write debuggee memory at {addr:#x}")]
    MemoryWrite { addr: u64 },

    /// Decoy text longer than the buffer it must overwrite.
    #[error("decoy of {decoy} chars does not fit a query of {original} chars")]
    PatchBounds { decoy: usize, original: usize },

    #[error("no string-compare offset known for Office {version} ({bits})")]
    UnsupportedVersion { version: String, bits: String },

    #[error("cannot place breakpoint at {module}!{target} ({addr:#x}): {reason}")]
    BreakpointInstall {
        module: String,
        target: String,
        addr: u64,
        reason: String,
    },

    /// A Win32 call inside the debugger backend failed.
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Captures `GetLastError` for the Win32 call that just failed.
    pub fn last_os_error(call: &'static str) -> Self {
        Self::Os { call, source: std::io::Error::last_os_error() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
