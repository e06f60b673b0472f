//! The narrow interface through which the tracer core reaches the traced
//! process. The Windows `Debugger` implements it for real processes; tests
//! implement it over a plain in-memory address space.

use serde::Serialize;

use crate::breakpoints::Hook;
use crate::error::Result;

/// Pointer width of the traced process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Bitness {
    X86,
    X64,
}

impl Bitness {
    /// Size of one machine word / stack slot in bytes.
    pub fn word_size(self) -> usize {
        match self {
            Self::X86 => 4,
            Self::X64 => 8,
        }
    }
}

impl std::fmt::Display for Bitness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X86 => write!(f, "32-bit"),
            Self::X64 => write!(f, "64-bit"),
        }
    }
}

/// Capabilities the core consumes from the debugger. Every method must only
/// be called while the traced process is suspended in a debug event.
pub trait Debuggee {
    fn bits(&self) -> Bitness;

    /// Reads up to `buf.len()` bytes at `addr`. Returns how many bytes were
    /// actually read; a read that cannot start at all is an error.
    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes `buf` at `addr`, returning the number of bytes written.
    fn write_mem(&mut self, addr: u64, buf: &[u8]) -> Result<usize>;

    /// Places a permanent software breakpoint at `addr` which reports `hook`
    /// each time it is hit.
    fn break_at(&mut self, addr: u64, hook: Hook) -> Result<()>;

    /// Kills the traced process. The debug loop keeps running until the
    /// exit event is delivered.
    fn terminate(&mut self) -> Result<()>;
}
