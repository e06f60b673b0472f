//! Argument extraction for intercepted calls.
//!
//! Breakpoints sit on the first instruction of the callee, so on both
//! architectures `[sp]` holds the return address:
//!
//! * 32-bit (stdcall): parameter `i` is the stack slot at `esp + 4 + 4*i`.
//! * 64-bit (Microsoft x64): parameters 0..=3 live in rcx, rdx, r8, r9 and
//!   parameter `i >= 4` at `rsp + 8 + 8*i`, past the 32-byte home area.
//!
//! Interpreters only name parameter positions; they never look at registers
//! or the stack themselves.

use widestring::U16String;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::target::{Bitness, Debuggee};

/// Upper bound on decoded string length, the largest `UNICODE_STRING`.
pub const MAX_WIDE_CHARS: usize = 0x7fff;

const PAGE_SIZE: u64 = 0x1000;
const CHUNK_SIZE: u64 = 0x200;

/// The callee parameter positions one interception needs, per architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgLayout<const N: usize> {
    pub x86: [usize; N],
    pub x64: [usize; N],
}

impl<const N: usize> ArgLayout<N> {
    /// Same positions on both architectures.
    pub const fn uniform(positions: [usize; N]) -> Self {
        Self { x86: positions, x64: positions }
    }

    /// Reads the raw machine words for every position of the layout.
    pub fn read<D: Debuggee + ?Sized>(&self, dbg: &D, ctx: &Context)
        -> Result<[u64; N]> {
        let mut words = [0u64; N];
        match ctx {
            Context::Wow64(_) => {
                for (word, &pos) in words.iter_mut().zip(&self.x86) {
                    *word = stack_arg(dbg, ctx.sp(), Bitness::X86, pos)?;
                }
            }
            Context::Native(_) => {
                for (word, &pos) in words.iter_mut().zip(&self.x64) {
                    *word = match ctx.register_arg(pos) {
                        Some(value) => value,
                        None => stack_arg(dbg, ctx.sp(), Bitness::X64, pos)?,
                    };
                }
            }
        }
        Ok(words)
    }
}

/// Parameter `index` passed on the stack of a thread stopped at function
/// entry.
pub fn stack_arg<D: Debuggee + ?Sized>(dbg: &D, sp: u64, bits: Bitness,
                                       index: usize) -> Result<u64> {
    let word = bits.word_size() as u64;
    let addr = (index as u64 + 1)
        .checked_mul(word)
        .and_then(|off| sp.checked_add(off))
        .ok_or(Error::MemoryRead { addr: sp })?;
    read_word(dbg, addr, bits)
}

/// Reads one little-endian machine word.
pub fn read_word<D: Debuggee + ?Sized>(dbg: &D, addr: u64, bits: Bitness)
    -> Result<u64> {
    let mut buf = [0u8; 8];
    let len = bits.word_size();
    if dbg.read_mem(addr, &mut buf[..len])? != len {
        return Err(Error::MemoryRead { addr });
    }
    Ok(u64::from_le_bytes(buf))
}

/// Decodes the null-terminated UTF-16 string at `ptr`. Reads are split on
/// page boundaries so a string ending just before an unmapped page still
/// decodes.
pub fn read_wide_string<D: Debuggee + ?Sized>(dbg: &D, ptr: u64)
    -> Result<String> {
    if ptr == 0 {
        return Err(Error::MemoryRead { addr: ptr });
    }

    let mut bytes: Vec<u8> = Vec::new();
    let mut units: Vec<u16> = Vec::new();
    let mut addr = ptr;

    while units.len() < MAX_WIDE_CHARS {
        let to_page_end = PAGE_SIZE - (addr % PAGE_SIZE);
        let mut chunk = vec![0u8; CHUNK_SIZE.min(to_page_end) as usize];
        let read = match dbg.read_mem(addr, &mut chunk) {
            Ok(n) => n,
            // Nothing decoded yet means the pointer itself is bad
            Err(e) if units.is_empty() && bytes.is_empty() => return Err(e),
            Err(_) => 0,
        };
        if read == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..read]);
        addr += read as u64;

        let whole = bytes.len() & !1;
        let mut terminated = false;
        for pair in bytes[..whole].chunks_exact(2) {
            let unit = u16::from_le_bytes([pair[0], pair[1]]);
            if unit == 0 {
                terminated = true;
                break;
            }
            units.push(unit);
        }
        if terminated {
            break;
        }
        bytes.drain(..whole);
    }

    units.truncate(MAX_WIDE_CHARS);
    Ok(U16String::from_vec(units).to_string_lossy())
}

/// Like `read_wide_string`, but an unreadable pointer becomes an empty
/// string so one bad argument never aborts the session.
pub fn wide_string_or_empty<D: Debuggee + ?Sized>(dbg: &D, ptr: u64,
                                                  what: &str) -> String {
    match read_wide_string(dbg, ptr) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(argument = what, ptr = format_args!("{ptr:#x}"),
                            "{e}, using empty string");
            String::new()
        }
    }
}
