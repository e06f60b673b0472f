//! In-place neutralization of WMI queries that enumerate processes or
//! installed products, two classes macros query to detect analysis machines.
//!
//! The query string is overwritten inside the caller's buffer with a decoy
//! against `Win32_Fan`, which is harmless to enumerate. A decoy is never
//! longer than the text it replaces, so the write stays inside the buffer.

use tracing::{info, warn};

use crate::args::read_wide_string;
use crate::error::{Error, Result};
use crate::target::Debuggee;

pub const DANGEROUS_CLASSES: [&str; 2] = ["win32_process", "win32_product"];

/// Decoys for queries carrying a filter, longest first. They keep an
/// always-false `WHERE` so code that parses the result sees the same shape.
pub const FILTERED_DECOYS: [&str; 2] = [
    "SELECT Name FROM Win32_Fan WHERE Name='1'",
    "SELECT*FROM Win32_Fan WHERE Name='1'",
];

pub const UNFILTERED_DECOYS: [&str; 2] = [
    "SELECT Name FROM Win32_Fan",
    "SELECT*FROM Win32_Fan",
];

/// A filtered query falls back to the unfiltered decoys when it is too
/// short for the filtered ones.
const FILTERED_CANDIDATES: [&str; 4] = [
    FILTERED_DECOYS[0], FILTERED_DECOYS[1],
    UNFILTERED_DECOYS[0], UNFILTERED_DECOYS[1],
];

/// Length in UTF-16 code units, the unit of the in-memory buffer.
pub fn wide_len(s: &str) -> usize {
    s.encode_utf16().count()
}

pub fn is_dangerous(query: &str) -> bool {
    let lower = query.to_lowercase();
    DANGEROUS_CLASSES.iter().any(|class| lower.contains(class))
}

/// An equality filter or a `LIKE` pattern match.
pub fn has_filter(query: &str) -> bool {
    query.contains('=') || query.to_lowercase().contains("like")
}

/// The decoy to write over `query`, or `None` when the query is harmless.
/// Fails with `PatchBounds` when even the shortest decoy would overrun the
/// original buffer.
pub fn select_decoy(query: &str) -> Result<Option<&'static str>> {
    if !is_dangerous(query) {
        return Ok(None);
    }

    let original = wide_len(query);
    let candidates: &[&'static str] = if has_filter(query) {
        &FILTERED_CANDIDATES
    } else {
        &UNFILTERED_DECOYS
    };

    candidates.iter()
        .find(|decoy| wide_len(decoy) <= original)
        .map(|decoy| Some(*decoy))
        .ok_or(Error::PatchBounds {
            decoy: candidates.iter().map(|d| wide_len(d)).min().unwrap_or(0),
            original,
        })
}

/// Overwrites the wide string at `ptr` (currently holding `original`) with
/// `decoy` and a two-byte terminator, then reads it back.
pub fn write_decoy<D: Debuggee + ?Sized>(dbg: &mut D, ptr: u64,
                                         original: &str, decoy: &str)
    -> Result<String> {
    let (decoy_len, original_len) = (wide_len(decoy), wide_len(original));
    if decoy_len > original_len {
        return Err(Error::PatchBounds {
            decoy: decoy_len,
            original: original_len,
        });
    }

    let mut bytes: Vec<u8> = decoy.encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect();
    bytes.extend_from_slice(&[0, 0]);

    if dbg.write_mem(ptr, &bytes)? != bytes.len() {
        return Err(Error::MemoryWrite { addr: ptr });
    }
    // The write went through, so the decoy is what the caller will see
    match read_wide_string(&*dbg, ptr) {
        Ok(text) => Ok(text),
        Err(e) => {
            warn!("cannot read back patched query at {ptr:#x}: {e}");
            Ok(decoy.to_string())
        }
    }
}

/// Neutralizes the query at `ptr` if it needs it. Returns the text now in
/// memory, or `None` when the query was left alone.
pub fn neutralize<D: Debuggee + ?Sized>(dbg: &mut D, ptr: u64, query: &str)
    -> Result<Option<String>> {
    let Some(decoy) = select_decoy(query)? else {
        return Ok(None);
    };
    let patched = write_decoy(dbg, ptr, query, decoy)?;
    info!("Patched with: \"{patched}\"");
    Ok(Some(patched))
}
