//! Export lookup on modules mapped in the traced process.
//!
//! The image is copied out of debuggee memory and handed to `pelite` as a
//! mapped view, so no file on disk is involved.

use pelite::image::{IMAGE_DOS_SIGNATURE, IMAGE_NT_HEADERS_SIGNATURE};
use pelite::pe32::{Pe as Pe32, PeView as PeView32};
use pelite::pe64::{Pe, PeView};
use thiserror::Error;

use crate::error::Error;
use crate::target::{Bitness, Debuggee};

const PAGE_SIZE: u64 = 0x1000;
const E_LFANEW_OFFSET: u64 = 0x3c;
/// From the NT signature: 4 + IMAGE_FILE_HEADER (20) + 56 into the
/// optional header.
const SIZE_OF_IMAGE_OFFSET: u64 = 80;
/// Upper bound on `SizeOfImage` we are willing to copy out of the debuggee.
const MAX_IMAGE_SIZE: u32 = 0x0400_0000;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no valid PE header at module base: {0}")]
    NotPe(pelite::Error),
    #[error("module has no usable export directory: {0}")]
    NoExports(pelite::Error),
    #[error("export not found")]
    NotFound,
    #[error("export is forwarded to {0}")]
    Forwarded(String),
    #[error("SizeOfImage of {0:#x} bytes is not plausible")]
    ImageSize(u32),
    #[error(transparent)]
    Memory(#[from] Error),
}

/// Address of the export `name` in the module mapped at `base`. The image
/// format follows the bitness of the traced process.
pub fn find_export<D: Debuggee + ?Sized>(dbg: &D, base: u64, name: &str)
    -> Result<u64, LookupError> {
    let size = image_size(dbg, base)?;
    let image = read_image(dbg, base, size as usize)?;

    let rva = match dbg.bits() {
        Bitness::X64 => export_rva64(&image, name)?,
        Bitness::X86 => export_rva32(&image, name)?,
    };
    Ok(base + rva as u64)
}

/// `SizeOfImage` of the module mapped at `base`. Only the few header fields
/// on the way are read, and they sit at the same offsets in PE32 and PE32+,
/// so this also works for the 64-bit system modules of a WOW64 process.
pub fn image_size<D: Debuggee + ?Sized>(dbg: &D, base: u64)
    -> Result<u32, LookupError> {
    if read_u32(dbg, base)? & 0xffff != IMAGE_DOS_SIGNATURE as u32 {
        return Err(LookupError::NotPe(pelite::Error::BadMagic));
    }
    let nt = base + read_u32(dbg, base + E_LFANEW_OFFSET)? as u64;
    if read_u32(dbg, nt)? != IMAGE_NT_HEADERS_SIGNATURE {
        return Err(LookupError::NotPe(pelite::Error::BadMagic));
    }

    let size = read_u32(dbg, nt + SIZE_OF_IMAGE_OFFSET)?;
    if size == 0 || size > MAX_IMAGE_SIZE {
        return Err(LookupError::ImageSize(size));
    }
    Ok(size)
}

fn export_rva64(image: &[u8], name: &str) -> Result<u32, LookupError> {
    use pelite::pe64::exports::Export;

    let pe = PeView::from_bytes(image).map_err(LookupError::NotPe)?;
    let by = pe.exports()
        .and_then(|exports| exports.by())
        .map_err(LookupError::NoExports)?;
    match by.name(name).map_err(|_| LookupError::NotFound)? {
        Export::Symbol(&rva) => Ok(rva),
        Export::Forward(to) => {
            Err(LookupError::Forwarded(to.to_str().unwrap_or_default().into()))
        }
    }
}

fn export_rva32(image: &[u8], name: &str) -> Result<u32, LookupError> {
    use pelite::pe32::exports::Export;

    let pe = PeView32::from_bytes(image).map_err(LookupError::NotPe)?;
    let by = pe.exports()
        .and_then(|exports| exports.by())
        .map_err(LookupError::NoExports)?;
    match by.name(name).map_err(|_| LookupError::NotFound)? {
        Export::Symbol(&rva) => Ok(rva),
        Export::Forward(to) => {
            Err(LookupError::Forwarded(to.to_str().unwrap_or_default().into()))
        }
    }
}

/// Copies `size` bytes of the image at `base` page by page. Pages the
/// debuggee refuses to read stay zeroed; only the header page must be there.
fn read_image<D: Debuggee + ?Sized>(dbg: &D, base: u64, size: usize)
    -> Result<Vec<u8>, Error> {
    let mut image = vec![0u8; size];
    for (i, page) in image.chunks_mut(PAGE_SIZE as usize).enumerate() {
        let addr = base + i as u64 * PAGE_SIZE;
        match dbg.read_mem(addr, page) {
            Ok(_) => {}
            Err(e) if i == 0 => return Err(e),
            Err(_) => {}
        }
    }
    Ok(image)
}

fn read_u32<D: Debuggee + ?Sized>(dbg: &D, addr: u64) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    if dbg.read_mem(addr, &mut buf)? != buf.len() {
        return Err(Error::MemoryRead { addr });
    }
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_image, FakeDebuggee, FAKE_IMAGE_SIZE};

    const BASE: u64 = 0x7ff0_0000;

    fn loaded(bits: Bitness) -> FakeDebuggee {
        let mut dbg = FakeDebuggee::new(bits);
        let image = fake_image(bits,
            &[("CreateFileW", 0x1230), ("CreateProcessInternalW", 0x4560),
              ("BeepW", 0x10)],
            &[("HeapAlloc", "NTDLL.RtlAllocateHeap")]);
        dbg.map(BASE, &image);
        dbg
    }

    #[test]
    fn resolves_names_in_both_formats() {
        for bits in [Bitness::X86, Bitness::X64] {
            let dbg = loaded(bits);
            assert_eq!(find_export(&dbg, BASE, "CreateFileW").unwrap(),
                       BASE + 0x1230);
            assert_eq!(find_export(&dbg, BASE, "CreateProcessInternalW")
                           .unwrap(), BASE + 0x4560);
            assert_eq!(find_export(&dbg, BASE, "BeepW").unwrap(), BASE + 0x10);
        }
    }

    #[test]
    fn missing_and_forwarded_exports() {
        let dbg = loaded(Bitness::X64);
        assert!(matches!(find_export(&dbg, BASE, "CreateFileA"),
                         Err(LookupError::NotFound)));
        match find_export(&dbg, BASE, "HeapAlloc") {
            Err(LookupError::Forwarded(to)) => {
                assert_eq!(to, "NTDLL.RtlAllocateHeap")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn size_of_image() {
        for bits in [Bitness::X86, Bitness::X64] {
            assert_eq!(image_size(&loaded(bits), BASE).unwrap(), FAKE_IMAGE_SIZE);
        }
    }

    #[test]
    fn wow64_process_sizes_native_modules() {
        let mut dbg = FakeDebuggee::new(Bitness::X86);
        dbg.map(BASE, &fake_image(Bitness::X64, &[("NtClose", 0x20)], &[]));
        assert_eq!(image_size(&dbg, BASE).unwrap(), FAKE_IMAGE_SIZE);
    }

    #[test]
    fn garbage_base_is_not_pe() {
        let mut dbg = FakeDebuggee::new(Bitness::X64);
        dbg.map(BASE, &[0u8; 0x100]);
        assert!(matches!(find_export(&dbg, BASE, "x"),
                         Err(LookupError::NotPe(_))));
        assert!(matches!(find_export(&dbg, 0x10, "x"),
                         Err(LookupError::Memory(_))));
    }
}
