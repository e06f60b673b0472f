//! An in-memory `Debuggee` used by the unit and integration tests: a sparse
//! byte-addressed memory, a record of placed breakpoints and of termination
//! requests, plus a builder for minimal PE images with export tables.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use crate::breakpoints::Hook;
use crate::error::{Error, Result};
use crate::target::{Bitness, Debuggee};

#[derive(Debug)]
pub struct FakeDebuggee {
    bits: Bitness,
    memory: BTreeMap<u64, u8>,
    /// Addresses where `break_at` fails, as if the page were not writable.
    pub unbreakable: HashSet<u64>,
    /// Address ranges where `write_mem` fails.
    pub read_only: Vec<Range<u64>>,
    /// Writes report success but leave the bytes unmapped, as if the page
    /// were released right after.
    pub discard_writes: bool,
    pub breakpoints: Vec<(u64, Hook)>,
    pub terminate_calls: usize,
}

impl FakeDebuggee {
    pub fn new(bits: Bitness) -> Self {
        Self {
            bits,
            memory: BTreeMap::new(),
            unbreakable: HashSet::new(),
            read_only: Vec::new(),
            discard_writes: false,
            breakpoints: Vec::new(),
            terminate_calls: 0,
        }
    }

    pub fn map(&mut self, addr: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, *b);
        }
    }

    pub fn map_words32(&mut self, addr: u64, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            self.map(addr + 4 * i as u64, &w.to_le_bytes());
        }
    }

    /// Maps `s` as UTF-16LE followed by a null terminator.
    pub fn map_wide(&mut self, addr: u64, s: &str) {
        let mut bytes: Vec<u8> = s.encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        bytes.extend_from_slice(&[0, 0]);
        self.map(addr, &bytes);
    }

    pub fn byte(&self, addr: u64) -> Option<u8> {
        self.memory.get(&addr).copied()
    }

    pub fn hook_at(&self, addr: u64) -> Option<Hook> {
        self.breakpoints.iter().find(|(a, _)| *a == addr).map(|(_, h)| *h)
    }
}

impl Debuggee for FakeDebuggee {
    fn bits(&self) -> Bitness {
        self.bits
    }

    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let mut read = 0;
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.memory.get(&(addr + i as u64)) {
                Some(b) => *slot = *b,
                None => break,
            }
            read += 1;
        }
        if read == 0 && !buf.is_empty() {
            return Err(Error::MemoryRead { addr });
        }
        Ok(read)
    }

    fn write_mem(&mut self, addr: u64, buf: &[u8]) -> Result<usize> {
        let span = addr..addr + buf.len() as u64;
        if span.clone().any(|a| !self.memory.contains_key(&a))
            || self.read_only.iter().any(|r| r.start < span.end && span.start < r.end) {
            return Err(Error::MemoryWrite { addr });
        }
        if self.discard_writes {
            for a in span {
                self.memory.remove(&a);
            }
        } else {
            self.map(addr, buf);
        }
        Ok(buf.len())
    }

    fn break_at(&mut self, addr: u64, hook: Hook) -> Result<()> {
        if self.unbreakable.contains(&addr) {
            return Err(Error::MemoryWrite { addr });
        }
        self.breakpoints.push((addr, hook));
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        self.terminate_calls += 1;
        Ok(())
    }
}

/// `SizeOfImage` advertised by every `fake_image`.
pub const FAKE_IMAGE_SIZE: u32 = 0x0010_0000;

/// Builds a headers-only PE image exporting `exports` (name, function RVA)
/// and `forwarders` (name, forwarder string).
pub fn fake_image(bits: Bitness, exports: &[(&str, u32)],
                  forwarders: &[(&str, &str)]) -> Vec<u8> {
    const NT: usize = 0x80;
    const EXPORT_DIR: usize = 0x200;
    const SIZE_OF_IMAGE: usize = 56;

    enum Entry<'a> { Rva(u32), Forward(&'a str) }

    let mut entries: Vec<(&str, Entry)> = exports.iter()
        .map(|(n, rva)| (*n, Entry::Rva(*rva)))
        .chain(forwarders.iter().map(|(n, to)| (*n, Entry::Forward(*to))))
        .collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    let n = entries.len();

    let functions = EXPORT_DIR + 40;
    let ordinals = functions + 4 * n;
    let names = (ordinals + 2 * n + 3) & !3;
    let mut image = vec![0u8; names + 4 * n];
    let put16 = |img: &mut Vec<u8>, at: usize, v: u16| {
        img[at..at + 2].copy_from_slice(&v.to_le_bytes())
    };
    let put32 = |img: &mut Vec<u8>, at: usize, v: u32| {
        img[at..at + 4].copy_from_slice(&v.to_le_bytes())
    };

    put16(&mut image, 0, 0x5a4d);
    put32(&mut image, 0x3c, NT as u32);
    put32(&mut image, NT, 0x0000_4550);
    let opt = NT + 24;
    let (machine, magic, count_off, dirs_off) = match bits {
        Bitness::X86 => (0x014c, 0x10b, 92, 96),
        Bitness::X64 => (0x8664, 0x20b, 108, 112),
    };
    // IMAGE_FILE_HEADER: no sections, full 16-entry data directory
    put16(&mut image, NT + 4, machine);
    put16(&mut image, NT + 20, (dirs_off + 16 * 8) as u16);
    put16(&mut image, NT + 22, 0x2102);

    put16(&mut image, opt, magic);
    put32(&mut image, opt + 32, 0x1000);
    put32(&mut image, opt + 36, 0x200);
    put32(&mut image, opt + SIZE_OF_IMAGE, FAKE_IMAGE_SIZE);
    put32(&mut image, opt + 60, EXPORT_DIR as u32);
    put32(&mut image, opt + count_off, 16);

    put32(&mut image, EXPORT_DIR + 0x14, n as u32);
    put32(&mut image, EXPORT_DIR + 0x18, n as u32);
    put32(&mut image, EXPORT_DIR + 0x1c, functions as u32);
    put32(&mut image, EXPORT_DIR + 0x20, names as u32);
    put32(&mut image, EXPORT_DIR + 0x24, ordinals as u32);

    for (i, (name, entry)) in entries.iter().enumerate() {
        put16(&mut image, ordinals + 2 * i, i as u16);
        let name_rva = image.len() as u32;
        put32(&mut image, names + 4 * i, name_rva);
        image.extend_from_slice(name.as_bytes());
        image.push(0);

        let rva = match entry {
            Entry::Rva(rva) => *rva,
            Entry::Forward(to) => {
                let at = image.len() as u32;
                image.extend_from_slice(to.as_bytes());
                image.push(0);
                at
            }
        };
        put32(&mut image, functions + 4 * i, rva);
    }

    put32(&mut image, opt + dirs_off, EXPORT_DIR as u32);
    let export_size = (image.len() - EXPORT_DIR) as u32;
    put32(&mut image, opt + dirs_off + 4, export_size);
    image
}
