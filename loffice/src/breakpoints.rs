//! Which functions get intercepted, and placing breakpoints on them as their
//! modules are mapped into the traced process.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::pe;
use crate::target::{Bitness, Debuggee};

/// Identity of an interception. A breakpoint hit reports one of these and the
/// session dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Hook {
    /// `InternetCrackUrlW` / `WinHttpCrackUrl`
    CrackUrl,
    /// `CreateFileW`
    CreateFile,
    /// `CreateProcessInternalW`
    CreateProcess,
    /// `IWbemServices::ExecQuery` through its ole32 proxy stub
    WmiExecQuery,
    /// `IWbemServices::ExecMethod` through its ole32 proxy stub
    WmiExecMethod,
    /// Internal string comparison routine of the VBA runtime
    VbaStrCmp,
}

/// Where inside a module a breakpoint goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakTarget {
    Export(&'static str),
    /// Offset from the module base, for code that is not exported.
    Offset(usize),
}

impl std::fmt::Display for BreakTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Export(name) => write!(f, "{name}"),
            Self::Offset(off) => write!(f, "{off:#x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointSpec {
    /// Module name without the `.dll` extension, e.g. `kernel32`.
    pub module: &'static str,
    pub target: BreakTarget,
    pub hook: Hook,
}

/// What to do when a breakpoint cannot be resolved or placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FailurePolicy {
    /// Stop the whole session with a configuration error.
    #[default]
    AbortOnFailure,
    /// Log it and run without that interception.
    SkipOnFailure,
}

/// Major version of the Office suite, as in the `OfficeNN` install folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OfficeVersion(pub u32);

impl OfficeVersion {
    /// Parses the trailing `OfficeNN` component of an install directory such
    /// as `C:\Program Files\Microsoft Office\Office15`.
    pub fn from_install_dir(dir: &Path) -> Option<Self> {
        let name = dir.file_name()?.to_str()?;
        let digits = name.get(..6)
            .filter(|p| p.eq_ignore_ascii_case("office"))
            .and_then(|_| name.get(6..))?;
        digits.parse().ok().map(Self)
    }
}

impl std::fmt::Display for OfficeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Office{}", self.0)
    }
}

/// Interceptions present in every session.
pub const API_BREAKPOINTS: [BreakpointSpec; 6] = [
    BreakpointSpec { module: "kernel32",
        target: BreakTarget::Export("CreateProcessInternalW"),
        hook: Hook::CreateProcess },
    BreakpointSpec { module: "kernel32",
        target: BreakTarget::Export("CreateFileW"),
        hook: Hook::CreateFile },
    BreakpointSpec { module: "wininet",
        target: BreakTarget::Export("InternetCrackUrlW"),
        hook: Hook::CrackUrl },
    BreakpointSpec { module: "winhttp",
        target: BreakTarget::Export("WinHttpCrackUrl"),
        hook: Hook::CrackUrl },
    BreakpointSpec { module: "ole32",
        target: BreakTarget::Export("ObjectStublessClient20"),
        hook: Hook::WmiExecQuery },
    BreakpointSpec { module: "ole32",
        target: BreakTarget::Export("ObjectStublessClient24"),
        hook: Hook::WmiExecMethod },
];

/// Offset of the VBA string comparison routine inside `vbe7.dll`, which only
/// exists for builds somebody located it in.
pub fn vba_strcmp_offset(version: OfficeVersion, bits: Bitness)
    -> Result<usize> {
    match (version.0, bits) {
        (14, Bitness::X86) => Ok(0x2242e3),
        (15, Bitness::X86) => Ok(0x1fa521),
        (16, Bitness::X64) => Ok(0x35a909),
        _ => Err(Error::UnsupportedVersion {
            version: version.to_string(),
            bits: bits.to_string(),
        }),
    }
}

/// `true` when a mapped image called `image_name` (e.g. `KERNEL32.DLL`) is
/// the module `module` (e.g. `kernel32`).
pub fn matches_module(image_name: &str, module: &str) -> bool {
    let stem = match image_name.len().checked_sub(4) {
        Some(dot) if image_name.get(dot..)
            .is_some_and(|ext| ext.eq_ignore_ascii_case(".dll")) => {
            &image_name[..dot]
        }
        _ => image_name,
    };
    stem.eq_ignore_ascii_case(module)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledBreakpoint {
    pub spec: BreakpointSpec,
    pub addr: u64,
}

/// The interception table for one session. Built once the bitness of the
/// traced process is known, then consulted on every module load.
#[derive(Debug)]
pub struct BreakpointRegistry {
    specs: Vec<BreakpointSpec>,
    policy: FailurePolicy,
    installed: Vec<InstalledBreakpoint>,
    skipped: usize,
}

impl BreakpointRegistry {
    pub fn new(version: Option<OfficeVersion>, bits: Bitness,
               policy: FailurePolicy) -> Self {
        let mut specs = API_BREAKPOINTS.to_vec();

        match version.map(|v| vba_strcmp_offset(v, bits)) {
            Some(Ok(off)) => specs.push(BreakpointSpec {
                module: "vbe7",
                target: BreakTarget::Offset(off),
                hook: Hook::VbaStrCmp,
            }),
            Some(Err(e)) => warn!("{e}, VBA string comparisons not traced"),
            None => warn!("unknown Office version, VBA string comparisons \
                           not traced"),
        }

        Self { specs, policy, installed: Vec::new(), skipped: 0 }
    }

    pub fn specs(&self) -> &[BreakpointSpec] {
        &self.specs
    }

    pub fn installed(&self) -> &[InstalledBreakpoint] {
        &self.installed
    }

    /// Number of interceptions dropped under `SkipOnFailure`.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Places every breakpoint that belongs to the module just mapped at
    /// `base`. Returns how many were placed. Fails only under
    /// `AbortOnFailure`, with the error that made the breakpoint impossible.
    pub fn on_module_load<D: Debuggee + ?Sized>(&mut self, dbg: &mut D,
                                                image_name: &str, base: u64)
        -> Result<usize> {
        let mut placed = 0;
        let wanted: Vec<BreakpointSpec> = self.specs.iter()
            .filter(|s| matches_module(image_name, s.module))
            .copied()
            .collect();

        for spec in wanted {
            let attempt = resolve(&*dbg, &spec, base).and_then(|addr| {
                dbg.break_at(addr, spec.hook).map(|()| addr).map_err(|e| {
                    Error::BreakpointInstall {
                        module: spec.module.to_string(),
                        target: spec.target.to_string(),
                        addr,
                        reason: e.to_string(),
                    }
                })
            });

            match attempt {
                Ok(addr) => {
                    info!("breakpoint at {}!{} ({addr:#x})",
                          spec.module, spec.target);
                    self.installed.push(InstalledBreakpoint { spec, addr });
                    placed += 1;
                }
                Err(e) => match self.policy {
                    FailurePolicy::AbortOnFailure => {
                        error!("{e}");
                        return Err(e);
                    }
                    FailurePolicy::SkipOnFailure => {
                        warn!("{e}, continuing without it");
                        self.skipped += 1;
                    }
                },
            }
        }
        Ok(placed)
    }
}

/// Turns a `BreakpointSpec` into an absolute address inside the module mapped at `base`.
pub fn resolve<D: Debuggee + ?Sized>(dbg: &D, spec: &BreakpointSpec,
                                     base: u64) -> Result<u64> {
    let failed = |reason: String| Error::Resolution {
        module: spec.module.to_string(),
        target: spec.target.to_string(),
        reason,
    };

    match spec.target {
        BreakTarget::Offset(off) => base.checked_add(off as u64)
            .ok_or_else(|| failed("offset overflows address space".into())),
        BreakTarget::Export(name) => {
            let addr = pe::find_export(dbg, base, name)
                .map_err(|e| failed(e.to_string()))?;
            debug!("{}!{name} resolved to {addr:#x}", spec.module);
            Ok(addr)
        }
    }
}
