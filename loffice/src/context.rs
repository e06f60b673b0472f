//! Thread contexts captured when a breakpoint fires.
//! `Context` hides whether the debuggee is a native 64-bit process or a
//! 32-bit process running under WOW64. The raw layouts match the Win32
//! `CONTEXT` (AMD64) and `WOW64_CONTEXT` structures so the same values can be
//! handed to `GetThreadContext` / `Wow64GetThreadContext`.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

/// CONTEXT_AMD64 | CONTROL | INTEGER | SEGMENTS | FLOATING_POINT | DEBUG_REGISTERS
pub const CONTEXT_ALL: u32 = 0x0010_001f;

/// WOW64_CONTEXT_i386 | CONTROL | INTEGER | SEGMENTS | FLOATING_POINT
/// | DEBUG_REGISTERS | EXTENDED_REGISTERS
pub const WOW64_CONTEXT_ALL: u32 = 0x0001_003f;

const TRAP_FLAG: u32 = 1 << 8;

#[repr(C, align(16))]
#[derive(Default, Debug, Clone)]
pub struct CONTEXT {
    pub HomeArea: [u64; 6],
    pub ContextFlags: u32,
    pub MxCsr: u32,
    pub Segments: [u16; 6],
    pub EFlags: u32,
    pub DebugRegisters: [u64; 6],
    pub Rax: u64,
    pub Rcx: u64,
    pub Rdx: u64,
    pub Rbx: u64,
    pub Rsp: u64,
    pub Rbp: u64,
    pub Rsi: u64,
    pub Rdi: u64,
    pub R8: u64,
    pub R9: u64,
    pub R10: u64,
    pub R11: u64,
    pub R12: u64,
    pub R13: u64,
    pub R14: u64,
    pub R15: u64,
    pub Rip: u64,
    /// XSAVE_FORMAT, 512 bytes. Never interpreted here.
    pub FltSave: [[u64; 8]; 8],
    pub VectorRegister: [[u64; 2]; 26],
    pub VectorControl: u64,
    pub DebugControl: u64,
    pub LastBranchToRip: u64,
    pub LastBranchFromRip: u64,
    pub LastExceptionToRip: u64,
    pub LastExceptionFromRip: u64,
}

#[repr(C)]
#[derive(Default, Debug, Clone)]
pub struct WOW64_CONTEXT {
    pub ContextFlags: u32,
    pub DebugRegisters: [u32; 6],
    /// WOW64_FLOATING_SAVE_AREA, 112 bytes.
    pub FloatSave: [u32; 28],
    pub SegGs: u32,
    pub SegFs: u32,
    pub SegEs: u32,
    pub SegDs: u32,
    pub Edi: u32,
    pub Esi: u32,
    pub Ebx: u32,
    pub Edx: u32,
    pub Ecx: u32,
    pub Eax: u32,
    pub Ebp: u32,
    pub Eip: u32,
    pub SegCs: u32,
    pub EFlags: u32,
    pub Esp: u32,
    pub SegSs: u32,
    pub ExtendedRegisters: [[u32; 16]; 8],
}

/// Register view of one thread, valid only while that thread is suspended.
#[derive(Debug, Clone)]
pub enum Context {
    Native(CONTEXT),
    Wow64(WOW64_CONTEXT),
}

impl Context {
    pub fn new(wow64: bool) -> Self {
        if wow64 {
            Self::Wow64(WOW64_CONTEXT {
                ContextFlags: WOW64_CONTEXT_ALL,
                ..Default::default()
            })
        } else {
            Self::Native(CONTEXT {
                ContextFlags: CONTEXT_ALL,
                ..Default::default()
            })
        }
    }

    pub fn is_wow64(&self) -> bool {
        matches!(self, Self::Wow64(_))
    }

    /// Set the instruction pointer
    pub fn set_ip(&mut self, ip: u64) {
        match self {
            Self::Native(c) => c.Rip = ip,
            Self::Wow64(c) => c.Eip = ip as u32,
        }
    }

    /// Get the stack pointer
    pub fn sp(&self) -> u64 {
        match self {
            Self::Native(c) => c.Rsp,
            Self::Wow64(c) => c.Esp as u64,
        }
    }

    /// Integer argument register `index` of the x64 calling convention
    /// (rcx, rdx, r8, r9). `None` for stack arguments and for WOW64 threads,
    /// which pass everything on the stack.
    pub fn register_arg(&self, index: usize) -> Option<u64> {
        match self {
            Self::Native(c) => match index {
                0 => Some(c.Rcx),
                1 => Some(c.Rdx),
                2 => Some(c.R8),
                3 => Some(c.R9),
                _ => None,
            },
            Self::Wow64(_) => None,
        }
    }

    pub fn set_trap_flag(&mut self, v: bool) {
        let eflags = match self {
            Self::Native(c) => &mut c.EFlags,
            Self::Wow64(c) => &mut c.EFlags,
        };
        if v {
            *eflags |= TRAP_FLAG;
        } else {
            *eflags &= !TRAP_FLAG;
        }
    }
}

#[cfg(windows)]
impl Context {
    /// Fills `self` with the registers of the suspended thread `h_thread`.
    pub fn load(&mut self, h_thread: crate::windows::HANDLE)
        -> crate::error::Result<()> {
        use crate::windows::{GetThreadContext, Wow64GetThreadContext};

        let ok = match self {
            Self::Native(c) => unsafe { GetThreadContext(h_thread, c) },
            Self::Wow64(c) => unsafe { Wow64GetThreadContext(h_thread, c) },
        };
        if !ok {
            return Err(crate::error::Error::last_os_error("GetThreadContext"));
        }
        Ok(())
    }

    /// Writes `self` back to the suspended thread `h_thread`.
    pub fn store(&self, h_thread: crate::windows::HANDLE)
        -> crate::error::Result<()> {
        use crate::windows::{SetThreadContext, Wow64SetThreadContext};

        let ok = match self {
            Self::Native(c) => unsafe { SetThreadContext(h_thread, c) },
            Self::Wow64(c) => unsafe { Wow64SetThreadContext(h_thread, c) },
        };
        if !ok {
            return Err(crate::error::Error::last_os_error("SetThreadContext"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_win32() {
        assert_eq!(std::mem::size_of::<CONTEXT>(), 0x4d0);
        assert_eq!(std::mem::align_of::<CONTEXT>(), 16);
        assert_eq!(std::mem::size_of::<WOW64_CONTEXT>(), 0x2cc);
    }

    #[test]
    fn register_args_follow_x64_order() {
        let ctx = Context::Native(CONTEXT {
            Rcx: 1, Rdx: 2, R8: 3, R9: 4, ..Default::default()
        });
        let regs: Vec<_> = (0..5).map(|i| ctx.register_arg(i)).collect();
        assert_eq!(regs, [Some(1), Some(2), Some(3), Some(4), None]);
        assert_eq!(Context::new(true).register_arg(0), None);
    }

    #[test]
    fn trap_flag_toggles_only_bit_8() {
        let mut ctx = Context::Wow64(WOW64_CONTEXT {
            EFlags: 0x202, ..Default::default()
        });
        ctx.set_trap_flag(true);
        let Context::Wow64(ref c) = ctx else { unreachable!() };
        assert_eq!(c.EFlags, 0x302);
        ctx.set_trap_flag(false);
        let Context::Wow64(ref c) = ctx else { unreachable!() };
        assert_eq!(c.EFlags, 0x202);
    }
}
