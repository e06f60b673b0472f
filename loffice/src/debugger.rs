//! Implementation of the `Debugger` struct which spawns a process under
//! debug, runs its debug loop and gives the tracer core access to it
//! through `Debuggee`.

use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};
use widestring::U16CString;

use crate::breakpoints::Hook;
use crate::context::Context;
use crate::dbg_callbacks::DbgCallbacks;
use crate::error::{Error, Result};
use crate::pe;
use crate::target::{Bitness, Debuggee};
use crate::windows::{self, ContinueStatus, DebugEvent, Handle, HANDLE};
use crate::windows::{ContinueDebugEvent, CreateProcessW, FlushInstructionCache,
    GetMappedFileNameW, IsWow64Process, ReadProcessMemory, TerminateProcess,
    WaitForDebugEvent, WriteProcessMemory};

/// The number of milliseconds to wait for a debugging event before looking
/// at the interrupt flag again.
const DEBUGGER_TIMEOUT: u32 = 1000;

const PAGE_SIZE: u64 = 0x1000;

const INT3: u8 = 0xcc;

struct Breakpoint {
    /// The byte that was overwritten with 0xCC
    overwritten_byte: u8,
    hook: Hook,
}

enum PostEventAction {
    Continue(ContinueStatus),
    Stop(u32),
}

pub struct Debugger {
    process_handle: HANDLE,
    /// Handles returned by CreateProcessW. The ones delivered with debug
    /// events belong to the system.
    _owned: [Handle; 2],
    thread_handles: HashMap<u32, HANDLE>,
    /// Map module_start -> (module_name, module_end)
    modules: BTreeMap<u64, (String, u64)>,
    /// A context used as backing for SetThreadContext/GetThreadContext calls
    /// or their WOW64 equivalent.
    context: Context,
    bits: Bitness,
    /// Map: IP -> Breakpoint. Every breakpoint is permanent.
    breakpoints: HashMap<u64, Breakpoint>,
    /// Threads single stepping over a restored instruction, and the address
    /// where 0xCC goes back once the step is done.
    rearm: HashMap<u32, u64>,
    interrupt: Option<Arc<AtomicBool>>,
    interrupt_delivered: bool,
    terminated: bool,
}

impl Debugger {
    /// Spawn a new process under the debugger.
    /// NOTE `cmdline` includes the program path
    /// e.g cmdline = ["program_path", "arg1", "arg2"]
    pub fn spawn(cmdline: &[String]) -> Result<Self> {
        let joined = cmdline.iter()
            .map(|arg| if arg.contains(' ') && !arg.starts_with('"') {
                format!("\"{arg}\"")
            } else {
                arg.clone()
            })
            .collect::<Vec<_>>()
            .join(" ");
        let mut wide_cmdline = U16CString::from_str(&joined)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .into_vec_with_nul();

        let mut startup_info = windows::STARTUPINFOW::new();
        let mut proc_info = windows::PROCESS_INFORMATION::default();

        let created = unsafe {
            CreateProcessW(std::ptr::null(),
                wide_cmdline.as_mut_ptr(),
                std::ptr::null_mut(), // lpProcessAttributes
                std::ptr::null_mut(), // lpThreadAttributes
                false, // bInheritHandles
                windows::DEBUG_ONLY_THIS_PROCESS, // dwCreationFlags
                std::ptr::null_mut(), // lpEnvironment
                std::ptr::null(), // lpCurrentDirectory
                &mut startup_info,
                &mut proc_info)
        };
        if !created {
            return Err(Error::last_os_error("CreateProcessW"));
        }
        let owned = [Handle(proc_info.hProcess), Handle(proc_info.hThread)];

        let mut is_wow64 = false;
        if !unsafe { IsWow64Process(proc_info.hProcess, &mut is_wow64) } {
            return Err(Error::last_os_error("IsWow64Process"));
        }
        debug!(pid = proc_info.dwProcessId, is_wow64, "spawned {joined}");

        let mut thread_handles = HashMap::new();
        thread_handles.insert(proc_info.dwThreadId, proc_info.hThread);

        Ok(Self {
            process_handle: proc_info.hProcess,
            _owned: owned,
            thread_handles,
            modules: BTreeMap::new(),
            context: Context::new(is_wow64),
            bits: if is_wow64 { Bitness::X86 } else { Bitness::X64 },
            breakpoints: HashMap::new(),
            rearm: HashMap::new(),
            interrupt: None,
            interrupt_delivered: false,
            terminated: false,
        })
    }

    /// Once `flag` is raised, `DbgCallbacks::interrupt_cb` is called from
    /// the debug loop. The flag is checked at least every `DEBUGGER_TIMEOUT`.
    pub fn set_interrupt_flag(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    fn handle_event(&mut self, debug_event: &DebugEvent,
                    hit_initial_bp: &mut bool,
                    cbs: &mut impl DbgCallbacks) -> Result<PostEventAction> {
        use ContinueStatus::{DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED};

        trace!("{} event", debug_event.name());

        match debug_event {
            DebugEvent::Unused => {
                warn!("invalid debug event received");
            }
            DebugEvent::Exception { pid, tid, exception_record, first_chance } => {
                let addr = exception_record.ExceptionAddress as u64;

                match exception_record.ExceptionCode as u32 {
                    code @ (windows::EXCEPTION_BREAKPOINT
                            | windows::STATUS_WX86_BREAKPOINT) => {
                        if !*hit_initial_bp {
                            // A WOW64 process first reports the native
                            // loader breakpoint, then the 32-bit one
                            if !self.context.is_wow64()
                                    || code == windows::STATUS_WX86_BREAKPOINT {
                                *hit_initial_bp = true;
                            }
                            return Ok(PostEventAction::Continue(DBG_CONTINUE));
                        }

                        let Some((byte, hook)) = self.breakpoints.get(&addr)
                                .map(|bp| (bp.overwritten_byte, bp.hook)) else {
                            debug!("breakpoint at {} is not ours",
                                   self.describe(addr));
                            return Ok(PostEventAction::Continue(
                                DBG_EXCEPTION_NOT_HANDLED));
                        };
                        self.hit_breakpoint(*pid, *tid, addr, byte, hook, cbs)?;
                    }
                    windows::EXCEPTION_SINGLE_STEP
                    | windows::STATUS_WX86_SINGLE_STEP => {
                        let Some(bp_addr) = self.rearm.remove(tid) else {
                            return Ok(PostEventAction::Continue(
                                DBG_EXCEPTION_NOT_HANDLED));
                        };
                        self.rearm_breakpoint(bp_addr);
                    }
                    code => {
                        trace!("exception {code:#x} at {} (first chance: {})",
                               self.describe(addr), *first_chance != 0);
                        return Ok(PostEventAction::Continue(
                            DBG_EXCEPTION_NOT_HANDLED));
                    }
                }
            }
            DebugEvent::CreateThread { tid, h_thread, .. } => {
                self.thread_handles.insert(*tid, *h_thread);
            }
            DebugEvent::CreateProcess { pid, tid, h_file, h_thread, image_base,
                .. } => {
                close_file_handle(*h_file);
                self.thread_handles.insert(*tid, *h_thread);
                let base = *image_base as u64;
                let image_name = self.register_module(base);
                cbs.create_process_cb(self, *pid, *tid, &image_name, base);
            }
            DebugEvent::ExitThread { tid, .. } => {
                self.thread_handles.remove(tid);
                self.rearm.remove(tid);
            }
            DebugEvent::ExitProcess { pid, tid, exit_code } => {
                cbs.exit_process_cb(self, *pid, *tid, *exit_code);
                return Ok(PostEventAction::Stop(*exit_code));
            }
            DebugEvent::LoadDll { pid, tid, h_file, base_of_dll, .. } => {
                close_file_handle(*h_file);
                let base = *base_of_dll as u64;
                let image_name = self.register_module(base);
                cbs.dll_load_cb(self, *pid, *tid, &image_name, base);
            }
            DebugEvent::UnloadDll { base_of_dll, .. } => {
                self.unregister_module(*base_of_dll as u64);
            }
            DebugEvent::DebugString { pid, tid, debug_string_data, funicode,
                debug_string_length } => {
                // Unicode strings are not reported by the system anyway
                if *funicode == 0 {
                    let mut buf = vec![0u8; *debug_string_length as usize];
                    if let Ok(n) = self.read_mem(*debug_string_data as u64,
                                                 &mut buf) {
                        let end = buf[..n].iter().position(|&b| b == 0)
                            .unwrap_or(n);
                        debug!("{pid}:{tid} {}",
                               String::from_utf8_lossy(&buf[..end]));
                    }
                }
            }
            DebugEvent::RipInfo { error, typ, .. } => {
                warn!("RIP event (error {error:#x}, type {typ})");
            }
        }
        Ok(PostEventAction::Continue(DBG_CONTINUE))
    }

    /// Main debugging loop. We wait for debug events and handle them.
    /// Returns the process' exit code
    pub fn run(&mut self, cbs: &mut impl DbgCallbacks) -> Result<u32> {
        let mut debug_event = DebugEvent::Unused;
        let mut hit_initial_bp = false;

        loop {
            self.poll_interrupt(cbs);

            if !unsafe { WaitForDebugEvent(&mut debug_event, DEBUGGER_TIMEOUT) } {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(windows::ERROR_SEM_TIMEOUT) {
                    continue;
                }
                return Err(Error::Os { call: "WaitForDebugEvent", source: err });
            }

            let action = self.handle_event(&debug_event, &mut hit_initial_bp,
                                           cbs)?;
            let status = match action {
                PostEventAction::Continue(status) => status,
                PostEventAction::Stop(_) => ContinueStatus::DBG_CONTINUE,
            };

            let (pid, tid) = debug_event.pid_tid();
            if !unsafe { ContinueDebugEvent(pid, tid, status) } {
                return Err(Error::last_os_error("ContinueDebugEvent"));
            }

            if let PostEventAction::Stop(exit_code) = action {
                return Ok(exit_code);
            }
        }
    }

    fn poll_interrupt(&mut self, cbs: &mut impl DbgCallbacks) {
        if self.interrupt_delivered {
            return;
        }
        let raised = self.interrupt.as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst));
        if raised {
            self.interrupt_delivered = true;
            cbs.interrupt_cb(self);
        }
    }

    /// Restores the original instruction, reports the hit with the thread
    /// parked on it, then single steps the thread so the 0xCC can go back.
    fn hit_breakpoint(&mut self, pid: u32, tid: u32, addr: u64,
                      overwritten_byte: u8, hook: Hook,
                      cbs: &mut impl DbgCallbacks) -> Result<()> {
        self.write_code(addr, overwritten_byte)?;

        let h_thread = self.thread(tid)?;
        self.context.load(h_thread)?;
        self.context.set_ip(addr);
        self.context.store(h_thread)?;

        let ctx = self.context.clone();
        cbs.breakpoint_cb(self, pid, tid, hook, &ctx);

        if self.terminated {
            return Ok(());
        }
        self.context.load(h_thread)?;
        self.context.set_trap_flag(true);
        self.context.store(h_thread)?;
        self.rearm.insert(tid, addr);
        Ok(())
    }

    fn rearm_breakpoint(&mut self, addr: u64) {
        if self.terminated || !self.breakpoints.contains_key(&addr) {
            return;
        }
        if let Err(e) = self.write_code(addr, INT3) {
            warn!("cannot re-arm breakpoint at {}: {e}", self.describe(addr));
        }
    }

    fn thread(&self, tid: u32) -> Result<HANDLE> {
        self.thread_handles.get(&tid).copied().ok_or_else(|| Error::Os {
            call: "OpenThread",
            source: io::Error::new(io::ErrorKind::NotFound,
                                   format!("no handle for thread {tid}")),
        })
    }

    /// Writes one byte of code and flushes the instruction cache.
    fn write_code(&mut self, addr: u64, byte: u8) -> Result<()> {
        if self.write_mem(addr, &[byte])? != 1 {
            return Err(Error::MemoryWrite { addr });
        }
        if !unsafe { FlushInstructionCache(self.process_handle,
                                           std::ptr::null(), 0) } {
            return Err(Error::last_os_error("FlushInstructionCache"));
        }
        Ok(())
    }

    /// Records the module mapped at `base` and returns its file name.
    fn register_module(&mut self, base: u64) -> String {
        let name = self.module_name(base).unwrap_or_else(|e| {
            warn!("cannot name module at {base:#x}: {e}");
            String::new()
        });
        let size = pe::image_size(&*self, base).unwrap_or_else(|e| {
            debug!("no SizeOfImage for {name}: {e}");
            1
        });
        self.modules.insert(base, (name.clone(),
                                   base + size.max(1) as u64 - 1));
        name
    }

    /// Forgets the module at `base` together with its breakpoints, whose
    /// addresses may be reused by the next mapping.
    fn unregister_module(&mut self, base: u64) {
        if let Some((name, end)) = self.modules.remove(&base) {
            self.breakpoints.retain(|addr, _| !(base..=end).contains(addr));
            debug!("unloaded {name}");
        }
    }

    fn module_name(&self, base: u64) -> Result<String> {
        let mut buf = [0u16; 4096];
        let len = unsafe {
            GetMappedFileNameW(self.process_handle, base as *const c_void,
                               buf.as_mut_ptr(), buf.len() as u32)
        };
        if len == 0 {
            return Err(Error::last_os_error("GetMappedFileNameW"));
        }

        let path = String::from_utf16_lossy(&buf[..len as usize]);
        Ok(match path.rsplit_once('\\') {
            Some((_, file)) => file.to_string(),
            None => path,
        })
    }

    /// `module+offset` when `addr` falls inside a known module.
    fn describe(&self, addr: u64) -> String {
        match self.modules.range(..=addr).next_back() {
            Some((base, (name, end))) if addr <= *end => {
                format!("{name}+{:#x}", addr - base)
            }
            _ => format!("{addr:#x}"),
        }
    }
}

fn close_file_handle(h_file: HANDLE) {
    if h_file != 0 {
        drop(Handle(h_file));
    }
}

impl Debuggee for Debugger {
    fn bits(&self) -> Bitness {
        self.bits
    }

    /// Reads page by page so that a string running into an unmapped page
    /// still yields its readable part.
    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let at = addr + done as u64;
            let chunk = ((PAGE_SIZE - at % PAGE_SIZE) as usize)
                .min(buf.len() - done);
            let mut read = 0;
            let ok = unsafe {
                ReadProcessMemory(self.process_handle, at as *const u8,
                                  buf[done..].as_mut_ptr(), chunk, &mut read)
            };
            if !ok || read == 0 {
                break;
            }
            done += read;
        }

        if done == 0 && !buf.is_empty() {
            return Err(Error::MemoryRead { addr });
        }
        Ok(done)
    }

    fn write_mem(&mut self, addr: u64, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        let ok = unsafe {
            WriteProcessMemory(self.process_handle, addr as *mut u8,
                               buf.as_ptr(), buf.len(), &mut written)
        };
        if !ok {
            debug!("WriteProcessMemory: {}", io::Error::last_os_error());
            return Err(Error::MemoryWrite { addr });
        }
        Ok(written)
    }

    fn break_at(&mut self, addr: u64, hook: Hook) -> Result<()> {
        if let Some(bp) = self.breakpoints.get_mut(&addr) {
            bp.hook = hook;
            return Ok(());
        }

        let mut overwritten_byte = [0u8];
        self.read_mem(addr, &mut overwritten_byte)?;
        self.write_code(addr, INT3)?;
        self.breakpoints.insert(addr, Breakpoint {
            overwritten_byte: overwritten_byte[0],
            hook,
        });
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        if !unsafe { TerminateProcess(self.process_handle, 1) } {
            return Err(Error::last_os_error("TerminateProcess"));
        }
        self.terminated = true;
        Ok(())
    }
}
