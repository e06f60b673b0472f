//! Interpretation of a breakpoint hit: typed arguments in, one semantic
//! event out.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::args::{wide_string_or_empty, ArgLayout};
use crate::breakpoints::Hook;
use crate::context::Context;
use crate::error::Result;
use crate::patch;
use crate::results::{AccessMode, ProcessCreation, WmiQuery};
use crate::target::Debuggee;

pub const GENERIC_READ: u64 = 0x8000_0000;
pub const GENERIC_WRITE: u64 = 0x4000_0000;

/// Image name of the print-spooler helper Office starts on its own.
pub const SPOOLER_HELPER: &str = "splwow64";

const WMI_PROCESS_CLASS: &str = "win32_process";
const WMI_CREATE_METHOD: &str = "create";

// Callee parameter positions. `this` and `hToken` come first on the WMI
// stubs and CreateProcessInternalW, so their interesting arguments start at 1.
const CRACK_URL: ArgLayout<1> = ArgLayout::uniform([0]);
const CREATE_FILE: ArgLayout<2> = ArgLayout::uniform([0, 1]);
const CREATE_PROCESS: ArgLayout<2> = ArgLayout::uniform([1, 2]);
const WMI_EXEC_QUERY: ArgLayout<2> = ArgLayout::uniform([1, 2]);
const WMI_EXEC_METHOD: ArgLayout<2> = ArgLayout::uniform([1, 2]);
const VBA_STRCMP: ArgLayout<2> = ArgLayout { x86: [0, 1], x64: [1, 2] };

/// Raw arguments of one intercepted call, before any memory is dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptedCall {
    CrackUrl { url: u64 },
    CreateFile { file_name: u64, desired_access: u64 },
    CreateProcess { application: u64, command_line: u64 },
    WmiExecQuery { language: u64, query: u64 },
    WmiExecMethod { object: u64, method: u64 },
    VbaStrCmp { needle: u64, haystack: u64 },
}

impl InterceptedCall {
    /// Pulls the arguments `hook` cares about out of the stopped thread.
    pub fn read<D: Debuggee + ?Sized>(hook: Hook, dbg: &D, ctx: &Context)
        -> Result<Self> {
        Ok(match hook {
            Hook::CrackUrl => {
                let [url] = CRACK_URL.read(dbg, ctx)?;
                Self::CrackUrl { url }
            }
            Hook::CreateFile => {
                let [file_name, desired_access] = CREATE_FILE.read(dbg, ctx)?;
                Self::CreateFile {
                    file_name,
                    // DWORD; the upper half of the register is garbage
                    desired_access: desired_access & 0xffff_ffff,
                }
            }
            Hook::CreateProcess => {
                let [application, command_line] =
                    CREATE_PROCESS.read(dbg, ctx)?;
                Self::CreateProcess { application, command_line }
            }
            Hook::WmiExecQuery => {
                let [language, query] = WMI_EXEC_QUERY.read(dbg, ctx)?;
                Self::WmiExecQuery { language, query }
            }
            Hook::WmiExecMethod => {
                let [object, method] = WMI_EXEC_METHOD.read(dbg, ctx)?;
                Self::WmiExecMethod { object, method }
            }
            Hook::VbaStrCmp => {
                let [needle, haystack] = VBA_STRCMP.read(dbg, ctx)?;
                Self::VbaStrCmp { needle, haystack }
            }
        })
    }
}

/// What one interception meant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Url(String),
    FileOpen { path: String, access: BTreeSet<AccessMode> },
    ProcessCreate(ProcessCreation),
    WmiQuery(WmiQuery),
    WmiMethod { object: String, method: String },
    StringCompare { needle: String, haystack: String },
}

/// Input to the exit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    UrlFound(String),
    ProcessCreated {
        app: String,
        /// The spooler helper, which Office spawns without any macro.
        exempt: bool,
    },
}

impl Event {
    pub fn signal(&self) -> Option<Signal> {
        match self {
            Self::Url(url) => Some(Signal::UrlFound(url.clone())),
            Self::ProcessCreate(proc) => Some(Signal::ProcessCreated {
                app: proc.app.clone(),
                exempt: is_spooler_helper(&proc.app),
            }),
            Self::WmiMethod { object, method } if is_wmi_process_create(object,
                                                                        method) => {
                Some(Signal::ProcessCreated {
                    app: format!("{object}.{method}"),
                    exempt: false,
                })
            }
            _ => None,
        }
    }
}

pub fn is_spooler_helper(app: &str) -> bool {
    app.to_lowercase().contains(SPOOLER_HELPER)
}

pub fn is_wmi_process_create(object: &str, method: &str) -> bool {
    object.eq_ignore_ascii_case(WMI_PROCESS_CLASS)
        && method.eq_ignore_ascii_case(WMI_CREATE_METHOD)
}

/// Access tags for a `dwDesiredAccess` mask. Empty when neither generic bit
/// is set.
pub fn access_modes(desired_access: u64) -> BTreeSet<AccessMode> {
    let mut modes = BTreeSet::new();
    if desired_access & GENERIC_READ != 0 {
        modes.insert(AccessMode::Read);
    }
    if desired_access & GENERIC_WRITE != 0 {
        modes.insert(AccessMode::Write);
    }
    modes
}

/// Named pipes and `\\.\WMIDataDevice` style device paths.
pub fn is_unc_path(path: &str) -> bool {
    path.starts_with(r"\\")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter {
    /// Log write opens only; reads are still recorded.
    pub writes_only: bool,
}

impl Interpreter {
    pub fn new(writes_only: bool) -> Self {
        Self { writes_only }
    }

    /// Reads the call `hook` intercepted and turns it into an event.
    /// `None` means the call is excluded from the results altogether.
    pub fn interpret<D: Debuggee + ?Sized>(&self, hook: Hook, dbg: &mut D,
                                           ctx: &Context)
        -> Result<Option<Event>> {
        let call = InterceptedCall::read(hook, &*dbg, ctx)?;
        debug!(?call, "{hook:?} hit");
        self.interpret_call(call, dbg)
    }

    pub fn interpret_call<D: Debuggee + ?Sized>(&self, call: InterceptedCall,
                                                dbg: &mut D)
        -> Result<Option<Event>> {
        match call {
            InterceptedCall::CrackUrl { url } => Ok(Some(crack_url(&*dbg, url))),
            InterceptedCall::CreateFile { file_name, desired_access } => {
                Ok(self.create_file(&*dbg, file_name, desired_access))
            }
            InterceptedCall::CreateProcess { application, command_line } => {
                Ok(Some(create_process(&*dbg, application, command_line)))
            }
            InterceptedCall::WmiExecQuery { language, query } => {
                wmi_exec_query(dbg, language, query).map(Some)
            }
            InterceptedCall::WmiExecMethod { object, method } => {
                Ok(Some(wmi_exec_method(&*dbg, object, method)))
            }
            InterceptedCall::VbaStrCmp { needle, haystack } => {
                Ok(Some(vba_strcmp(&*dbg, needle, haystack)))
            }
        }
    }

    fn create_file<D: Debuggee + ?Sized>(&self, dbg: &D, file_name: u64,
                                         desired_access: u64) -> Option<Event> {
        let access = access_modes(desired_access);
        if access.is_empty() {
            return None;
        }
        let path = wide_string_or_empty(dbg, file_name, "lpFileName");
        if is_unc_path(&path) {
            debug!("ignoring device open {path}");
            return None;
        }

        let is_write = access.contains(&AccessMode::Write);
        if is_write || !self.writes_only {
            let tags: String = access.iter().map(|m| m.tag()).collect();
            info!("Opened file handle (access: {tags}):{path}");
        }
        Some(Event::FileOpen { path, access })
    }
}

fn crack_url<D: Debuggee + ?Sized>(dbg: &D, url: u64) -> Event {
    let url = wide_string_or_empty(dbg, url, "lpszUrl");
    info!("FOUND URL: {url}");
    Event::Url(url)
}

fn create_process<D: Debuggee + ?Sized>(dbg: &D, application: u64,
                                        command_line: u64) -> Event {
    let app = wide_string_or_empty(dbg, application, "lpApplicationName");
    let cmdline = wide_string_or_empty(dbg, command_line, "lpCommandLine");
    info!("CREATE PROCESS");
    info!("App: \"{app}\" Command line: \"{cmdline}\"");
    Event::ProcessCreate(ProcessCreation { app, cmdline })
}

fn wmi_exec_query<D: Debuggee + ?Sized>(dbg: &mut D, language: u64,
                                        query_ptr: u64) -> Result<Event> {
    info!("DETECTED WMI QUERY");
    let language = wide_string_or_empty(&*dbg, language, "strQueryLanguage");
    let query = wide_string_or_empty(&*dbg, query_ptr, "strQuery");
    info!("Language: {language}");
    info!("Query: {query}");

    let patched = patch::neutralize(dbg, query_ptr, &query)?;
    Ok(Event::WmiQuery(WmiQuery { query, patched }))
}

fn wmi_exec_method<D: Debuggee + ?Sized>(dbg: &D, object: u64, method: u64)
    -> Event {
    let object = wide_string_or_empty(dbg, object, "strObjectPath");
    let method = wide_string_or_empty(dbg, method, "strMethodName");
    if is_wmi_process_create(&object, &method) {
        info!("Process creation via WMI detected");
    } else {
        info!("WMI method {object}.{method}");
    }
    Event::WmiMethod { object, method }
}

fn vba_strcmp<D: Debuggee + ?Sized>(dbg: &D, needle: u64, haystack: u64)
    -> Event {
    let needle = wide_string_or_empty(dbg, needle, "needle");
    let haystack = wide_string_or_empty(dbg, haystack, "haystack");
    info!("COMPARE:\n\tstr1: \"{needle}\"\n\tstr2: \"{haystack}\"");
    Event::StringCompare { needle, haystack }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CONTEXT, WOW64_CONTEXT};
    use crate::target::Bitness;
    use crate::testing::FakeDebuggee;

    const ESP: u64 = 0x0010_0000;

    /// A 32-bit thread stopped at function entry with `args` on the stack.
    fn x86_call(args: &[u32]) -> (FakeDebuggee, Context) {
        let mut dbg = FakeDebuggee::new(Bitness::X86);
        let mut stack = vec![0x7700_1234];
        stack.extend_from_slice(args);
        dbg.map_words32(ESP, &stack);
        let ctx = Context::Wow64(WOW64_CONTEXT {
            Esp: ESP as u32, ..Default::default()
        });
        (dbg, ctx)
    }

    fn x64_call(rcx: u64, rdx: u64, r8: u64) -> (FakeDebuggee, Context) {
        let dbg = FakeDebuggee::new(Bitness::X64);
        let ctx = Context::Native(CONTEXT {
            Rcx: rcx, Rdx: rdx, R8: r8, Rsp: 0x1000, ..Default::default()
        });
        (dbg, ctx)
    }

    #[test]
    fn x86_positions_for_every_hook() {
        let (dbg, ctx) = x86_call(&[0xa0, 0xa1, 0xa2, 0xa3]);
        let read = |hook| InterceptedCall::read(hook, &dbg, &ctx).unwrap();

        assert_eq!(read(Hook::CrackUrl), InterceptedCall::CrackUrl { url: 0xa0 });
        assert_eq!(read(Hook::CreateFile), InterceptedCall::CreateFile {
            file_name: 0xa0, desired_access: 0xa1 });
        assert_eq!(read(Hook::CreateProcess), InterceptedCall::CreateProcess {
            application: 0xa1, command_line: 0xa2 });
        assert_eq!(read(Hook::WmiExecQuery), InterceptedCall::WmiExecQuery {
            language: 0xa1, query: 0xa2 });
        assert_eq!(read(Hook::WmiExecMethod), InterceptedCall::WmiExecMethod {
            object: 0xa1, method: 0xa2 });
        assert_eq!(read(Hook::VbaStrCmp), InterceptedCall::VbaStrCmp {
            needle: 0xa0, haystack: 0xa1 });
    }

    #[test]
    fn x64_positions_for_every_hook() {
        let (dbg, ctx) = x64_call(0xc0, 0xd0, 0x80);
        let read = |hook| InterceptedCall::read(hook, &dbg, &ctx).unwrap();

        assert_eq!(read(Hook::CrackUrl), InterceptedCall::CrackUrl { url: 0xc0 });
        assert_eq!(read(Hook::CreateFile), InterceptedCall::CreateFile {
            file_name: 0xc0, desired_access: 0xd0 });
        assert_eq!(read(Hook::CreateProcess), InterceptedCall::CreateProcess {
            application: 0xd0, command_line: 0x80 });
        assert_eq!(read(Hook::WmiExecQuery), InterceptedCall::WmiExecQuery {
            language: 0xd0, query: 0x80 });
        assert_eq!(read(Hook::WmiExecMethod), InterceptedCall::WmiExecMethod {
            object: 0xd0, method: 0x80 });
        assert_eq!(read(Hook::VbaStrCmp), InterceptedCall::VbaStrCmp {
            needle: 0xd0, haystack: 0x80 });
    }

    #[test]
    fn access_bits() {
        let modes = |mask| access_modes(mask).into_iter().collect::<Vec<_>>();
        assert_eq!(modes(GENERIC_READ), [AccessMode::Read]);
        assert_eq!(modes(GENERIC_WRITE), [AccessMode::Write]);
        assert_eq!(modes(GENERIC_READ | GENERIC_WRITE),
                   [AccessMode::Read, AccessMode::Write]);
        assert!(modes(0x0012_0089).is_empty());
    }

    #[test]
    fn create_file_skips_devices_and_zero_access() {
        let interp = Interpreter::default();
        let (mut dbg, _) = x64_call(0, 0, 0);
        dbg.map_wide(0x5000, r"\\.\pipe\lsass");
        dbg.map_wide(0x6000, r"C:\Temp\drop.exe");

        let call = |file_name, desired_access| InterceptedCall::CreateFile {
            file_name, desired_access };
        assert_eq!(interp.interpret_call(call(0x5000, GENERIC_READ), &mut dbg)
                       .unwrap(), None);
        assert_eq!(interp.interpret_call(call(0x6000, 0), &mut dbg).unwrap(),
                   None);
        assert_eq!(interp.interpret_call(call(0x6000, GENERIC_WRITE), &mut dbg)
                       .unwrap(),
                   Some(Event::FileOpen {
                       path: r"C:\Temp\drop.exe".into(),
                       access: [AccessMode::Write].into(),
                   }));
    }

    #[test]
    fn upper_register_bits_do_not_leak_into_access() {
        let (dbg, ctx) = x64_call(0x6000, 0xffff_ffff_4000_0000, 0);
        let call = InterceptedCall::read(Hook::CreateFile, &dbg, &ctx).unwrap();
        assert_eq!(call, InterceptedCall::CreateFile {
            file_name: 0x6000, desired_access: GENERIC_WRITE });
    }

    #[test]
    fn unreadable_strings_become_empty() {
        let (mut dbg, ctx) = x86_call(&[0, 0xdead_0000, 0]);
        let event = Interpreter::default()
            .interpret(Hook::CreateProcess, &mut dbg, &ctx)
            .unwrap();
        assert_eq!(event, Some(Event::ProcessCreate(ProcessCreation {
            app: String::new(),
            cmdline: String::new(),
        })));
    }

    #[test]
    fn wmi_query_is_patched_through_the_interpreter() {
        let (mut dbg, ctx) = x86_call(&[0x0bad_0000, 0x2000, 0x3000]);
        dbg.map_wide(0x2000, "WQL");
        dbg.map_wide(0x3000, "SELECT * FROM Win32_Process WHERE Name='x'");

        let event = Interpreter::default()
            .interpret(Hook::WmiExecQuery, &mut dbg, &ctx)
            .unwrap();
        assert_eq!(event, Some(Event::WmiQuery(WmiQuery {
            query: "SELECT * FROM Win32_Process WHERE Name='x'".into(),
            patched: Some("SELECT Name FROM Win32_Fan WHERE Name='1'".into()),
        })));
    }

    #[test]
    fn signals() {
        let proc = |app: &str| Event::ProcessCreate(ProcessCreation {
            app: app.into(), cmdline: String::new() });
        assert_eq!(proc(r"C:\Windows\splwow64.exe").signal(),
                   Some(Signal::ProcessCreated {
                       app: r"C:\Windows\splwow64.exe".into(), exempt: true }));
        assert!(matches!(proc("cmd.exe").signal(),
                         Some(Signal::ProcessCreated { exempt: false, .. })));
        assert_eq!(Event::Url("http://x/".into()).signal(),
                   Some(Signal::UrlFound("http://x/".into())));

        let method = |o: &str, m: &str| Event::WmiMethod {
            object: o.into(), method: m.into() };
        assert!(matches!(method("WIN32_PROCESS", "Create").signal(),
                         Some(Signal::ProcessCreated { exempt: false, .. })));
        assert_eq!(method("Win32_Process", "Terminate").signal(), None);
        assert_eq!(Event::StringCompare {
            needle: "a".into(), haystack: "b".into() }.signal(), None);
    }
}
