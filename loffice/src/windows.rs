//! Raw bindings to the Win32 debugging API used by `Debugger`.
//! The naming convention is that UPPERCASE types are raw C types while
//! CamelCase types are rust wrappers.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use core::ffi::c_void;

use crate::context::{CONTEXT, WOW64_CONTEXT};

pub type HANDLE     = usize;
pub type LPWSTR     = *mut u16;
pub type NTSTATUS   = i32;

pub const DEBUG_ONLY_THIS_PROCESS: u32 = 0x0000_0002;
pub const ERROR_SEM_TIMEOUT: i32 = 121;

/// Breakpoint / STATUS_WX86_BREAKPOINT
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
pub const STATUS_WX86_BREAKPOINT: u32 = 0x4000_001f;
/// Single step / STATUS_WX86_SINGLE_STEP
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
pub const STATUS_WX86_SINGLE_STEP: u32 = 0x4000_001e;

/// `Handle` owns a HANDLE and closes it when dropped.
#[derive(Debug)]
pub struct Handle(pub HANDLE);

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0); }
    }
}

/// Pointer fields are declared as `usize` so the struct can derive Default;
/// they are always null here.
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
pub struct STARTUPINFOW {
    pub cb: u32,
    lpReserved: usize,
    lpDesktop: usize,
    lpTitle: usize,
    dwX: u32,
    dwY: u32,
    dwXSize: u32,
    dwYSize: u32,
    dwXCountChars: u32,
    dwYCountChars: u32,
    dwFillAttribute: u32,
    dwFlags: u32,
    wShowWindow: u16,
    cbReserved2: u16,
    lpReserved2: usize,
    hStdInput: HANDLE,
    hStdOutput: HANDLE,
    hStdError: HANDLE,
}

impl STARTUPINFOW {
    pub fn new() -> Self {
        Self {
            cb: std::mem::size_of::<Self>() as u32,
            ..Default::default()
        }
    }
}

#[repr(C)]
#[derive(Default)]
pub struct PROCESS_INFORMATION {
    pub hProcess    : HANDLE,
    pub hThread     : HANDLE,
    pub dwProcessId : u32,
    pub dwThreadId  : u32,
}

#[repr(C)]
pub struct EXCEPTION_RECORD {
    pub ExceptionCode: NTSTATUS,
    pub ExceptionFlags: u32,
    pub ExceptionRecord: *mut EXCEPTION_RECORD,
    pub ExceptionAddress: *mut c_void,
    pub NumberParameters: u32,
    pub ExceptionInformation: [usize; 15],
}

/// Mirrors DEBUG_EVENT: the `u32` discriminant lands on `dwDebugEventCode`
/// and every variant starts with the process and thread ids, so the union
/// member lines up with the payload fields of the variant.
#[repr(u32)]
pub enum DebugEvent {
    /// dwDebugEventCode is 1-indexed
    Unused,
    Exception {
        pid: u32,
        tid: u32,
        exception_record: EXCEPTION_RECORD,
        first_chance: u32,
    },
    CreateThread {
        pid: u32,
        tid: u32,
        h_thread: HANDLE,
        _tls_base: *mut c_void,
        _start_address: *mut c_void,
    },
    CreateProcess {
        pid: u32,
        tid: u32,
        h_file: HANDLE,
        h_process: HANDLE,
        h_thread: HANDLE,
        image_base: *mut c_void,
        _debug_info_file_offset: u32,
        _debug_info_size: u32,
        _tls_base: *mut c_void,
        _start_address: *mut c_void,
        _image_name: *mut c_void,
        _funicode: u16,
    },
    ExitThread {
        pid: u32,
        tid: u32,
        exit_code: u32,
    },
    ExitProcess {
        pid: u32,
        tid: u32,
        exit_code: u32,
    },
    LoadDll {
        pid: u32,
        tid: u32,
        h_file: HANDLE,
        base_of_dll: *mut c_void,
        _debug_info_file_offset: u32,
        _debug_info_size: u32,
        _image_name: *mut c_void,
        _funicode: u16,
    },
    UnloadDll {
        pid: u32,
        tid: u32,
        base_of_dll: *mut c_void,
    },
    DebugString {
        pid: u32,
        tid: u32,
        debug_string_data: *mut u8,
        funicode: u16,
        debug_string_length: u16,
    },
    RipInfo {
        pid: u32,
        tid: u32,
        error: u32,
        typ: u32,
    },
}

impl DebugEvent {
    pub fn pid_tid(&self) -> (u32, u32) {
        match self {
            DebugEvent::Unused => (0, 0),
            DebugEvent::Exception { pid, tid, .. }
            | DebugEvent::CreateThread { pid, tid, .. }
            | DebugEvent::CreateProcess { pid, tid, .. }
            | DebugEvent::ExitThread { pid, tid, .. }
            | DebugEvent::ExitProcess { pid, tid, .. }
            | DebugEvent::LoadDll { pid, tid, .. }
            | DebugEvent::UnloadDll { pid, tid, .. }
            | DebugEvent::DebugString { pid, tid, .. }
            | DebugEvent::RipInfo { pid, tid, .. } => (*pid, *tid),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DebugEvent::Unused => "Unused",
            DebugEvent::Exception { .. } => "Exception",
            DebugEvent::CreateThread { .. } => "CreateThread",
            DebugEvent::CreateProcess { .. } => "CreateProcess",
            DebugEvent::ExitThread { .. } => "ExitThread",
            DebugEvent::ExitProcess { .. } => "ExitProcess",
            DebugEvent::LoadDll { .. } => "LoadDll",
            DebugEvent::UnloadDll { .. } => "UnloadDll",
            DebugEvent::DebugString { .. } => "DebugString",
            DebugEvent::RipInfo { .. } => "RipInfo",
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum ContinueStatus {
    DBG_CONTINUE              = 0x00010002,
    DBG_EXCEPTION_NOT_HANDLED = 0x80010001,
}

#[link(name="kernel32")]
extern "system" {
    pub fn CreateProcessW(
        lpApplicationName    : *const u16,
        lpCommandLine        : LPWSTR,
        lpProcessAttributes  : *mut c_void,
        lpThreadAttributes   : *mut c_void,
        bInheritHandles      : bool,
        dwCreationFlags      : u32,
        lpEnvironment        : *mut c_void,
        lpCurrentDirectory   : *const u16,
        lpStartupInfo        : *mut STARTUPINFOW,
        lpProcessInformation : *mut PROCESS_INFORMATION) -> bool;

    pub fn CloseHandle(hObject: HANDLE) -> bool;

    pub fn TerminateProcess(hProcess: HANDLE, uExitCode: u32) -> bool;

    pub fn WaitForDebugEvent(
        lpDebugEvent    : *mut DebugEvent,
        dwMilliseconds  : u32) -> bool;

    pub fn ContinueDebugEvent(
        dwProcessId     : u32,
        dwThreadId      : u32,
        dwContinueStatus: ContinueStatus) -> bool;

    pub fn IsWow64Process(
        hProcess    : HANDLE,
        Wow64Process: *mut bool) -> bool;

    pub fn ReadProcessMemory(
        hProcess            : HANDLE,
        lpBaseAddress       : *const u8,
        lpBuffer            : *mut u8,
        nSize               : usize,
        lpNumberOfBytesRead : *mut usize) -> bool;

    pub fn WriteProcessMemory(
        hProcess                : HANDLE,
        lpBaseAddress           : *mut u8,
        lpBuffer                : *const u8,
        nSize                   : usize,
        lpNumberOfBytesWritten  : *mut usize) -> bool;

    pub fn FlushInstructionCache(
        hProcess        : HANDLE,
        lpBaseAddress   : *const c_void,
        dwSize          : usize) -> bool;

    pub fn GetThreadContext(
        hThread: HANDLE,
        lpContext: *mut CONTEXT) -> bool;

    pub fn SetThreadContext(
        hThread: HANDLE,
        lpContext: *const CONTEXT) -> bool;

    pub fn Wow64GetThreadContext(
        hThread: HANDLE,
        lpContext: *mut WOW64_CONTEXT) -> bool;

    pub fn Wow64SetThreadContext(
        hThread: HANDLE,
        lpContext: *const WOW64_CONTEXT) -> bool;
}

#[link(name="psapi")]
extern "system" {
    pub fn GetMappedFileNameW(
        hProcess    : HANDLE,
        lpv         : *const c_void,
        lpFilename  : LPWSTR,
        nSize       : u32) -> u32;
}
