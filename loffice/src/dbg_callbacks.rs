//! Trait that can be implemented to get callbacks when the debug loop
//! reaches the events the tracer cares about

use crate::breakpoints::Hook;
use crate::context::Context;
use crate::debugger::Debugger;

pub trait DbgCallbacks {
    fn create_process_cb(&mut self, _dbg: &mut Debugger, _pid: u32, _tid: u32,
                         _image_name: &str, _image_base: u64) {}

    fn exit_process_cb(&mut self, _dbg: &mut Debugger, _pid: u32, _tid: u32,
                       _exit_code: u32) {}

    fn dll_load_cb(&mut self, _dbg: &mut Debugger, _pid: u32, _tid: u32,
                   _image_name: &str, _base_of_dll: u64) {}

    /// A breakpoint placed with `Debuggee::break_at` was reached. `ctx` is
    /// the thread's context with the instruction pointer on the breakpoint.
    fn breakpoint_cb(&mut self, _dbg: &mut Debugger, _pid: u32, _tid: u32,
                     _hook: Hook, _ctx: &Context) {}

    /// The interrupt flag was raised. Delivered once.
    fn interrupt_cb(&mut self, _dbg: &mut Debugger) {}
}
