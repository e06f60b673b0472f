//! Glue between the Windows debug loop and a `Session`.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::info;

use crate::breakpoints::Hook;
use crate::context::Context;
use crate::dbg_callbacks::DbgCallbacks;
use crate::debugger::Debugger;
use crate::error::Result;
use crate::results::Stats;
use crate::session::{Report, Session, SessionConfig};

struct Tracer<F> {
    session: Session,
    /// Called after every breakpoint hit with the running counters.
    progress: F,
}

impl<F: FnMut(&Stats)> DbgCallbacks for Tracer<F> {
    fn create_process_cb(&mut self, dbg: &mut Debugger, pid: u32, _tid: u32,
                         image_name: &str, image_base: u64) {
        info!("Started {image_name} (pid {pid}) at {image_base:#x}");
        self.session.on_process_start(dbg);
    }

    fn exit_process_cb(&mut self, _dbg: &mut Debugger, _pid: u32, _tid: u32,
                       exit_code: u32) {
        self.session.on_exit(exit_code);
    }

    fn dll_load_cb(&mut self, dbg: &mut Debugger, _pid: u32, _tid: u32,
                   image_name: &str, base_of_dll: u64) {
        self.session.on_module_load(dbg, image_name, base_of_dll);
    }

    fn breakpoint_cb(&mut self, dbg: &mut Debugger, _pid: u32, _tid: u32,
                     hook: Hook, ctx: &Context) {
        self.session.on_breakpoint(dbg, hook, ctx);
        (self.progress)(self.session.stats());
    }

    fn interrupt_cb(&mut self, dbg: &mut Debugger) {
        self.session.interrupt(dbg);
    }
}

/// Starts `config.target` on `config.document` and traces it until it
/// exits. `interrupt` stops the session when raised.
///
/// Only a failed launch is an `Err`. Once the process runs, a broken debug
/// loop ends the session with `Outcome::InternalError` and the results
/// gathered up to that point are still reported.
pub fn trace(config: SessionConfig, interrupt: Arc<AtomicBool>,
             progress: impl FnMut(&Stats)) -> Result<Report> {
    let mut dbg = Debugger::spawn(&config.command_line())?;
    dbg.set_interrupt_flag(interrupt);

    let mut tracer = Tracer { session: Session::new(config), progress };
    if let Err(e) = dbg.run(&mut tracer) {
        tracer.session.abort(&mut dbg, &e);
    }
    Ok(tracer.session.into_report())
}
