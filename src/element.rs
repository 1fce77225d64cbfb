//! The element-facing contract.
//!
//! Elements are the processing units of the graph; their semantics live
//! outside this crate. The core consumes them through the [`Element`]
//! trait: lifecycle hooks (`configure`, `initialize`, `cleanup`), the
//! push/pull port operations, and the scheduling callbacks (`run_task`,
//! `run_timer`, `selected`).
//!
//! Any state an element keeps is its own responsibility: hooks take
//! `&self`, and an element reachable from more than one thread's tasks
//! must carry its own synchronization. The scheduler never protects
//! element-internal state.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::error::{ElementResult, ErrorSink};
use crate::master::Master;
use crate::packet::Packet;
use crate::port::{Port, PortKind, Ports};
use crate::router::Router;
use crate::select::SelectMask;
use crate::task::Task;
use crate::timer::Timer;

/// Teardown stage passed to [`Element::cleanup`], telling the element how
/// far its lifecycle got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStage {
    /// `configure` failed.
    ConfigureFailed,
    /// `configure` succeeded; `initialize` never ran.
    Configured,
    /// `initialize` failed.
    InitializeFailed,
    /// Fully initialized; unschedule tasks and timers, release
    /// descriptors.
    Initialized,
}

/// Capabilities handed to an element while its `initialize` hook runs.
pub struct InitContext<'a> {
    pub(crate) master: &'a Arc<Master>,
    pub(crate) router: &'a Arc<Router>,
    pub(crate) index: usize,
    pub(crate) ports: &'a Ports,
}

impl InitContext<'_> {
    pub fn master(&self) -> &Arc<Master> {
        self.master
    }

    pub fn router(&self) -> &Arc<Router> {
        self.router
    }

    /// The name this element was added to the graph under.
    pub fn element_name(&self) -> &str {
        self.router.element_name(self.index)
    }

    /// This element's own shared handle, for binding tasks and timers to
    /// itself.
    pub fn element(&self) -> Arc<dyn Element> {
        self.router.element_arc(self.index)
    }

    /// The element's resolved ports, to keep for the packet path.
    pub fn ports(&self) -> Ports {
        self.ports.clone()
    }

    pub fn input(&self, port: usize) -> Option<Port> {
        self.ports.input(port).cloned()
    }

    pub fn output(&self, port: usize) -> Option<Port> {
        self.ports.output(port).cloned()
    }

    /// Binds `task` to the master, schedules it on `thread_id`, and
    /// records it with the router so teardown can quiesce it.
    pub fn initialize_task(&self, task: &Task, thread_id: i32) {
        task.initialize(self.master, thread_id);
        self.router.work().record_task(task);
    }

    /// Binds `timer` to the master's timer list and records it with the
    /// router. The timer is not scheduled.
    pub fn initialize_timer(&self, timer: &Timer) {
        timer.initialize(self.master);
        self.router.work().record_timer(timer);
    }

    /// Exposes a named read-only introspection point on this element.
    pub fn add_read_handler<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Arc<dyn Element>) -> String + Send + Sync + 'static,
    {
        self.router.add_read_handler(self.index, name, handler);
    }

    /// Exposes a named control point on this element.
    pub fn add_write_handler<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Arc<dyn Element>, &str, &mut ErrorSink) -> ElementResult + Send + Sync + 'static,
    {
        self.router.add_write_handler(self.index, name, handler);
    }
}

/// A packet-processing element, implemented by collaborators outside this
/// crate and driven by the scheduling core.
///
/// Lifecycle: `configure` runs before any task or timer exists and only
/// parses arguments; `initialize` runs once per graph activation and is
/// where tasks, timers, and descriptor interest are registered; `cleanup`
/// runs in reverse dependency order during teardown. The core never
/// schedules work for an element that has not completed `initialize`.
pub trait Element: Send + Sync + 'static {
    /// The element class name, for diagnostics and handlers.
    fn class_name(&self) -> &'static str;

    fn num_inputs(&self) -> usize {
        0
    }

    fn num_outputs(&self) -> usize {
        0
    }

    fn input_kind(&self, _port: usize) -> PortKind {
        PortKind::Agnostic
    }

    fn output_kind(&self, _port: usize) -> PortKind {
        PortKind::Agnostic
    }

    /// Parses configuration arguments. Must not register tasks, timers,
    /// or descriptors. Report detail through `errh`.
    fn configure(&self, _args: &[String], _errh: &mut ErrorSink) -> ElementResult {
        Ok(())
    }

    /// Activates the element: keep the resolved ports, register tasks and
    /// timers and descriptor interest through `ctx`.
    fn initialize(&self, _ctx: &InitContext<'_>, _errh: &mut ErrorSink) -> ElementResult {
        Ok(())
    }

    /// Tears the element down; `stage` says how far the lifecycle got.
    fn cleanup(&self, _stage: CleanupStage) {}

    /// Receives a packet on input `port`, taking ownership.
    fn push(&self, _port: usize, packet: Packet) {
        packet.kill();
    }

    /// Offers a packet from output `port`; `None` means none available.
    fn pull(&self, _port: usize) -> Option<Packet> {
        None
    }

    /// The task callback. Return true to be rescheduled ("there may be
    /// more work"), false to stay off the queue until something external
    /// reschedules.
    fn run_task(&self, _task: &Task) -> bool {
        false
    }

    /// The timer callback, invoked once per due instant.
    fn run_timer(&self, _timer: &Timer) {}

    /// Readiness callback for a registered descriptor.
    fn selected(&self, _fd: RawFd, _mask: SelectMask) {}
}
