//! Shared elements for the integration tests.
//!
//! Small, self-contained implementations of the element contract: a push
//! source, a push-to-pull queue with a nonempty notifier, a pull consumer
//! gated on that notifier, and a few lifecycle probes.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use pktgraph::{
    CleanupStage, Element, ElementFailed, ElementResult, ErrorSink, InitContext, Notifier, Packet,
    Port, PortKind, Task,
};

/// Push source: each task run emits one packet downstream, up to `limit`.
pub struct PushSource {
    out: OnceLock<Port>,
    task: OnceLock<Task>,
    thread: i32,
    limit: usize,
    emitted: AtomicUsize,
}

impl PushSource {
    pub fn new(thread: i32, limit: usize) -> PushSource {
        PushSource {
            out: OnceLock::new(),
            task: OnceLock::new(),
            thread,
            limit,
            emitted: AtomicUsize::new(0),
        }
    }

    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }

    pub fn task(&self) -> &Task {
        self.task.get().expect("initialized")
    }
}

impl Element for PushSource {
    fn class_name(&self) -> &'static str {
        "PushSource"
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn output_kind(&self, _port: usize) -> PortKind {
        PortKind::Push
    }

    fn initialize(&self, ctx: &InitContext<'_>, errh: &mut ErrorSink) -> ElementResult {
        let Some(out) = ctx.output(0) else {
            errh.error("output 0 unconnected");
            return Err(ElementFailed);
        };
        let _ = self.out.set(out);
        let task = Task::new(ctx.element());
        ctx.initialize_task(&task, self.thread);
        let _ = self.task.set(task);
        Ok(())
    }

    fn cleanup(&self, stage: CleanupStage) {
        if stage == CleanupStage::Initialized {
            if let Some(task) = self.task.get() {
                task.unschedule();
            }
        }
    }

    fn run_task(&self, _task: &Task) -> bool {
        let n = self.emitted.load(Ordering::SeqCst);
        if n >= self.limit {
            return false;
        }
        let mut packet = Packet::new(64);
        packet.data_mut()[0] = n as u8;
        self.out.get().expect("initialized").push(packet);
        self.emitted.fetch_add(1, Ordering::SeqCst) + 1 < self.limit
    }
}

/// Push-in, pull-out queue publishing a nonempty notifier.
pub struct TestQueue {
    packets: Mutex<VecDeque<Packet>>,
    notifier: Arc<Notifier>,
    capacity: usize,
    dropped: AtomicUsize,
}

impl TestQueue {
    pub fn new(notifier: Arc<Notifier>) -> TestQueue {
        TestQueue {
            packets: Mutex::new(VecDeque::new()),
            notifier,
            capacity: 1024,
            dropped: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl Element for TestQueue {
    fn class_name(&self) -> &'static str {
        "TestQueue"
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn input_kind(&self, _port: usize) -> PortKind {
        PortKind::Push
    }

    fn output_kind(&self, _port: usize) -> PortKind {
        PortKind::Pull
    }

    fn push(&self, _port: usize, packet: Packet) {
        let mut packets = self.packets.lock();
        if packets.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            packet.kill();
            return;
        }
        packets.push_back(packet);
        drop(packets);
        self.notifier.wake();
    }

    fn pull(&self, _port: usize) -> Option<Packet> {
        let mut packets = self.packets.lock();
        let packet = packets.pop_front();
        if packets.is_empty() {
            self.notifier.sleep();
        }
        packet
    }
}

/// Pull consumer: its task polls the queue's signal before pulling, and
/// registers as a sleeper so the producer's wake reschedules it.
pub struct PullSink {
    input: OnceLock<Port>,
    task: OnceLock<Task>,
    thread: i32,
    notifier: Arc<Notifier>,
    pulled: AtomicUsize,
}

impl PullSink {
    pub fn new(thread: i32, notifier: Arc<Notifier>) -> PullSink {
        PullSink {
            input: OnceLock::new(),
            task: OnceLock::new(),
            thread,
            notifier,
            pulled: AtomicUsize::new(0),
        }
    }

    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    pub fn task(&self) -> &Task {
        self.task.get().expect("initialized")
    }
}

impl Element for PullSink {
    fn class_name(&self) -> &'static str {
        "PullSink"
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn input_kind(&self, _port: usize) -> PortKind {
        PortKind::Pull
    }

    fn initialize(&self, ctx: &InitContext<'_>, errh: &mut ErrorSink) -> ElementResult {
        let Some(input) = ctx.input(0) else {
            errh.error("input 0 unconnected");
            return Err(ElementFailed);
        };
        let _ = self.input.set(input);
        let task = Task::new(ctx.element());
        ctx.initialize_task(&task, self.thread);
        self.notifier.add_listener(&task);
        let _ = self.task.set(task);
        Ok(())
    }

    fn cleanup(&self, stage: CleanupStage) {
        if stage == CleanupStage::Initialized {
            if let Some(task) = self.task.get() {
                self.notifier.remove_listener(task);
                task.unschedule();
            }
        }
    }

    fn run_task(&self, _task: &Task) -> bool {
        if !self.notifier.signal().active() {
            // Nothing upstream; the producer's wake reschedules us.
            return false;
        }
        match self.input.get().expect("initialized").pull() {
            Some(packet) => {
                packet.kill();
                self.pulled.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// Counts packets pushed into it.
pub struct PushCounter {
    received: AtomicUsize,
}

impl PushCounter {
    pub fn new() -> PushCounter {
        PushCounter {
            received: AtomicUsize::new(0),
        }
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

impl Element for PushCounter {
    fn class_name(&self) -> &'static str {
        "PushCounter"
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn input_kind(&self, _port: usize) -> PortKind {
        PortKind::Push
    }

    fn push(&self, _port: usize, packet: Packet) {
        self.received.fetch_add(1, Ordering::SeqCst);
        packet.kill();
    }
}

/// Lifecycle probe: fails `configure` when told to, and records every
/// cleanup stage it sees.
pub struct LifecycleProbe {
    fail_configure: bool,
    stages: Mutex<Vec<CleanupStage>>,
}

impl LifecycleProbe {
    pub fn new(fail_configure: bool) -> Arc<LifecycleProbe> {
        Arc::new(LifecycleProbe {
            fail_configure,
            stages: Mutex::new(Vec::new()),
        })
    }

    pub fn stages(&self) -> Vec<CleanupStage> {
        self.stages.lock().clone()
    }
}

impl Element for LifecycleProbe {
    fn class_name(&self) -> &'static str {
        "LifecycleProbe"
    }

    fn configure(&self, args: &[String], errh: &mut ErrorSink) -> ElementResult {
        if self.fail_configure {
            errh.error(format!("bad arguments {:?}", args));
            return Err(ElementFailed);
        }
        Ok(())
    }

    fn cleanup(&self, stage: CleanupStage) {
        self.stages.lock().push(stage);
    }
}

/// Element exposing a counter through read/write handlers.
pub struct HandlerElement {
    value: Arc<AtomicUsize>,
}

impl HandlerElement {
    pub fn new() -> HandlerElement {
        HandlerElement {
            value: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn value(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }
}

impl Element for HandlerElement {
    fn class_name(&self) -> &'static str {
        "HandlerElement"
    }

    fn initialize(&self, ctx: &InitContext<'_>, _errh: &mut ErrorSink) -> ElementResult {
        let value = self.value.clone();
        ctx.add_read_handler("value", move |_| value.load(Ordering::SeqCst).to_string());
        let value = self.value.clone();
        ctx.add_write_handler("value", move |_, arg, errh| match arg.parse::<usize>() {
            Ok(v) => {
                value.store(v, Ordering::SeqCst);
                Ok(())
            }
            Err(_) => {
                errh.error(format!("expected a number, got `{arg}`"));
                Err(ElementFailed)
            }
        });
        Ok(())
    }
}

/// Push-only output element, for port-kind mismatch tests.
pub struct PushOnlyOut;

impl Element for PushOnlyOut {
    fn class_name(&self) -> &'static str {
        "PushOnlyOut"
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn output_kind(&self, _port: usize) -> PortKind {
        PortKind::Push
    }
}

/// Pull-only input element, for port-kind mismatch tests.
pub struct PullOnlyIn;

impl Element for PullOnlyIn {
    fn class_name(&self) -> &'static str {
        "PullOnlyIn"
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn input_kind(&self, _port: usize) -> PortKind {
        PortKind::Pull
    }
}
