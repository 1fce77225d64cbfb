//! Element graphs.
//!
//! A [`RouterBuilder`] assembles elements and connections; its
//! `initialize` drives the two-phase activation: configure every element
//! (aggregating all failures before giving up), resolve port disciplines,
//! then initialize elements in order, handing each its resolved ports and
//! the master context. The result is an active [`Router`] registered with
//! the master. Teardown runs `cleanup` in reverse order with the pool
//! paused, so no task of the router is mid-run while its elements die.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::element::{CleanupStage, Element, InitContext};
use crate::error::{ElementResult, ErrorSink, GraphError};
use crate::master::Master;
use crate::port::{Port, PortKind, Ports};
use crate::task::Task;
use crate::timer::Timer;

/// Handle to an element within one builder/router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementId(usize);

struct ElementEntry {
    name: String,
    element: Arc<dyn Element>,
    args: Vec<String>,
}

#[derive(Clone, Copy)]
struct Connection {
    from: usize,
    from_port: usize,
    to: usize,
    to_port: usize,
}

/// Assembles an element graph prior to activation.
pub struct RouterBuilder {
    entries: Vec<ElementEntry>,
    names: HashMap<String, usize>,
    connections: Vec<Connection>,
}

impl RouterBuilder {
    pub fn new() -> RouterBuilder {
        RouterBuilder {
            entries: Vec::new(),
            names: HashMap::new(),
            connections: Vec::new(),
        }
    }

    /// Adds an element under a unique name, with its configuration
    /// arguments.
    pub fn add_element(
        &mut self,
        name: &str,
        element: Arc<dyn Element>,
        args: &[&str],
    ) -> Result<ElementId, GraphError> {
        if self.names.contains_key(name) {
            return Err(GraphError::DuplicateName(name.to_string()));
        }
        let index = self.entries.len();
        self.names.insert(name.to_string(), index);
        self.entries.push(ElementEntry {
            name: name.to_string(),
            element,
            args: args.iter().map(|s| s.to_string()).collect(),
        });
        Ok(ElementId(index))
    }

    /// Connects output `from_port` of `from` to input `to_port` of `to`.
    pub fn connect(
        &mut self,
        from: ElementId,
        from_port: usize,
        to: ElementId,
        to_port: usize,
    ) -> Result<(), GraphError> {
        let from_entry = self.entries.get(from.0).ok_or(GraphError::UnknownElement)?;
        let to_entry = self.entries.get(to.0).ok_or(GraphError::UnknownElement)?;
        if from_port >= from_entry.element.num_outputs() {
            return Err(GraphError::PortOutOfRange {
                element: from_entry.name.clone(),
                port: from_port,
            });
        }
        if to_port >= to_entry.element.num_inputs() {
            return Err(GraphError::PortOutOfRange {
                element: to_entry.name.clone(),
                port: to_port,
            });
        }
        self.connections.push(Connection {
            from: from.0,
            from_port,
            to: to.0,
            to_port,
        });
        Ok(())
    }

    /// Activates the graph: configure, resolve ports, initialize, and
    /// register the router with `master`. Failures are aggregated in
    /// `errh`; on failure every element that got as far as configuring or
    /// initializing is cleaned up with the matching stage, and the master
    /// keeps running without the graph.
    pub fn initialize(
        self,
        master: &Arc<Master>,
        errh: &mut ErrorSink,
    ) -> Result<Arc<Router>, GraphError> {
        let RouterBuilder {
            entries,
            names,
            connections,
        } = self;

        // Resolve each connection to a concrete discipline.
        let mut resolved: Vec<(Connection, PortKind)> = Vec::with_capacity(connections.len());
        for conn in &connections {
            let out_kind = entries[conn.from].element.output_kind(conn.from_port);
            let in_kind = entries[conn.to].element.input_kind(conn.to_port);
            let kind = match (out_kind, in_kind) {
                (PortKind::Push, PortKind::Pull) | (PortKind::Pull, PortKind::Push) => {
                    return Err(GraphError::KindMismatch {
                        from: entries[conn.from].name.clone(),
                        from_port: conn.from_port,
                        to: entries[conn.to].name.clone(),
                        to_port: conn.to_port,
                    });
                }
                (PortKind::Pull, _) | (_, PortKind::Pull) => PortKind::Pull,
                (PortKind::Push, _) | (_, PortKind::Push) => PortKind::Push,
                (PortKind::Agnostic, PortKind::Agnostic) => PortKind::Push,
            };
            resolved.push((*conn, kind));
        }

        // A push output drives exactly one peer; a pull input drains
        // exactly one peer.
        let mut push_outputs: HashSet<(usize, usize)> = HashSet::new();
        let mut pull_inputs: HashSet<(usize, usize)> = HashSet::new();
        for (conn, kind) in &resolved {
            match kind {
                PortKind::Push => {
                    if !push_outputs.insert((conn.from, conn.from_port)) {
                        return Err(GraphError::DuplicateConnection {
                            element: entries[conn.from].name.clone(),
                            port: conn.from_port,
                            kind: "push output",
                        });
                    }
                }
                PortKind::Pull => {
                    if !pull_inputs.insert((conn.to, conn.to_port)) {
                        return Err(GraphError::DuplicateConnection {
                            element: entries[conn.to].name.clone(),
                            port: conn.to_port,
                            kind: "pull input",
                        });
                    }
                }
                PortKind::Agnostic => unreachable!("connection left unresolved"),
            }
        }

        // Phase 1: configure every element, collecting all failures.
        let mut configured: Vec<bool> = Vec::with_capacity(entries.len());
        for entry in &entries {
            errh.set_context(entry.name.clone());
            let before = errh.num_errors();
            let ok = entry.element.configure(&entry.args, errh).is_ok();
            if !ok && errh.num_errors() == before {
                errh.error("configure failed");
            }
            configured.push(ok && errh.num_errors() == before);
            errh.clear_context();
        }
        if errh.num_errors() > 0 {
            for (entry, ok) in entries.iter().zip(&configured).rev() {
                let stage = if *ok {
                    CleanupStage::Configured
                } else {
                    CleanupStage::ConfigureFailed
                };
                entry.element.cleanup(stage);
            }
            return Err(GraphError::InitFailed {
                nerrors: errh.num_errors(),
            });
        }

        // Build each element's view of its resolved ports. Only the
        // initiating side of a connection holds a handle.
        let mut ports: Vec<Ports> = entries
            .iter()
            .map(|e| Ports::new(e.element.num_inputs(), e.element.num_outputs()))
            .collect();
        for (conn, kind) in &resolved {
            match kind {
                PortKind::Push => ports[conn.from].set_output(
                    conn.from_port,
                    Port::new(entries[conn.to].element.clone(), conn.to_port),
                ),
                PortKind::Pull => ports[conn.to].set_input(
                    conn.to_port,
                    Port::new(entries[conn.from].element.clone(), conn.from_port),
                ),
                PortKind::Agnostic => unreachable!(),
            }
        }

        let router = Arc::new(Router {
            entries,
            names,
            work: WorkRegistry::new(),
            handlers: Mutex::new(HandlerTable::default()),
            master: Arc::downgrade(master),
            state: Mutex::new(RouterState::Initializing),
        });

        // Phase 2: initialize in order; the first failure aborts.
        let mut initialized = 0;
        let mut failed = false;
        for (index, entry) in router.entries.iter().enumerate() {
            let ctx = InitContext {
                master,
                router: &router,
                index,
                ports: &ports[index],
            };
            errh.set_context(entry.name.clone());
            let before = errh.num_errors();
            let ok = entry.element.initialize(&ctx, errh).is_ok();
            if !ok && errh.num_errors() == before {
                errh.error("initialize failed");
            }
            errh.clear_context();
            if !ok || errh.num_errors() > before {
                failed = true;
                break;
            }
            initialized += 1;
        }
        if failed {
            router.work.unschedule_all();
            for (index, entry) in router.entries.iter().enumerate().rev() {
                let stage = if index < initialized {
                    CleanupStage::Initialized
                } else if index == initialized {
                    CleanupStage::InitializeFailed
                } else {
                    CleanupStage::Configured
                };
                entry.element.cleanup(stage);
            }
            *router.state.lock() = RouterState::Dead;
            return Err(GraphError::InitFailed {
                nerrors: errh.num_errors(),
            });
        }

        *router.state.lock() = RouterState::Active;
        master.register_router(&router);
        Ok(router)
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        RouterBuilder::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RouterState {
    Initializing,
    Active,
    Dead,
}

type ReadHandler = Box<dyn Fn(&Arc<dyn Element>) -> String + Send + Sync>;
type WriteHandler = Box<dyn Fn(&Arc<dyn Element>, &str, &mut ErrorSink) -> ElementResult + Send + Sync>;

#[derive(Default)]
struct HandlerTable {
    read: HashMap<(usize, String), ReadHandler>,
    write: HashMap<(usize, String), WriteHandler>,
}

/// Tasks and timers registered by a router's elements, tracked so
/// teardown can quiesce everything the graph scheduled.
pub(crate) struct WorkRegistry {
    tasks: Mutex<Vec<Task>>,
    timers: Mutex<Vec<Timer>>,
}

impl WorkRegistry {
    fn new() -> WorkRegistry {
        WorkRegistry {
            tasks: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn record_task(&self, task: &Task) {
        let mut tasks = self.tasks.lock();
        if !tasks.iter().any(|t| t.same_task(task)) {
            tasks.push(task.clone());
        }
    }

    pub(crate) fn record_timer(&self, timer: &Timer) {
        let mut timers = self.timers.lock();
        if !timers.iter().any(|t| t.same_timer(timer)) {
            timers.push(timer.clone());
        }
    }

    fn scheduled_count(&self) -> usize {
        let tasks = self.tasks.lock().iter().filter(|t| t.scheduled()).count();
        let timers = self.timers.lock().iter().filter(|t| t.scheduled()).count();
        tasks + timers
    }

    fn unschedule_all(&self) {
        for task in self.tasks.lock().iter() {
            task.unschedule();
        }
        for timer in self.timers.lock().iter() {
            timer.unschedule();
        }
    }
}

/// An activated element graph served by a master.
pub struct Router {
    entries: Vec<ElementEntry>,
    names: HashMap<String, usize>,
    work: WorkRegistry,
    handlers: Mutex<HandlerTable>,
    master: Weak<Master>,
    state: Mutex<RouterState>,
}

impl Router {
    pub fn nelements(&self) -> usize {
        self.entries.len()
    }

    /// Looks up an element by the name it was added under.
    pub fn element(&self, name: &str) -> Option<Arc<dyn Element>> {
        self.names
            .get(name)
            .map(|&index| self.entries[index].element.clone())
    }

    pub(crate) fn element_name(&self, index: usize) -> &str {
        &self.entries[index].name
    }

    pub(crate) fn element_arc(&self, index: usize) -> Arc<dyn Element> {
        self.entries[index].element.clone()
    }

    pub(crate) fn work(&self) -> &WorkRegistry {
        &self.work
    }

    /// Tasks and timers of this router still scheduled, the "in use"
    /// count that blocks [`Master::remove_router`].
    pub fn scheduled_work(&self) -> usize {
        self.work.scheduled_count()
    }

    pub(crate) fn add_read_handler<F>(&self, index: usize, name: &str, handler: F)
    where
        F: Fn(&Arc<dyn Element>) -> String + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .read
            .insert((index, name.to_string()), Box::new(handler));
    }

    pub(crate) fn add_write_handler<F>(&self, index: usize, name: &str, handler: F)
    where
        F: Fn(&Arc<dyn Element>, &str, &mut ErrorSink) -> ElementResult + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .write
            .insert((index, name.to_string()), Box::new(handler));
    }

    /// Invokes the named read handler on the named element.
    pub fn call_read_handler(&self, element: &str, handler: &str) -> Option<String> {
        let &index = self.names.get(element)?;
        let handlers = self.handlers.lock();
        let h = handlers.read.get(&(index, handler.to_string()))?;
        Some(h(&self.entries[index].element))
    }

    /// Invokes the named write handler on the named element.
    pub fn call_write_handler(
        &self,
        element: &str,
        handler: &str,
        value: &str,
        errh: &mut ErrorSink,
    ) -> Option<ElementResult> {
        let &index = self.names.get(element)?;
        let handlers = self.handlers.lock();
        let h = handlers.write.get(&(index, handler.to_string()))?;
        Some(h(&self.entries[index].element, value, errh))
    }

    /// Deactivates the graph: quiesces the pool, unschedules everything
    /// the elements registered, runs `cleanup(Initialized)` in reverse
    /// order, and detaches from the master. Idempotent.
    pub fn teardown(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != RouterState::Active {
                return;
            }
            *state = RouterState::Dead;
        }
        if let Some(master) = self.master.upgrade() {
            master.pause();
            self.work.unschedule_all();
            for entry in self.entries.iter().rev() {
                entry.element.cleanup(CleanupStage::Initialized);
            }
            master.unpause();
            let _ = master.remove_router(self);
        } else {
            self.work.unschedule_all();
            for entry in self.entries.iter().rev() {
                entry.element.cleanup(CleanupStage::Initialized);
            }
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        // Reachable only once the master no longer holds this router.
        if *self.state.lock() == RouterState::Active {
            self.work.unschedule_all();
            for entry in self.entries.iter().rev() {
                entry.element.cleanup(CleanupStage::Initialized);
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("elements", &self.nelements())
            .field("state", &*self.state.lock())
            .finish()
    }
}
