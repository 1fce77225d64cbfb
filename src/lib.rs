//! Execution and scheduling core for a modular packet-processing router.
//!
//! A router is a graph of small processing units ("elements") connected by
//! directed ports; packets flow between adjacent elements through direct
//! synchronous push/pull calls. This crate is the engine underneath that
//! graph:
//!
//! - [`Master`] — process-wide owner of the thread pool, the run-count
//!   gate, the global timer list, and the descriptor registry
//! - [`RouterThread`] — one worker's run loop: a bounded round-robin task
//!   burst, due timers, then a bounded blocking wait for I/O readiness
//! - [`Task`] — the cooperative unit of recurring work bound to one
//!   element; reschedulable, cancellable, and migratable across threads
//! - [`Timer`] — a deadline callback in the globally ordered timer list
//! - [`Notifier`] / [`NotifierSignal`] — the lock-free readiness token
//!   used for backpressure between elements
//! - [`RouterBuilder`] / [`Router`] — programmatic graph assembly and the
//!   configure/initialize/cleanup element lifecycle
//!
//! Element semantics (protocol parsing, header rewriting, device I/O)
//! live outside this crate, behind the [`Element`] trait.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pktgraph::{Builder, ErrorSink, RouterBuilder};
//!
//! let master = Builder::new().threads(2).build()?;
//!
//! let mut builder = RouterBuilder::new();
//! let src = builder.add_element("src", Arc::new(MySource::default()), &[])?;
//! let sink = builder.add_element("sink", Arc::new(MySink::default()), &[])?;
//! builder.connect(src, 0, sink, 0)?;
//!
//! let mut errh = ErrorSink::new();
//! let router = builder.initialize(&master, &mut errh)?;
//!
//! master.start()?;
//! // ... traffic flows ...
//! router.teardown();
//! master.stop();
//! master.join();
//! ```

mod config;
mod counters;
mod element;
mod env_config;
mod error;
mod master;
mod packet;
mod port;
mod router;
mod select;
mod signal;
mod task;
mod thread;
mod timer;

pub use config::Builder;
pub use element::{CleanupStage, Element, InitContext};
pub use env_config::EnvConfig;
pub use error::{
    ElementFailed, ElementResult, ErrorEntry, ErrorSink, GraphError, MasterError, Severity,
};
pub use master::Master;
pub use packet::{Packet, ANNO_SIZE, DEFAULT_HEADROOM};
pub use port::{Port, PortKind, Ports};
pub use router::{ElementId, Router, RouterBuilder};
pub use select::SelectMask;
pub use signal::{Notifier, NotifierSignal};
pub use task::{Task, QUIESCENT_THREAD_ID};
pub use thread::RouterThread;
pub use timer::Timer;
