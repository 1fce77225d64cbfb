//! Lock-free readiness signaling between elements.
//!
//! A [`Notifier`] owns a readiness cell that a producer flips as packets
//! become available or run out. A [`NotifierSignal`] is a non-owning
//! observation handle over one or more cells, polled without locks or side
//! effects. A `true` reading reserves nothing, and a `false` reading can
//! race with a producer flipping the cell immediately after the check; the
//! race is resolved on the producer side, which also reschedules every
//! sleeper task registered on the notifier whenever the cell goes active.

use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::task::Task;

/// One readiness cell with the mask selecting the bits observed.
#[derive(Clone)]
struct CellView {
    cell: Arc<AtomicU32>,
    mask: u32,
}

impl CellView {
    fn active(&self) -> bool {
        self.cell.load(Ordering::Relaxed) & self.mask != 0
    }

    fn same_cell(&self, other: &CellView) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

#[derive(Clone)]
enum SignalKind {
    Constant(bool),
    Cell(CellView),
    /// OR over two or more cells.
    Or(Arc<[CellView]>),
}

/// A non-owning readiness observation handle.
///
/// Either a constant, a view of one cell, or an OR-combination of several
/// cells built with `+`/`+=`. Cheap to clone and to poll.
#[derive(Clone)]
pub struct NotifierSignal {
    kind: SignalKind,
}

impl NotifierSignal {
    /// A signal that always reads active.
    pub fn always_true() -> NotifierSignal {
        NotifierSignal {
            kind: SignalKind::Constant(true),
        }
    }

    /// A signal that always reads inactive.
    pub fn always_false() -> NotifierSignal {
        NotifierSignal {
            kind: SignalKind::Constant(false),
        }
    }

    /// Polls current readiness. Advisory only: no locks, no side effects.
    pub fn active(&self) -> bool {
        match &self.kind {
            SignalKind::Constant(b) => *b,
            SignalKind::Cell(view) => view.active(),
            SignalKind::Or(views) => views.iter().any(CellView::active),
        }
    }

    fn views(&self) -> &[CellView] {
        match &self.kind {
            SignalKind::Constant(_) => &[],
            SignalKind::Cell(view) => std::slice::from_ref(view),
            SignalKind::Or(views) => views,
        }
    }
}

impl Add for NotifierSignal {
    type Output = NotifierSignal;

    /// OR-combination. Neither operand's cells are mutated; the result
    /// observes the union of both operands' cells.
    fn add(self, rhs: NotifierSignal) -> NotifierSignal {
        if matches!(self.kind, SignalKind::Constant(true))
            || matches!(rhs.kind, SignalKind::Constant(true))
        {
            return NotifierSignal::always_true();
        }
        if matches!(self.kind, SignalKind::Constant(false)) {
            return rhs;
        }
        if matches!(rhs.kind, SignalKind::Constant(false)) {
            return self;
        }
        let mut views: Vec<CellView> = self.views().to_vec();
        for v in rhs.views() {
            // Views of the same cell merge into one with a wider mask.
            if let Some(existing) = views.iter_mut().find(|e| e.same_cell(v)) {
                existing.mask |= v.mask;
            } else {
                views.push(v.clone());
            }
        }
        if views.len() == 1 {
            NotifierSignal {
                kind: SignalKind::Cell(views.pop().expect("one view")),
            }
        } else {
            NotifierSignal {
                kind: SignalKind::Or(views.into()),
            }
        }
    }
}

impl AddAssign for NotifierSignal {
    fn add_assign(&mut self, rhs: NotifierSignal) {
        let lhs = std::mem::replace(self, NotifierSignal::always_false());
        *self = lhs + rhs;
    }
}

impl std::fmt::Debug for NotifierSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SignalKind::Constant(b) => write!(f, "NotifierSignal::constant({b})"),
            SignalKind::Cell(_) => write!(f, "NotifierSignal::cell(active={})", self.active()),
            SignalKind::Or(views) => {
                write!(f, "NotifierSignal::or({}, active={})", views.len(), self.active())
            }
        }
    }
}

/// The producer side of a readiness cell.
///
/// Created by the element that knows when it has work to offer (for a pull
/// path, the upstream end). Consumers take a [`NotifierSignal`] via
/// [`Notifier::signal`] and register their task as a sleeper; flipping the
/// cell inactive→active reschedules every sleeper, so a `false` poll never
/// strands a consumer.
pub struct Notifier {
    view: CellView,
    sleepers: Mutex<Vec<Task>>,
}

impl Notifier {
    /// Creates a notifier whose cell starts in the given state.
    pub fn new(active: bool) -> Notifier {
        Notifier {
            view: CellView {
                cell: Arc::new(AtomicU32::new(if active { 1 } else { 0 })),
                mask: 1,
            },
            sleepers: Mutex::new(Vec::new()),
        }
    }

    pub fn active(&self) -> bool {
        self.view.active()
    }

    /// An observation handle over this notifier's cell.
    pub fn signal(&self) -> NotifierSignal {
        NotifierSignal {
            kind: SignalKind::Cell(self.view.clone()),
        }
    }

    /// Flips the cell. On an inactive→active transition every registered
    /// sleeper task is rescheduled (the push-side wake).
    pub fn set_active(&self, active: bool) {
        let mask = self.view.mask;
        let prev = if active {
            self.view.cell.fetch_or(mask, Ordering::AcqRel)
        } else {
            self.view.cell.fetch_and(!mask, Ordering::AcqRel)
        };
        if active && prev & mask == 0 {
            for task in self.sleepers.lock().iter() {
                task.reschedule();
            }
        }
    }

    /// Shorthand for `set_active(true)`.
    pub fn wake(&self) {
        self.set_active(true);
    }

    /// Shorthand for `set_active(false)`.
    pub fn sleep(&self) {
        self.set_active(false);
    }

    /// Registers a task to be rescheduled when the cell goes active.
    pub fn add_listener(&self, task: &Task) {
        let mut sleepers = self.sleepers.lock();
        if !sleepers.iter().any(|t| t.same_task(task)) {
            sleepers.push(task.clone());
        }
    }

    pub fn remove_listener(&self, task: &Task) {
        self.sleepers.lock().retain(|t| !t.same_task(task));
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("active", &self.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert!(NotifierSignal::always_true().active());
        assert!(!NotifierSignal::always_false().active());
    }

    #[test]
    fn test_cell_flip() {
        let n = Notifier::new(false);
        let s = n.signal();
        assert!(!s.active());
        n.wake();
        assert!(s.active());
        n.sleep();
        assert!(!s.active());
    }

    #[test]
    fn test_or_combination() {
        let a = Notifier::new(false);
        let b = Notifier::new(false);
        let s = a.signal() + b.signal();
        assert!(!s.active());
        b.wake();
        assert!(s.active());
        // Composition did not perturb the operands.
        assert!(!a.signal().active());
        assert!(b.signal().active());
        b.sleep();
        a.wake();
        assert!(s.active());
    }

    #[test]
    fn test_constant_absorption() {
        let a = Notifier::new(false);
        let t = a.signal() + NotifierSignal::always_true();
        assert!(t.active());
        let mut f = NotifierSignal::always_false();
        f += a.signal();
        assert!(!f.active());
        a.wake();
        assert!(f.active());
    }
}
