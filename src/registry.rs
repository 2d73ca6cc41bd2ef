/// Per-kind worker slots: the single source of truth for which workers should run.
///
/// Every [`WorkerKind`] has exactly one slot, created at start-up as stopped.
/// Each slot has its own async mutex; callers hold it across a whole
/// read-modify-write (including launch and terminate awaits), so operations on
/// one kind serialize while different kinds never block each other.
///
/// The running flag is also published outside the lock whenever a guard is
/// released, so status reads never wait behind an in-flight stop or start.
use crate::process::ProcessHandle;
use crate::worker::{WorkerKind, WorkerSpec};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// Mutable state of one worker slot.
///
/// `handle.is_some()` implies `desired_running`.
#[derive(Debug, Default)]
pub struct WorkerState {
    pub desired_running: bool,
    pub handle: Option<ProcessHandle>,
}

impl WorkerState {
    /// Mark running with a freshly launched process.
    pub fn set_running(&mut self, handle: ProcessHandle) {
        self.desired_running = true;
        self.handle = Some(handle);
    }

    /// Mark stopped, handing back whatever process was held.
    pub fn clear(&mut self) -> Option<ProcessHandle> {
        self.desired_running = false;
        self.handle.take()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(ProcessHandle::pid)
    }
}

#[derive(Debug)]
struct Slot {
    spec: WorkerSpec,
    state: Mutex<WorkerState>,
    /// `desired_running` as of the last released guard.
    published: AtomicBool,
}

/// Exclusive access to one slot; publishes the running flag on drop.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    state: MutexGuard<'a, WorkerState>,
    published: &'a AtomicBool,
}

impl Deref for SlotGuard<'_> {
    type Target = WorkerState;

    fn deref(&self) -> &WorkerState {
        &self.state
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut WorkerState {
        &mut self.state
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.published
            .store(self.state.desired_running, Ordering::Release);
    }
}

impl Slot {
    fn guard<'a>(&'a self, state: MutexGuard<'a, WorkerState>) -> SlotGuard<'a> {
        SlotGuard {
            state,
            published: &self.published,
        }
    }
}

#[derive(Debug)]
pub struct WorkerRegistry {
    slots: [Slot; 2],
}

impl WorkerRegistry {
    /// Build one stopped slot per kind, with the spec returned by `spec_for`.
    pub fn new(mut spec_for: impl FnMut(WorkerKind) -> WorkerSpec) -> Self {
        let slots = WorkerKind::ALL.map(|kind| Slot {
            spec: spec_for(kind),
            state: Mutex::new(WorkerState::default()),
            published: AtomicBool::new(false),
        });
        Self { slots }
    }

    pub fn spec(&self, kind: WorkerKind) -> &WorkerSpec {
        &self.slots[kind.index()].spec
    }

    /// Acquire exclusive access to `kind`'s state.
    pub async fn lock(&self, kind: WorkerKind) -> SlotGuard<'_> {
        let slot = &self.slots[kind.index()];
        slot.guard(slot.state.lock().await)
    }

    /// Like [`lock`](Self::lock), but `None` while another operation holds the slot.
    pub fn try_lock(&self, kind: WorkerKind) -> Option<SlotGuard<'_>> {
        let slot = &self.slots[kind.index()];
        slot.state.try_lock().ok().map(|state| slot.guard(state))
    }

    /// Desired-running flag of every kind, without reconciling.
    ///
    /// A slot held by an in-flight operation reports its flag from before
    /// that operation.
    pub fn snapshot(&self) -> BTreeMap<WorkerKind, bool> {
        WorkerKind::ALL
            .into_iter()
            .map(|kind| {
                let running = self.slots[kind.index()].published.load(Ordering::Acquire);
                (kind, running)
            })
            .collect()
    }
}
