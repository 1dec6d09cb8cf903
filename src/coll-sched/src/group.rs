//! Per-thread group batching state.
//!
//! Nothing in here is shared across threads: every execution thread sees
//! its own group depth, phase, buffered operations and caller marker.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::algo::AlgoHandle;
use crate::comm::Communicator;
use crate::param::{SchedulerParam, StreamHandle};
use crate::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GroupStatus {
    #[default]
    NoGroup,
    /// Every operation of the open group so far has an algorithm.
    SupportedOp,
    /// Some operation of the open group had none, the rest falls back too.
    UnsupportedOp,
}

/// An operation buffered until its group is flushed.
pub(crate) struct SavedOp {
    pub(crate) param: SchedulerParam<'static>,
    pub(crate) handle: Option<AlgoHandle>,
    pub(crate) comm: Arc<Communicator>,
    pub(crate) stream: StreamHandle,
}

#[derive(Default)]
struct ThreadLocalStatus {
    group_depth: usize,
    group_status: GroupStatus,
    saved: Vec<SavedOp>,
}

thread_local! {
    static THREAD_STATUS: RefCell<ThreadLocalStatus> = RefCell::new(ThreadLocalStatus::default());
    static IS_CALLER: Cell<bool> = const { Cell::new(false) };
}

pub fn group_depth() -> usize {
    THREAD_STATUS.with(|s| s.borrow().group_depth)
}

pub fn group_status() -> GroupStatus {
    THREAD_STATUS.with(|s| s.borrow().group_status)
}

pub(crate) fn set_group_status(status: GroupStatus) {
    THREAD_STATUS.with(|s| s.borrow_mut().group_status = status);
}

pub(crate) fn group_start() {
    THREAD_STATUS.with(|s| {
        let mut s = s.borrow_mut();
        s.group_depth += 1;
        if s.group_status == GroupStatus::NoGroup {
            s.group_status = GroupStatus::SupportedOp;
        }
    })
}

/// Closes one group level. When the outermost group closes, returns the
/// buffered operations that should now run on their algorithms.
pub(crate) fn group_end() -> Result<Option<Vec<SavedOp>>, Error> {
    THREAD_STATUS.with(|s| {
        let mut s = s.borrow_mut();
        if s.group_depth == 0 {
            return Err(Error::InvalidUsage("group end without a matching group start".to_string()));
        }
        s.group_depth -= 1;
        if s.group_depth > 0 {
            return Ok(None);
        }
        let ready = match s.group_status {
            GroupStatus::SupportedOp => Some(std::mem::take(&mut s.saved)),
            _ => None,
        };
        s.group_status = GroupStatus::NoGroup;
        Ok(ready)
    })
}

pub(crate) fn push_saved(op: SavedOp) {
    THREAD_STATUS.with(|s| s.borrow_mut().saved.push(op));
}

pub(crate) fn take_saved() -> Vec<SavedOp> {
    THREAD_STATUS.with(|s| std::mem::take(&mut s.borrow_mut().saved))
}

pub fn num_saved() -> usize {
    THREAD_STATUS.with(|s| s.borrow().saved.len())
}

pub(crate) fn clear_saved() {
    THREAD_STATUS.with(|s| s.borrow_mut().saved.clear());
}

/// Marks the current thread as calling the plain collectives on behalf of
/// the scheduler, so their entry points must not schedule again.
pub fn set_is_caller() {
    IS_CALLER.with(|c| c.set(true));
}

pub fn clear_is_caller() {
    IS_CALLER.with(|c| c.set(false));
}

pub fn is_caller() -> bool {
    IS_CALLER.with(|c| c.get())
}

/// Holds the caller marker for its lifetime.
pub struct CallerGuard {
    prev: bool,
}

impl CallerGuard {
    pub fn new() -> Self {
        let prev = IS_CALLER.with(|c| c.replace(true));
        CallerGuard { prev }
    }
}

impl Default for CallerGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallerGuard {
    fn drop(&mut self) {
        IS_CALLER.with(|c| c.set(self.prev));
    }
}
