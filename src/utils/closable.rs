//! Shutdown tokens for resources whose state is observed across threads.
//!
//! [`Closer`] is owned by the side that decides when a resource dies; it
//! closes on drop. [`SharedCloser`] is the clonable variant for resources with
//! several co-owners; it closes when the last copy is dropped or any copy
//! calls [`SharedCloser::close`]. [`Closable`] is the read-only view handed to
//! dependent tasks which must stop once the resource is gone.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Owned closing state. Closes when dropped.
#[derive(Debug, Default)]
pub struct Closer(Arc<AtomicBool>);

impl Closer {
    /// Creates an open state.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Read-only view of this state.
    pub fn to_closable(&self) -> Closable {
        Closable(self.0.clone())
    }

    /// Marks the resource as closed.
    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` if the resource is closed.
    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Drop for Closer {
    fn drop(&mut self) {
        self.close()
    }
}

/// Closing state with shared ownership. Closes when every copy is gone.
#[derive(Debug)]
pub struct SharedCloser {
    flag: Arc<AtomicBool>,
    owners: Arc<AtomicUsize>,
}

impl SharedCloser {
    /// Creates an open state with a single owner.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            owners: Arc::new(AtomicUsize::new(1)),
        }
    }

    /// Read-only view of this state.
    pub fn to_closable(&self) -> Closable {
        Closable(self.flag.clone())
    }

    /// Marks the resource as closed for all owners.
    pub fn close(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns `true` if the resource is closed.
    pub fn is_closed(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Default for SharedCloser {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SharedCloser {
    fn clone(&self) -> Self {
        self.owners.fetch_add(1, Ordering::Release);
        Self {
            flag: self.flag.clone(),
            owners: self.owners.clone(),
        }
    }
}

impl Drop for SharedCloser {
    fn drop(&mut self) {
        if self.owners.fetch_sub(1, Ordering::Release) <= 1 {
            self.flag.store(true, Ordering::Release);
        }
    }
}

/// Read-only access to a closing state.
#[derive(Clone, Debug)]
pub struct Closable(Arc<AtomicBool>);

impl Closable {
    /// Returns `true` if the resource is closed.
    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
