//! Purpose: Own result bytes handed to callers and police raw handle lifetimes.
//! Exports: `Buffer`, `BufferArena`, `arena`.
//! Role: `Buffer` is the scoped Rust owner; `BufferArena` turns it into a raw
//! handle for the C ABI and takes it back exactly once.
//! Invariants: Bytes are stable from publish until destroy; no pooling or dedup.
//! Invariants: Debug builds panic on read-after-destroy and double-destroy.
use super::kind::ResponseKind;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(debug_assertions)]
use std::collections::HashSet;
#[cfg(debug_assertions)]
use std::sync::Mutex;

/// Independently owned result bytes. Dropping it frees the bytes; `release`
/// does the same explicitly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Buffer {
    bytes: Box<[u8]>,
    kind: ResponseKind,
}

impl Buffer {
    pub fn new(bytes: impl Into<Vec<u8>>, kind: ResponseKind) -> Self {
        Self {
            bytes: bytes.into().into_boxed_slice(),
            kind,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Kind of the payload these bytes came from.
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes.into_vec()
    }

    pub fn release(self) {}
}

pub struct BufferArena {
    live: AtomicUsize,
    #[cfg(debug_assertions)]
    tracked: Mutex<HashSet<usize>>,
}

impl BufferArena {
    pub fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            tracked: Mutex::new(HashSet::new()),
        }
    }

    /// Number of handles published and not yet destroyed.
    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn publish(&self, buffer: Buffer) -> *mut Buffer {
        let handle = Box::into_raw(Box::new(buffer));
        #[cfg(debug_assertions)]
        self.track(handle as usize);
        self.live.fetch_add(1, Ordering::AcqRel);
        handle
    }

    /// # Safety
    /// `handle` must come from `publish` on this arena and not be destroyed yet.
    pub unsafe fn read<'a>(&self, handle: *const Buffer) -> Option<&'a Buffer> {
        if handle.is_null() {
            return None;
        }
        #[cfg(debug_assertions)]
        self.check_live(handle as usize, "read after destroy");
        unsafe { Some(&*handle) }
    }

    /// # Safety
    /// `handle` must come from `publish` on this arena and be destroyed at most once.
    pub unsafe fn destroy(&self, handle: *const Buffer) {
        if handle.is_null() {
            return;
        }
        #[cfg(debug_assertions)]
        self.untrack(handle as usize);
        unsafe {
            drop(Box::from_raw(handle as *mut Buffer));
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    #[cfg(debug_assertions)]
    fn track(&self, addr: usize) {
        if let Ok(mut tracked) = self.tracked.lock() {
            tracked.insert(addr);
        }
    }

    #[cfg(debug_assertions)]
    fn check_live(&self, addr: usize, what: &str) {
        let live = self
            .tracked
            .lock()
            .map(|tracked| tracked.contains(&addr))
            .unwrap_or(true);
        if !live {
            contract_violation(what, addr);
        }
    }

    #[cfg(debug_assertions)]
    fn untrack(&self, addr: usize) {
        let removed = self
            .tracked
            .lock()
            .map(|mut tracked| tracked.remove(&addr))
            .unwrap_or(true);
        if !removed {
            contract_violation("double destroy", addr);
        }
    }
}

impl Default for BufferArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(debug_assertions)]
fn contract_violation(what: &str, addr: usize) -> ! {
    tracing::error!(handle = addr, "buffer handle {what}");
    panic!("contract violation: {what} of buffer handle {addr:#x}");
}

/// Process-wide arena backing the C ABI string handles.
pub fn arena() -> &'static BufferArena {
    static ARENA: OnceLock<BufferArena> = OnceLock::new();
    ARENA.get_or_init(BufferArena::new)
}
