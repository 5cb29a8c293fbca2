//! Thin façade over intra-process or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees). All
//! handles are **waitable** but non-blocking; [`swapm`](crate::comm::swapm)
//! calls `.wait()` before it trusts that a buffer is ready.
//!
//! Per (sender, receiver, tag) triple, delivery is FIFO: the rearrangement
//! layers rely on bytes for a given peer pair arriving in the order their
//! regions were enumerated.

pub mod swapm;

#[cfg(feature = "mpi-support")]
mod mpi_backend;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// This task's rank in the union communicator.
    fn rank(&self) -> usize;
    /// Number of ranks in the union communicator.
    fn size(&self) -> usize;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Typed message tag with room for per-call offsets.
///
/// Each collective invocation owns a small contiguous tag range so that a
/// data stream and its handshake stream never collide.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(u16);

impl CommTag {
    pub const fn new(base: u16) -> Self {
        CommTag(base)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// A tag `k` slots past this one.
    pub const fn offset(self, k: u16) -> Self {
        CommTag(self.0 + k)
    }
}

/// Tag bases reserved by the decomposition and darray layers.
pub mod tags {
    use super::CommTag;

    /// Per-peer element counts during decomposition creation.
    pub const DECOMP_COUNTS: CommTag = CommTag::new(64);
    /// Per-peer destination index lists during decomposition creation.
    pub const DECOMP_INDICES: CommTag = CommTag::new(80);
    /// Darray payload movement (comp→io and io→comp).
    pub const DARRAY_DATA: CommTag = CommTag::new(128);
    /// Agreement round deciding whether buffered darray data flushes now.
    pub const DARRAY_FLUSH: CommTag = CommTag::new(160);
    /// Serial-write funnel to the io root.
    pub const SERIAL_FUNNEL: CommTag = CommTag::new(192);
    /// Decomposition-file gather to rank 0.
    pub const DECOMP_FILE: CommTag = CommTag::new(224);
}

/// Compile-time no-op comm for pure serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// --- LocalComm: intra-process ranks sharing a mailbox ---

type Key = (usize, usize, u16); // (src, dst, tag)

/// Process-global mailbox. Values are FIFO queues so a fast sender can post
/// a second message on the same (src, dst, tag) triple before the first one
/// is consumed.
static MAILBOX: Lazy<DashMap<Key, VecDeque<Bytes>>> = Lazy::new(DashMap::new);

pub struct LocalHandle {
    buf: Arc<Mutex<Option<Vec<u8>>>>,
    handle: Option<JoinHandle<()>>,
}

impl Wait for LocalHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut guard = self.buf.lock().unwrap();
        guard.take()
    }
}

/// In-process communicator: every rank is a thread, messages go through the
/// process-global mailbox. Used by the test suites to run genuine 4-rank
/// exchanges in one process, and usable as a serial fallback.
#[derive(Clone, Debug)]
pub struct LocalComm {
    rank: usize,
    size: usize,
}

impl LocalComm {
    pub fn new(rank: usize, size: usize) -> Self {
        assert!(rank < size, "rank {rank} out of range for size {size}");
        Self { rank, size }
    }

    /// Drop any queued messages. Tests sharing the process-global mailbox
    /// call this between scenarios (and serialize themselves with
    /// `serial_test`).
    pub fn reset_mailbox() {
        MAILBOX.clear();
    }
}

impl Communicator for LocalComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.rank, peer, tag);
        let data = Bytes::from(buf.to_vec());
        MAILBOX.entry(key).or_default().push_back(data);
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> LocalHandle {
        let key = (peer, self.rank, tag);
        let buf_arc = Arc::new(Mutex::new(None));
        let buf_arc_clone = buf_arc.clone();
        let handle = std::thread::spawn(move || {
            loop {
                let popped = MAILBOX.get_mut(&key).and_then(|mut q| q.pop_front());
                if let Some(bytes) = popped {
                    // deliver the full payload; length mismatches are the
                    // caller's to detect, not to paper over
                    let mut guard = buf_arc_clone.lock().unwrap();
                    *guard = Some(bytes.to_vec());
                    break;
                }
                std::thread::yield_now();
            }
        });
        LocalHandle {
            buf: buf_arc,
            handle: Some(handle),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
