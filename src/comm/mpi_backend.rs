//! MPI backend for the [`Communicator`](super::Communicator) façade
//! (feature = `mpi-support`).
//!
//! Buffers handed to `isend`/`irecv` must stay alive until the returned
//! handle is waited; the rearrangement layers guarantee that by owning every
//! buffer for the duration of a collective call.

use super::{Communicator, Wait};
use mpi::request::{Request, StaticScope};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use std::sync::Arc;

pub struct MpiComm {
    _universe: Arc<mpi::environment::Universe>,
    world: SimpleCommunicator,
    rank: usize,
    size: usize,
}

impl MpiComm {
    /// Initialize MPI (or attach to an already-initialized environment) and
    /// wrap the world communicator.
    pub fn new() -> Self {
        let universe = Arc::new(mpi::initialize().expect("MPI initialization failed"));
        let world = universe.world();
        let rank = world.rank() as usize;
        let size = world.size() as usize;
        Self {
            _universe: universe,
            world,
            rank,
            size,
        }
    }
}

pub struct MpiHandle {
    req: Option<Request<'static, [u8], StaticScope>>,
}

impl Wait for MpiHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(req) = self.req.take() {
            req.wait();
        }
        // data (if any) landed directly in the caller's buffer
        None
    }
}

impl Communicator for MpiComm {
    type SendHandle = MpiHandle;
    type RecvHandle = MpiHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
        // Lifetime erasure: the swapm/rearrange callers keep the buffer alive
        // until this handle is waited.
        let buf: &'static [u8] = unsafe { std::mem::transmute(buf) };
        let req = self
            .world
            .process_at_rank(peer as i32)
            .immediate_send_with_tag(StaticScope, buf, tag as i32);
        MpiHandle { req: Some(req) }
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiHandle {
        let buf: &'static mut [u8] = unsafe { std::mem::transmute(buf) };
        let req = self
            .world
            .process_at_rank(peer as i32)
            .immediate_receive_into_with_tag(StaticScope, buf, tag as i32);
        MpiHandle { req: Some(req) }
    }

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
}
