//! IO system description and the process-level context registry.
//!
//! [`IoSystem`] records how io tasks are placed inside the union
//! communicator (a strided subset, PIO-style). [`PioContext`] replaces the
//! hidden process-wide registries of the original design with an explicit
//! object owned by the caller and passed to every entry point: it holds the
//! open decompositions, open files, and the id counters.

use std::collections::BTreeMap;

use log::debug;

use crate::comm::Communicator;
use crate::comm::swapm::FlowControl;
use crate::darray::FileHandle;
use crate::decomp::{IoDesc, Rearranger, box_rearrange_create, subset_rearrange_create};
use crate::error::PioError;

/// Task-role description: which union ranks double as io tasks.
///
/// Io task `k` lives at union rank `k * io_stride`. Communicators themselves
/// are produced by out-of-scope bootstrap and supplied separately via the
/// [`Communicator`] façade.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IoSystem {
    size: usize,
    num_io_tasks: usize,
    io_stride: usize,
}

impl IoSystem {
    /// Validate and build a role map for `size` union ranks with
    /// `num_io_tasks` io tasks placed every `io_stride` ranks.
    pub fn new(size: usize, num_io_tasks: usize, io_stride: usize) -> Result<Self, PioError> {
        if size == 0 {
            return Err(PioError::invalid("communicator size must be at least 1"));
        }
        if num_io_tasks == 0 || num_io_tasks > size {
            return Err(PioError::invalid(format!(
                "num_io_tasks {num_io_tasks} out of range for {size} ranks"
            )));
        }
        if io_stride == 0 || (num_io_tasks - 1) * io_stride >= size {
            return Err(PioError::invalid(format!(
                "io_stride {io_stride} places io task {} outside {size} ranks",
                num_io_tasks - 1
            )));
        }
        Ok(IoSystem {
            size,
            num_io_tasks,
            io_stride,
        })
    }

    /// One io task per rank: every task computes and writes.
    pub fn all_ranks_io(size: usize) -> Result<Self, PioError> {
        Self::new(size, size, 1)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_io_tasks(&self) -> usize {
        self.num_io_tasks
    }

    /// Union rank hosting io task `k`.
    pub fn io_union_rank(&self, k: usize) -> usize {
        debug_assert!(k < self.num_io_tasks);
        k * self.io_stride
    }

    /// Io task index of a union rank, if it has one.
    pub fn io_index(&self, union_rank: usize) -> Option<usize> {
        if union_rank % self.io_stride == 0 {
            let k = union_rank / self.io_stride;
            (k < self.num_io_tasks).then_some(k)
        } else {
            None
        }
    }

    pub fn is_io_task(&self, union_rank: usize) -> bool {
        self.io_index(union_rank).is_some()
    }

    /// Union rank of io task 0; serial writes funnel through it.
    pub fn io_root(&self) -> usize {
        self.io_union_rank(0)
    }

    /// Union ranks of all io tasks, ascending.
    pub fn io_ranks(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_io_tasks).map(|k| self.io_union_rank(k))
    }
}

/// Default flush threshold for the per-file darray buffers (bytes).
pub const DEFAULT_BUFFER_LIMIT: usize = 64 * 1024 * 1024;

/// Explicit registry of open decompositions and files.
///
/// Owns the communicator handle, the io-task role map, and the flow-control
/// policy used for every collective it initiates. One context per
/// participating rank; all entry points are collective over the union
/// communicator unless noted.
pub struct PioContext<C: Communicator> {
    pub(crate) comm: C,
    pub(crate) ios: IoSystem,
    pub(crate) fc: FlowControl,
    pub(crate) decomps: BTreeMap<i32, IoDesc>,
    pub(crate) files: BTreeMap<i32, FileHandle>,
    next_ioid: i32,
    next_ncid: i32,
    pub(crate) buffer_limit: usize,
}

impl<C: Communicator> PioContext<C> {
    pub fn new(comm: C, ios: IoSystem, fc: FlowControl) -> Self {
        PioContext {
            comm,
            ios,
            fc,
            decomps: BTreeMap::new(),
            files: BTreeMap::new(),
            next_ioid: 512,
            next_ncid: 16,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }

    /// Lower the write-buffer flush threshold (bytes). Mostly for tests and
    /// memory-constrained runs.
    pub fn set_buffer_limit(&mut self, bytes: usize) {
        self.buffer_limit = bytes;
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn iosystem(&self) -> &IoSystem {
        &self.ios
    }

    pub fn flow_control(&self) -> FlowControl {
        self.fc
    }

    /// Build and register a decomposition; collective.
    ///
    /// `compmap` entries are 1-based global offsets, `0` marks a hole.
    /// Returns the id darray calls refer to the decomposition by.
    pub fn init_decomp(
        &mut self,
        gdims: &[i64],
        compmap: &[i64],
        rearranger: Rearranger,
    ) -> Result<i32, PioError> {
        let desc = match rearranger {
            Rearranger::Box => {
                box_rearrange_create(&self.ios, &self.comm, compmap, gdims, self.fc)?
            }
            Rearranger::Subset => {
                subset_rearrange_create(&self.ios, &self.comm, compmap, gdims, self.fc)?
            }
        };
        let ioid = self.next_ioid;
        self.next_ioid += 1;
        debug!(
            "rank {}: registered {:?} decomposition {ioid} (ndof {}, llen {})",
            self.comm.rank(),
            rearranger,
            desc.ndof,
            desc.llen
        );
        self.decomps.insert(ioid, desc);
        Ok(ioid)
    }

    /// Look up a registered decomposition.
    pub fn decomp(&self, ioid: i32) -> Result<&IoDesc, PioError> {
        self.decomps.get(&ioid).ok_or(PioError::BadIoid(ioid))
    }

    /// Drop a decomposition. Fails if any open file still buffers data for
    /// it; sync or close the file first.
    pub fn free_decomp(&mut self, ioid: i32) -> Result<(), PioError> {
        if !self.decomps.contains_key(&ioid) {
            return Err(PioError::BadIoid(ioid));
        }
        for (&ncid, file) in &self.files {
            if file.has_buffered(ioid) {
                return Err(PioError::invalid(format!(
                    "decomposition {ioid} still has buffered data in file {ncid}"
                )));
            }
        }
        self.decomps.remove(&ioid);
        Ok(())
    }

    /// Register an open file backed by a format dispatch layer.
    pub fn add_file(&mut self, file: FileHandle) -> i32 {
        let ncid = self.next_ncid;
        self.next_ncid += 1;
        self.files.insert(ncid, file);
        ncid
    }

    pub(crate) fn file(&self, ncid: i32) -> Result<&FileHandle, PioError> {
        self.files.get(&ncid).ok_or(PioError::BadNcid(ncid))
    }

    pub(crate) fn file_mut(&mut self, ncid: i32) -> Result<&mut FileHandle, PioError> {
        self.files.get_mut(&ncid).ok_or(PioError::BadNcid(ncid))
    }

    pub(crate) fn take_file(&mut self, ncid: i32) -> Result<FileHandle, PioError> {
        self.files.remove(&ncid).ok_or(PioError::BadNcid(ncid))
    }
}
