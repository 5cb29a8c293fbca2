#![cfg_attr(docsrs, feature(doc_cfg))]
//! # pario
//!
//! pario is a parallel-io data rearrangement library for distributed
//! scientific arrays. Compute tasks hold scattered pieces of a global
//! multidimensional array, described by a per-task compute map; pario builds
//! a decomposition that routes that data onto a smaller set of io tasks
//! holding contiguous regions, and moves it there (and back) with a
//! flow-controlled collective that bounds outstanding requests at any scale.
//!
//! ## Features
//! - Box and subset rearrangers mapping compute layouts onto io-task regions
//! - Greedy region finding that covers an io layout with few (start, count)
//!   slabs for block io calls
//! - `swapm`, an all-to-all with a bounded request window, optional
//!   handshakes, and optional non-blocking sends
//! - Buffered darray writes: many variables per decomposition move in one
//!   rearrangement and flush through a pluggable `Dispatch` backend
//! - Persisted decomposition files for replaying a layout across runs
//! - Pluggable communication backends (serial, in-process, MPI)
//!
//! ## Usage
//! Add `pario` as a dependency in your `Cargo.toml` and enable features as
//! needed:
//!
//! ```toml
//! [dependencies]
//! pario = "0.3"
//! # Optional features:
//! # features = ["mpi-support"]
//! ```

pub mod comm;
pub mod darray;
pub mod decomp;
pub mod error;
pub mod index;
pub mod iosystem;
pub mod rearrange;
pub mod region;

pub mod prelude {
    //! Common public API, glob-importable.
    pub use crate::comm::{CommTag, Communicator, LocalComm, NoComm, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::comm::swapm::{FlowControl, UNLIMITED_PEND_REQ, swapm};
    pub use crate::darray::dispatch::{Dispatch, MemDispatch};
    pub use crate::darray::{FileHandle, WriteMode};
    pub use crate::decomp::file::{DecompFile, read_decomp_file};
    pub use crate::decomp::{IoDesc, Rearranger};
    pub use crate::error::PioError;
    pub use crate::iosystem::{IoSystem, PioContext};
    pub use crate::rearrange::{rearrange_comp2io, rearrange_io2comp};
    pub use crate::region::{Region, get_regions};
}
