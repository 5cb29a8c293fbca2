//! Decomposition descriptors and the two rearrangement strategies.
//!
//! A decomposition maps one distributed array's elements between the layout
//! compute tasks hold and the layout a smaller set of io tasks needs. The
//! **box** rearranger gives each io task a contiguous slab of the flattened
//! global space (good spatial locality, few large transfers); the **subset**
//! rearranger pairs each io task with an evenly-sized group of compute tasks
//! regardless of position (good for irregular compute maps that a box
//! mapping would shatter into many small regions).
//!
//! Both builders end the same way: one flow-controlled counts exchange, one
//! index-list exchange, and a per-peer [`TransferPlan`] table built once and
//! immutable thereafter.
//!
//! Map convention: `compmap` entries are **1-based** global offsets, `0`
//! marks a hole (this task holds no data for that slot). Holes on the io
//! side are padded with the caller's fill value at darray time.

pub mod file;
pub mod plan;

use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;

use crate::comm::swapm::{FlowControl, swapm};
use crate::comm::{Communicator, tags};
use crate::error::PioError;
use crate::index::global_size;
use crate::iosystem::IoSystem;
use crate::region::{Region, get_regions};
use plan::TransferPlan;

/// Which strategy built a decomposition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Rearranger {
    Box,
    Subset,
}

/// Immutable decomposition descriptor.
///
/// Created once by [`crate::iosystem::PioContext::init_decomp`], shared
/// (read-only) by every darray operation on variables using it, destroyed by
/// `free_decomp`.
#[derive(Clone, Debug)]
pub struct IoDesc {
    pub rearranger: Rearranger,
    /// Global dimension lengths, slowest first.
    pub gdims: Vec<i64>,
    /// Local compute map length (elements this task contributes, holes
    /// included).
    pub ndof: usize,
    /// The 1-based compute map this task was built from, `0` marking holes.
    /// Kept so the decomposition can be persisted later.
    pub compmap: Vec<i64>,
    /// Io-local buffer length in elements; 0 on pure compute tasks.
    pub llen: usize,
    /// Per io-peer plan over the local compute buffer.
    pub comp_plan: TransferPlan,
    /// Per comp-peer plan over the io-local buffer.
    pub io_plan: TransferPlan,
    /// Contiguous (start, count) runs this io task writes or reads.
    pub io_regions: Vec<Region>,
    /// Io-local offsets no compute task contributed; padded with the fill
    /// value before a write.
    pub holes: Vec<usize>,
}

impl IoDesc {
    pub fn ndims(&self) -> usize {
        self.gdims.len()
    }

    /// Bytes of io buffer one variable of element size `elem` needs.
    pub fn io_buffer_hint(&self, elem: usize) -> usize {
        self.llen * elem
    }
}

/// Flat-space slab owned by io task `k` of `nio` over `gsize` elements:
/// remainder elements go to the lowest-ranked io tasks.
fn box_chunk(gsize: i64, nio: usize, k: usize) -> (i64, i64) {
    let base = gsize / nio as i64;
    let rem = gsize % nio as i64;
    let extra = (k as i64).min(rem);
    let start = k as i64 * base + extra;
    let len = base + if (k as i64) < rem { 1 } else { 0 };
    (start, len)
}

/// Io task index owning flat global index `g` under [`box_chunk`].
fn box_owner(gsize: i64, nio: usize, g: i64) -> usize {
    let base = gsize / nio as i64;
    let rem = gsize % nio as i64;
    if base == 0 {
        return g as usize;
    }
    let split = rem * (base + 1);
    if g < split {
        (g / (base + 1)) as usize
    } else {
        (rem + (g - split) / base) as usize
    }
}

fn validate_compmap(compmap: &[i64], gsize: i64) -> Result<(), PioError> {
    for &m in compmap {
        if m < 0 || m > gsize {
            return Err(PioError::MapOutOfRange { found: m, gsize });
        }
    }
    Ok(())
}

/// Exchange per-peer element counts, then per-peer destination index lists.
///
/// `send_dest[peer]` holds the io-local destination offsets this task's
/// elements take inside `peer`'s buffer; an entry must exist (possibly
/// empty) for every peer that will post a count receive from us.
/// `recv_peers` lists the ranks this task may receive contributions from.
/// Returns `(peer, offsets)` for every peer that actually sent elements.
pub fn compute_counts<C: Communicator>(
    comm: &C,
    send_dest: &BTreeMap<usize, Vec<u64>>,
    recv_peers: &[usize],
    fc: FlowControl,
) -> Result<Vec<(usize, Vec<u64>)>, PioError> {
    let n = comm.size();

    // Phase 1: fixed-size counts, sent even when zero so receivers can
    // pre-size the index phase.
    let mut sends: Vec<Vec<u8>> = vec![Vec::new(); n];
    for (&peer, dest) in send_dest {
        sends[peer] = (dest.len() as u64).to_le_bytes().to_vec();
    }
    let mut recvs: Vec<Vec<u8>> = vec![Vec::new(); n];
    for &peer in recv_peers {
        recvs[peer] = vec![0u8; 8];
    }
    swapm(comm, &sends, &mut recvs, fc, tags::DECOMP_COUNTS)?;

    let mut counts: Vec<(usize, usize)> = Vec::new();
    for &peer in recv_peers {
        let c = u64::from_le_bytes(recvs[peer][..8].try_into().unwrap()) as usize;
        if c > 0 {
            counts.push((peer, c));
        }
    }

    // Phase 2: the destination offsets themselves, zero-count pairs skipped.
    let mut sends: Vec<Vec<u8>> = vec![Vec::new(); n];
    for (&peer, dest) in send_dest {
        if !dest.is_empty() {
            // little-endian on the wire, independent of receive alignment
            sends[peer] = dest.iter().flat_map(|d| d.to_le_bytes()).collect();
        }
    }
    let mut recvs: Vec<Vec<u8>> = vec![Vec::new(); n];
    for &(peer, c) in &counts {
        recvs[peer] = vec![0u8; c * 8];
    }
    swapm(comm, &sends, &mut recvs, fc, tags::DECOMP_INDICES)?;

    Ok(counts
        .into_iter()
        .map(|(peer, _)| {
            let offsets: Vec<u64> = recvs[peer]
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                .collect();
            (peer, offsets)
        })
        .collect())
}

/// Build the io-side plan table from received destination lists, collecting
/// uncontributed offsets as holes and rejecting duplicate claims.
fn build_io_side(
    llen: usize,
    received: Vec<(usize, Vec<u64>)>,
    io_start: i64,
) -> Result<(TransferPlan, Vec<usize>), PioError> {
    let mut claimed = vec![false; llen];
    let mut entries = Vec::with_capacity(received.len());
    for (peer, dest) in received {
        let mut offsets = Vec::with_capacity(dest.len());
        for d in dest {
            let d = d as usize;
            if d >= llen {
                return Err(PioError::MapOutOfRange {
                    found: io_start + d as i64,
                    gsize: io_start + llen as i64,
                });
            }
            if claimed[d] {
                return Err(PioError::DuplicateIndex(io_start + d as i64));
            }
            claimed[d] = true;
            offsets.push(d);
        }
        entries.push((peer, offsets));
    }
    let holes: Vec<usize> = claimed
        .iter()
        .enumerate()
        .filter_map(|(i, &c)| (!c).then_some(i))
        .collect();
    Ok((TransferPlan::from_peer_offsets(entries), holes))
}

/// Build a box decomposition: io task `k` owns a contiguous slab of the
/// flattened global array, and every compute task routes each element to the
/// slab containing it.
pub fn box_rearrange_create<C: Communicator>(
    ios: &IoSystem,
    comm: &C,
    compmap: &[i64],
    gdims: &[i64],
    fc: FlowControl,
) -> Result<IoDesc, PioError> {
    let gsize = global_size(gdims)?;
    validate_compmap(compmap, gsize)?;
    let nio = ios.num_io_tasks();
    let rank = comm.rank();

    // Route each contributed element: owner io task, slab-local destination.
    let mut src_by_peer: BTreeMap<usize, Vec<(i64, usize)>> = BTreeMap::new();
    for (i, &m) in compmap.iter().enumerate() {
        if m == 0 {
            continue;
        }
        let g = m - 1;
        let k = box_owner(gsize, nio, g);
        let peer = ios.io_union_rank(k);
        let (chunk_start, _) = box_chunk(gsize, nio, k);
        src_by_peer.entry(peer).or_default().push((g - chunk_start, i));
    }

    // Every io task hears a count from every rank.
    let mut send_dest: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    for k in 0..nio {
        send_dest.entry(ios.io_union_rank(k)).or_default();
    }
    let mut comp_entries = Vec::new();
    for (peer, mut elems) in src_by_peer {
        // send order: ascending destination offset on the io side
        elems.sort_unstable();
        send_dest.insert(peer, elems.iter().map(|&(d, _)| d as u64).collect());
        comp_entries.push((peer, elems.into_iter().map(|(_, i)| i).collect()));
    }

    let (llen, io_start) = match ios.io_index(rank) {
        Some(k) => {
            let (start, len) = box_chunk(gsize, nio, k);
            (len as usize, start)
        }
        None => (0, 0),
    };
    // io tasks hear a count from every rank, even for an empty slab
    let recv_peers: Vec<usize> = if ios.io_index(rank).is_some() {
        (0..comm.size()).collect()
    } else {
        Vec::new()
    };

    let received = compute_counts(comm, &send_dest, &recv_peers, fc)?;
    let (io_plan, holes) = build_io_side(llen, received, io_start)?;

    // The box covers its whole slab, holes included.
    let io_map: Vec<i64> = (io_start..io_start + llen as i64).collect();
    let io_regions = get_regions(gdims, &io_map)?;
    debug!(
        "box decomposition rank {rank}: ndof {}, llen {llen}, {} io regions, {} holes",
        compmap.len(),
        io_regions.len(),
        holes.len()
    );

    Ok(IoDesc {
        rearranger: Rearranger::Box,
        gdims: gdims.to_vec(),
        ndof: compmap.len(),
        compmap: compmap.to_vec(),
        llen,
        comp_plan: TransferPlan::from_peer_offsets(comp_entries),
        io_plan,
        io_regions,
        holes,
    })
}

/// Even grouping of union ranks onto io tasks, independent of spatial
/// position: rank `r` of `n` reports to io task `r * nio / n`.
pub fn default_subset_partition(n: usize, nio: usize, rank: usize) -> usize {
    debug_assert!(nio >= 1 && nio <= n && rank < n);
    rank * nio / n
}

/// Build a subset decomposition: each io task serves an arbitrary, evenly
/// sized group of compute tasks and keeps their union of indices sorted as
/// its local layout.
pub fn subset_rearrange_create<C: Communicator>(
    ios: &IoSystem,
    comm: &C,
    compmap: &[i64],
    gdims: &[i64],
    fc: FlowControl,
) -> Result<IoDesc, PioError> {
    let gsize = global_size(gdims)?;
    validate_compmap(compmap, gsize)?;
    let n = comm.size();
    let nio = ios.num_io_tasks();
    let rank = comm.rank();

    let my_io = ios.io_union_rank(default_subset_partition(n, nio, rank));

    // This task's contributions, sorted by global index.
    let mut elems: Vec<(i64, usize)> = compmap
        .iter()
        .enumerate()
        .filter(|&(_, &m)| m != 0)
        .map(|(i, &m)| (m - 1, i))
        .collect();
    elems.sort_unstable();
    let my_glist: Vec<u64> = elems.iter().map(|&(g, _)| g as u64).collect();
    let comp_offsets: Vec<usize> = elems.into_iter().map(|(_, i)| i).collect();

    let mut send_dest = BTreeMap::new();
    send_dest.insert(my_io, my_glist);

    // Io tasks hear from exactly their group members.
    let members: Vec<usize> = match ios.io_index(rank) {
        Some(k) => (0..n)
            .filter(|&r| default_subset_partition(n, nio, r) == k)
            .collect(),
        None => Vec::new(),
    };

    let received = compute_counts(comm, &send_dest, &members, fc)?;

    // Merge the group's global indices into one sorted io-local layout.
    let mut merged: Vec<(i64, usize, usize)> = Vec::new(); // (g, peer, peer-order)
    for (peer, glist) in &received {
        for (j, &g) in glist.iter().enumerate() {
            merged.push((g as i64, *peer, j));
        }
    }
    merged.sort_unstable();
    if let Some((dup, _)) = merged.iter().tuple_windows().find(|(a, b)| a.0 == b.0) {
        return Err(PioError::DuplicateIndex(dup.0));
    }
    let io_map: Vec<i64> = merged.iter().map(|&(g, _, _)| g).collect();
    let llen = io_map.len();

    // Destination offset of each peer's element = its slot in the merge;
    // ascending slot order preserves each peer's own send order.
    let mut dest_by_peer: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (slot, &(_, peer, _)) in merged.iter().enumerate() {
        dest_by_peer.entry(peer).or_default().push(slot);
    }
    let io_plan =
        TransferPlan::from_peer_offsets(dest_by_peer.into_iter().collect::<Vec<_>>());

    let io_regions = get_regions(gdims, &io_map)?;
    debug!(
        "subset decomposition rank {rank}: io target {my_io}, llen {llen}, {} io regions",
        io_regions.len()
    );

    Ok(IoDesc {
        rearranger: Rearranger::Subset,
        gdims: gdims.to_vec(),
        ndof: compmap.len(),
        compmap: compmap.to_vec(),
        llen,
        comp_plan: TransferPlan::from_peer_offsets(vec![(my_io, comp_offsets)]),
        io_plan,
        io_regions,
        // subset io layouts contain exactly the contributed indices
        holes: Vec::new(),
    })
}
