//! Per-peer transfer plans: the derived-datatype table of a decomposition.
//!
//! Each plan records, for one remote peer, which element offsets of a flat
//! local buffer belong to that peer's transfer. Plans are built once at
//! decomposition creation and are read-only afterwards; a collective call
//! shares them across all of its outstanding requests.
//!
//! [`gcd_blocksize`](crate::index::gcd_blocksize) detects when an offset
//! list collapses to a contiguous range or a uniform-stride block, which
//! keeps the common regular-decomposition case allocation-free at pack time.

use crate::index::gcd_blocksize;

/// The offsets one peer contributes to (or consumes from) a flat buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerPlan {
    /// `len` consecutive elements starting at `offset`.
    Contig { offset: usize, len: usize },
    /// `nblocks` blocks of `blocklen` consecutive elements, block starts
    /// `stride` elements apart.
    Strided {
        offset: usize,
        blocklen: usize,
        stride: usize,
        nblocks: usize,
    },
    /// Arbitrary element offsets, in plan order.
    Indexed { offsets: Vec<usize> },
}

impl PeerPlan {
    /// Collapse an offset list to the cheapest representation.
    ///
    /// Comp-side plans carry offsets in destination order, a permutation
    /// whenever the compute map is unsorted; only an ascending list may
    /// collapse to `Contig`/`Strided`, anything else stays `Indexed` with
    /// its order preserved.
    pub fn from_offsets(offsets: Vec<usize>) -> Self {
        if offsets.is_empty() {
            return PeerPlan::Contig { offset: 0, len: 0 };
        }
        if offsets.windows(2).any(|w| w[0] >= w[1]) {
            return PeerPlan::Indexed { offsets };
        }
        let first = offsets[0];
        let len = offsets.len();
        if offsets[len - 1] - first + 1 == len {
            return PeerPlan::Contig { offset: first, len };
        }
        // uniform-stride block detection via the run-length gcd pre-pass
        let as_i64: Vec<i64> = offsets.iter().map(|&o| o as i64).collect();
        let blocklen = gcd_blocksize(&as_i64) as usize;
        if blocklen > 0 && len % blocklen == 0 {
            let nblocks = len / blocklen;
            if nblocks > 1 {
                let stride = offsets[blocklen] - first;
                let uniform = (0..nblocks).all(|b| {
                    (0..blocklen)
                        .all(|j| offsets[b * blocklen + j] == first + b * stride + j)
                });
                if uniform {
                    return PeerPlan::Strided {
                        offset: first,
                        blocklen,
                        stride,
                        nblocks,
                    };
                }
            }
        }
        PeerPlan::Indexed { offsets }
    }

    /// Number of elements this plan covers.
    pub fn len(&self) -> usize {
        match self {
            PeerPlan::Contig { len, .. } => *len,
            PeerPlan::Strided {
                blocklen, nblocks, ..
            } => blocklen * nblocks,
            PeerPlan::Indexed { offsets } => offsets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every element offset in plan order.
    pub fn for_each(&self, mut f: impl FnMut(usize)) {
        match self {
            PeerPlan::Contig { offset, len } => {
                for o in *offset..offset + len {
                    f(o);
                }
            }
            PeerPlan::Strided {
                offset,
                blocklen,
                stride,
                nblocks,
            } => {
                for b in 0..*nblocks {
                    let base = offset + b * stride;
                    for o in base..base + blocklen {
                        f(o);
                    }
                }
            }
            PeerPlan::Indexed { offsets } => {
                for &o in offsets {
                    f(o);
                }
            }
        }
    }

    /// Append the planned elements of `src` (element size `elem` bytes) to
    /// `out`, in plan order.
    pub fn pack(&self, elem: usize, src: &[u8], out: &mut Vec<u8>) {
        self.for_each(|o| out.extend_from_slice(&src[o * elem..(o + 1) * elem]));
    }

    /// Scatter `data` (element size `elem` bytes, in plan order) into `dst`.
    pub fn unpack(&self, elem: usize, data: &[u8], dst: &mut [u8]) {
        debug_assert_eq!(data.len(), self.len() * elem);
        let mut cursor = 0usize;
        self.for_each(|o| {
            dst[o * elem..(o + 1) * elem].copy_from_slice(&data[cursor..cursor + elem]);
            cursor += elem;
        });
    }
}

/// Immutable per-peer plan table, sorted by peer rank.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferPlan {
    peers: Vec<(usize, PeerPlan)>,
}

impl TransferPlan {
    /// Build from `(peer, offsets)` pairs; empty offset lists are dropped.
    pub fn from_peer_offsets(mut entries: Vec<(usize, Vec<usize>)>) -> Self {
        entries.retain(|(_, offs)| !offs.is_empty());
        entries.sort_by_key(|(peer, _)| *peer);
        TransferPlan {
            peers: entries
                .into_iter()
                .map(|(peer, offs)| (peer, PeerPlan::from_offsets(offs)))
                .collect(),
        }
    }

    /// Iterate `(peer, plan)` in ascending peer order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PeerPlan)> {
        self.peers.iter().map(|(p, plan)| (*p, plan))
    }

    /// Plan for one peer, if any elements move between us.
    pub fn for_peer(&self, peer: usize) -> Option<&PeerPlan> {
        self.peers
            .binary_search_by_key(&peer, |(p, _)| *p)
            .ok()
            .map(|i| &self.peers[i].1)
    }

    /// Total elements across all peers.
    pub fn total_len(&self) -> usize {
        self.peers.iter().map(|(_, p)| p.len()).sum()
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }
}
