//! Flow-controlled generalized all-to-all.
//!
//! [`swapm`] behaves like an `MPI_Alltoallw` over the union communicator
//! (one optional message per peer pair, arbitrary per-peer sizes) while
//! bounding the number of concurrently outstanding non-blocking requests.
//! Every actual data movement in the crate goes through here.
//!
//! The schedule visits peers in `ceil2(n) - 1` rounds using the XOR pairing
//! from [`crate::index::pair`]; at step `s` rank `k` talks to `(s+1) ^ k`,
//! and both sides of a pair agree on the step, so receives can always be
//! posted before the matching send is issued.

use std::collections::VecDeque;

use log::trace;

use crate::comm::{CommTag, Communicator, Wait};
use crate::error::PioError;
use crate::index::{ceil2, pair};

/// Sentinel: keep the throttled code path but let the whole schedule stay
/// outstanding at once.
pub const UNLIMITED_PEND_REQ: usize = usize::MAX;

/// Read-only flow-control policy for one [`swapm`] invocation.
///
/// `max_pend_req == 0` means "no throttling": delegate to a plain
/// post-everything all-to-all, ignoring `handshake` and `isend`.
/// [`UNLIMITED_PEND_REQ`] keeps the round-based path with an unbounded
/// window. Results are identical either way; only scheduling differs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowControl {
    /// Cap on concurrently outstanding receive requests (see above for the
    /// two unlimited spellings).
    pub max_pend_req: usize,
    /// Exchange a one-word ready token so a sender never issues its send
    /// before the matching receive is posted.
    pub handshake: bool,
    /// Use non-blocking sends, drained collectively at the end.
    pub isend: bool,
}

impl Default for FlowControl {
    fn default() -> Self {
        FlowControl {
            max_pend_req: 64,
            handshake: true,
            isend: false,
        }
    }
}

impl FlowControl {
    /// No throttling: delegate to the plain all-to-all path.
    pub fn unthrottled() -> Self {
        FlowControl {
            max_pend_req: 0,
            handshake: false,
            isend: false,
        }
    }
}

const READY_TOKEN: [u8; 4] = 1u32.to_le_bytes();

struct PendingRecv<H> {
    peer: usize,
    handle: H,
    scratch: Vec<u8>,
}

/// Exchange one optional message with every peer.
///
/// `sends[p]` is the payload for rank `p` (empty = nothing to send);
/// `recvs[p]` must be pre-sized to the exact number of bytes expected from
/// rank `p` (empty = nothing expected). Both slices must have one entry per
/// rank of `comm`. The call returns once every transfer it initiated has
/// completed; `recvs` is fully populated on success.
///
/// The handshake stream uses `tag + 1`, so each invocation owns the tag
/// range `[tag, tag + 1]`.
pub fn swapm<C: Communicator>(
    comm: &C,
    sends: &[Vec<u8>],
    recvs: &mut [Vec<u8>],
    fc: FlowControl,
    tag: CommTag,
) -> Result<(), PioError> {
    let n = comm.size();
    let rank = comm.rank();
    if sends.len() != n || recvs.len() != n {
        return Err(PioError::invalid(format!(
            "swapm buffers must have one entry per rank: got {}/{} for {n} ranks",
            sends.len(),
            recvs.len()
        )));
    }

    // Self-to-self data moves first, without touching the communicator.
    if !sends[rank].is_empty() || !recvs[rank].is_empty() {
        if sends[rank].len() != recvs[rank].len() {
            return Err(PioError::comm(
                rank,
                format!(
                    "self transfer size mismatch: sending {} bytes into a {}-byte buffer",
                    sends[rank].len(),
                    recvs[rank].len()
                ),
            ));
        }
        let (src, dst) = (&sends[rank], &mut recvs[rank]);
        dst.copy_from_slice(src);
    }

    if n == 1 {
        return Ok(());
    }

    // Active steps: XOR schedule minus self and zero-count pairs.
    let mut swapids = Vec::with_capacity(n - 1);
    for step in 0..ceil2(n) - 1 {
        if let Some(p) = pair(n, step, rank) {
            if p != rank && (!sends[p].is_empty() || !recvs[p].is_empty()) {
                swapids.push(p);
            }
        }
    }
    let nsteps = swapids.len();
    if nsteps == 0 {
        return Ok(());
    }

    // `max_pend_req == 0` delegates to the unthrottled all-to-all: post every
    // receive, then every send, wait for the lot.
    let (maxreq, handshake, isend) = if fc.max_pend_req == 0 {
        (nsteps, false, true)
    } else if fc.max_pend_req == UNLIMITED_PEND_REQ || nsteps == 1 {
        (nsteps, fc.handshake, fc.isend)
    } else {
        (fc.max_pend_req.min(nsteps), fc.handshake, fc.isend)
    };
    trace!(
        "swapm rank {rank}: {nsteps} active steps, window {maxreq}, handshake {handshake}, isend {isend}"
    );

    let data_tag = tag.as_u16();
    let hs_tag = tag.offset(1).as_u16();

    let mut pending: VecDeque<PendingRecv<C::RecvHandle>> = VecDeque::new();
    let mut send_handles: Vec<(usize, C::SendHandle)> = Vec::new();
    let mut posted = 0usize;
    let recv_sizes: Vec<usize> = recvs.iter().map(|v| v.len()).collect();

    // Post the receive (and its ready token) for local step `i`.
    let post_step = |i: usize, pending: &mut VecDeque<PendingRecv<C::RecvHandle>>| {
        let peer = swapids[i];
        if recv_sizes[peer] > 0 {
            let mut scratch = vec![0u8; recv_sizes[peer]];
            let handle = comm.irecv(peer, data_tag, &mut scratch);
            pending.push_back(PendingRecv {
                peer,
                handle,
                scratch,
            });
            if handshake {
                // the matching receive is posted; tell the sender
                comm.isend(peer, hs_tag, &READY_TOKEN).wait();
            }
        }
    };

    for i in 0..nsteps {
        // The receive for step i must be posted before this round's send,
        // recycling the oldest slot whenever the window is full.
        while posted <= i {
            if pending.len() >= maxreq {
                complete_oldest(&mut pending, recvs)?;
            }
            post_step(posted, &mut pending);
            posted += 1;
        }
        // Keep the window full so later rounds find their receives posted.
        while posted < nsteps && pending.len() < maxreq {
            post_step(posted, &mut pending);
            posted += 1;
        }

        let peer = swapids[i];
        if !sends[peer].is_empty() {
            if handshake {
                let mut token = [0u8; 4];
                comm.irecv(peer, hs_tag, &mut token).wait();
            }
            if isend {
                send_handles.push((peer, comm.isend(peer, data_tag, &sends[peer])));
            } else {
                comm.isend(peer, data_tag, &sends[peer]).wait();
            }
        }
    }

    // Termination: wait on every outstanding receive, then every send.
    while !pending.is_empty() {
        complete_oldest(&mut pending, recvs)?;
    }
    for (_, h) in send_handles {
        h.wait();
    }
    Ok(())
}

/// Wait on the oldest outstanding receive and land its bytes in `recvs`.
fn complete_oldest<H: Wait>(
    pending: &mut VecDeque<PendingRecv<H>>,
    recvs: &mut [Vec<u8>],
) -> Result<(), PioError> {
    let pr = pending.pop_front().expect("complete_oldest on empty queue");
    let expected = recvs[pr.peer].len();
    match pr.handle.wait() {
        Some(data) => {
            if data.len() != expected {
                return Err(PioError::comm(
                    pr.peer,
                    format!("expected {expected} bytes, received {}", data.len()),
                ));
            }
            recvs[pr.peer].copy_from_slice(&data);
        }
        // Backend wrote in place; scratch holds the payload.
        None => recvs[pr.peer].copy_from_slice(&pr.scratch),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalComm, NoComm};
    use serial_test::serial;

    #[test]
    fn single_rank_self_copy() {
        let comm = NoComm;
        let sends = vec![vec![1u8, 2, 3]];
        let mut recvs = vec![vec![0u8; 3]];
        swapm(&comm, &sends, &mut recvs, FlowControl::default(), CommTag::new(10)).unwrap();
        assert_eq!(recvs[0], vec![1, 2, 3]);
    }

    #[test]
    fn self_size_mismatch_is_error() {
        let comm = NoComm;
        let sends = vec![vec![1u8, 2, 3]];
        let mut recvs = vec![vec![0u8; 2]];
        let err = swapm(&comm, &sends, &mut recvs, FlowControl::default(), CommTag::new(10));
        assert!(matches!(err, Err(PioError::Comm { peer: 0, .. })));
    }

    #[test]
    fn wrong_buffer_count_is_rejected() {
        let comm = NoComm;
        let sends = vec![vec![], vec![]];
        let mut recvs = vec![vec![]];
        assert!(matches!(
            swapm(&comm, &sends, &mut recvs, FlowControl::default(), CommTag::new(10)),
            Err(PioError::InvalidArguments(_))
        ));
    }

    /// Each rank sends `[rank, peer]` to every peer; verify all arrivals.
    fn exchange_all(nranks: usize, fc: FlowControl, tag: CommTag) -> Vec<Vec<Vec<u8>>> {
        std::thread::scope(|s| {
            let mut joins = Vec::new();
            for rank in 0..nranks {
                joins.push(s.spawn(move || {
                    let comm = LocalComm::new(rank, nranks);
                    let sends: Vec<Vec<u8>> = (0..nranks)
                        .map(|p| vec![rank as u8, p as u8])
                        .collect();
                    let mut recvs: Vec<Vec<u8>> = (0..nranks).map(|_| vec![0u8; 2]).collect();
                    swapm(&comm, &sends, &mut recvs, fc, tag).unwrap();
                    recvs
                }));
            }
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        })
    }

    #[test]
    #[serial]
    fn four_ranks_full_exchange() {
        LocalComm::reset_mailbox();
        let got = exchange_all(4, FlowControl::default(), CommTag::new(20));
        for (rank, recvs) in got.iter().enumerate() {
            for (p, msg) in recvs.iter().enumerate() {
                assert_eq!(msg, &vec![p as u8, rank as u8]);
            }
        }
    }

    #[test]
    #[serial]
    fn window_of_one_matches_unthrottled() {
        LocalComm::reset_mailbox();
        let tight = FlowControl {
            max_pend_req: 1,
            handshake: true,
            isend: true,
        };
        let a = exchange_all(4, tight, CommTag::new(22));
        LocalComm::reset_mailbox();
        let b = exchange_all(4, FlowControl::unthrottled(), CommTag::new(24));
        assert_eq!(a, b);
    }
}
