//! Data movers: one flow-controlled collective per direction, driven by the
//! per-peer plans built at decomposition-creation time.
//!
//! `comp2io` may carry several pending variables in one transfer to amortize
//! setup cost: each peer message is `nvars` plan-ordered sections back to
//! back. `io2comp` moves a single variable; compute-side holes keep whatever
//! the caller put in the buffer (typically a fill value).

use crate::comm::swapm::{FlowControl, swapm};
use crate::comm::{CommTag, Communicator};
use crate::decomp::IoDesc;
use crate::error::PioError;

fn check_len(name: &str, got: usize, want: usize) -> Result<(), PioError> {
    if got != want {
        return Err(PioError::invalid(format!(
            "{name} buffer holds {got} bytes, expected {want}"
        )));
    }
    Ok(())
}

/// Move `nvars` variables' worth of compute data into the io-task layout.
///
/// `sbuf` holds `nvars` back-to-back variables of `ndof` elements each;
/// `rbuf` receives `nvars` back-to-back variables of `llen` elements each
/// (untouched on pure compute tasks, where `llen == 0`). Io-side holes are
/// not written; pre-fill `rbuf` if they must carry a fill value.
pub fn rearrange_comp2io<C: Communicator>(
    comm: &C,
    iodesc: &IoDesc,
    sbuf: &[u8],
    elem: usize,
    nvars: usize,
    rbuf: &mut [u8],
    fc: FlowControl,
    tag: CommTag,
) -> Result<(), PioError> {
    check_len("send", sbuf.len(), iodesc.ndof * elem * nvars)?;
    check_len("recv", rbuf.len(), iodesc.llen * elem * nvars)?;
    let n = comm.size();

    let mut sends: Vec<Vec<u8>> = vec![Vec::new(); n];
    for (peer, plan) in iodesc.comp_plan.iter() {
        let mut out = Vec::with_capacity(plan.len() * elem * nvars);
        for v in 0..nvars {
            let var = &sbuf[v * iodesc.ndof * elem..(v + 1) * iodesc.ndof * elem];
            plan.pack(elem, var, &mut out);
        }
        sends[peer] = out;
    }

    let mut recvs: Vec<Vec<u8>> = vec![Vec::new(); n];
    for (peer, plan) in iodesc.io_plan.iter() {
        recvs[peer] = vec![0u8; plan.len() * elem * nvars];
    }

    swapm(comm, &sends, &mut recvs, fc, tag)?;

    for (peer, plan) in iodesc.io_plan.iter() {
        let section = plan.len() * elem;
        for v in 0..nvars {
            let chunk = &recvs[peer][v * section..(v + 1) * section];
            let var = &mut rbuf[v * iodesc.llen * elem..(v + 1) * iodesc.llen * elem];
            plan.unpack(elem, chunk, var);
        }
    }
    Ok(())
}

/// Move io-task data back into the compute layout (single variable).
///
/// Compute map holes receive nothing; the caller pre-fills `rbuf` with the
/// fill value when sparse decompositions matter.
pub fn rearrange_io2comp<C: Communicator>(
    comm: &C,
    iodesc: &IoDesc,
    sbuf: &[u8],
    elem: usize,
    rbuf: &mut [u8],
    fc: FlowControl,
    tag: CommTag,
) -> Result<(), PioError> {
    check_len("send", sbuf.len(), iodesc.llen * elem)?;
    check_len("recv", rbuf.len(), iodesc.ndof * elem)?;
    let n = comm.size();

    let mut sends: Vec<Vec<u8>> = vec![Vec::new(); n];
    for (peer, plan) in iodesc.io_plan.iter() {
        let mut out = Vec::with_capacity(plan.len() * elem);
        plan.pack(elem, sbuf, &mut out);
        sends[peer] = out;
    }

    let mut recvs: Vec<Vec<u8>> = vec![Vec::new(); n];
    for (peer, plan) in iodesc.comp_plan.iter() {
        recvs[peer] = vec![0u8; plan.len() * elem];
    }

    swapm(comm, &sends, &mut recvs, fc, tag)?;

    for (peer, plan) in iodesc.comp_plan.iter() {
        plan.unpack(elem, &recvs[peer], rbuf);
    }
    Ok(())
}
