//! Distributed-array write/read orchestration.
//!
//! Writes accumulate into a per-(file, decomposition) multi-variable buffer
//! and move in bulk: one flow-controlled rearrangement for all pending
//! variables, then one dispatch call per (region, variable) on the io tasks.
//! The buffer walks `Unbuffered → Buffered → Flushed`; flushes trigger on an
//! explicit sync/close, on `flush_to_disk`, or when the accumulated bytes
//! pass the context's limit. The limit check is agreed over the communicator
//! each write, since ndof is uneven across ranks and a flush is collective.
//!
//! `Parallel` files let every io task call the dispatch layer directly;
//! `Serial` files funnel all io-task payloads through the io root first, for
//! formats without native parallel write support.

pub mod dispatch;

use std::collections::BTreeMap;

use bytemuck::Pod;
use log::{debug, trace};

use crate::comm::swapm::{FlowControl, swapm};
use crate::comm::{Communicator, Wait, tags};
use crate::error::PioError;
use crate::iosystem::PioContext;
use crate::rearrange::{rearrange_comp2io, rearrange_io2comp};
use crate::region::Region;
use dispatch::Dispatch;

/// How flushed io-task data reaches the dispatch layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Every io task writes its own regions (parallel HDF5/PnetCDF path).
    Parallel,
    /// All io-task data funnels through the io root before the dispatch
    /// call (classic-format path).
    Serial,
}

/// Darray buffer lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    Unbuffered,
    Buffered,
    Flushed,
}

struct PendingVar {
    varid: i32,
    frame: Option<usize>,
    fill: Option<Vec<u8>>,
    data: Vec<u8>,
}

/// Accumulated writes for one decomposition in one file.
struct VarBuffer {
    state: BufferState,
    elem: usize,
    vars: Vec<PendingVar>,
    bytes: usize,
}

impl VarBuffer {
    fn new(elem: usize) -> Self {
        VarBuffer {
            state: BufferState::Unbuffered,
            elem,
            vars: Vec::new(),
            bytes: 0,
        }
    }
}

/// An open file: the dispatch backend plus its darray buffers.
pub struct FileHandle {
    dispatch: Box<dyn Dispatch>,
    mode: WriteMode,
    buffers: BTreeMap<i32, VarBuffer>,
}

impl FileHandle {
    pub fn new(dispatch: Box<dyn Dispatch>, mode: WriteMode) -> Self {
        FileHandle {
            dispatch,
            mode,
            buffers: BTreeMap::new(),
        }
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// True when writes for `ioid` sit in the buffer, not yet flushed.
    pub fn has_buffered(&self, ioid: i32) -> bool {
        self.buffers
            .get(&ioid)
            .is_some_and(|b| b.state == BufferState::Buffered)
    }

    /// Current lifecycle state of the buffer for `ioid`.
    pub fn buffer_state(&self, ioid: i32) -> BufferState {
        self.buffers
            .get(&ioid)
            .map_or(BufferState::Unbuffered, |b| b.state)
    }
}

impl<C: Communicator> PioContext<C> {
    /// Buffer one variable's distributed data for writing.
    ///
    /// `buf` holds this task's `ndof` elements in compute-map order;
    /// `fillvalue` pads io-side holes of sparse decompositions. The write
    /// lands in the dispatch layer at the next flush.
    pub fn write_darray<T: Pod>(
        &mut self,
        ncid: i32,
        varid: i32,
        ioid: i32,
        frame: Option<usize>,
        buf: &[T],
        fillvalue: Option<T>,
    ) -> Result<(), PioError> {
        self.write_darray_multi(ncid, &[varid], ioid, &[frame], buf, &[fillvalue], false)
    }

    /// Buffer several variables sharing one decomposition.
    ///
    /// `buf` concatenates `varids.len()` variables of `ndof` elements each;
    /// `frames[i]` and `fillvalues[i]` belong to `varids[i]`. With
    /// `flush_to_disk` the data moves immediately instead of waiting for
    /// the buffer limit.
    pub fn write_darray_multi<T: Pod>(
        &mut self,
        ncid: i32,
        varids: &[i32],
        ioid: i32,
        frames: &[Option<usize>],
        buf: &[T],
        fillvalues: &[Option<T>],
        flush_to_disk: bool,
    ) -> Result<(), PioError> {
        let nvars = varids.len();
        if nvars == 0 || frames.len() != nvars || fillvalues.len() != nvars {
            return Err(PioError::invalid(
                "varids, frames, and fillvalues must have equal, non-zero length",
            ));
        }
        let elem = size_of::<T>();
        let rank = self.comm.rank();
        let ndof = self.decomp(ioid)?.ndof;
        if buf.len() != ndof * nvars {
            return Err(PioError::invalid(format!(
                "write buffer holds {} elements, expected {} ({} vars of ndof {})",
                buf.len(),
                ndof * nvars,
                nvars,
                ndof
            )));
        }
        let limit = self.buffer_limit;
        let file = self.file_mut(ncid)?;
        let vb = file.buffers.entry(ioid).or_insert_with(|| VarBuffer::new(elem));
        if vb.elem != elem {
            return Err(PioError::invalid(format!(
                "decomposition {ioid} already buffers {}-byte elements, got {elem}",
                vb.elem
            )));
        }
        for (v, &varid) in varids.iter().enumerate() {
            let data = bytemuck::cast_slice(&buf[v * ndof..(v + 1) * ndof]).to_vec();
            vb.bytes += data.len();
            vb.vars.push(PendingVar {
                varid,
                frame: frames[v],
                fill: fillvalues[v].map(|f| bytemuck::bytes_of(&f).to_vec()),
                data,
            });
        }
        vb.state = BufferState::Buffered;
        trace!(
            "rank {rank}: buffered {nvars} vars for file {ncid} decomp {ioid} ({} bytes pending)",
            vb.bytes
        );

        // The limit check is rank-local (ndof differs across ranks), but a
        // flush runs a collective rearrangement, so every rank must agree
        // before anyone enters it.
        let wants_flush = flush_to_disk || vb.bytes >= limit;
        if any_rank_flushing(&self.comm, wants_flush, self.fc)? {
            self.flush_buffer(ncid, ioid)?;
        }
        Ok(())
    }

    /// Move one (file, decomposition) buffer through the data mover and the
    /// dispatch layer; collective.
    pub fn flush_buffer(&mut self, ncid: i32, ioid: i32) -> Result<(), PioError> {
        let desc = self.decomps.get(&ioid).ok_or(PioError::BadIoid(ioid))?;
        let file = self.files.get_mut(&ncid).ok_or(PioError::BadNcid(ncid))?;
        let Some(vb) = file.buffers.get_mut(&ioid) else {
            return Ok(());
        };
        if vb.vars.is_empty() {
            return Ok(());
        }
        let vars = std::mem::take(&mut vb.vars);
        let elem = vb.elem;
        vb.bytes = 0;
        let nvars = vars.len();
        debug!(
            "rank {}: flushing {nvars} vars for file {ncid} decomp {ioid}",
            self.comm.rank()
        );

        let mut sbuf = Vec::with_capacity(nvars * desc.ndof * elem);
        for pv in &vars {
            sbuf.extend_from_slice(&pv.data);
        }

        // Pre-pad holes so sparse decompositions write the fill value.
        let mut iobuf = vec![0u8; desc.llen * elem * nvars];
        for (v, pv) in vars.iter().enumerate() {
            if let Some(fill) = &pv.fill {
                let section = &mut iobuf[v * desc.llen * elem..(v + 1) * desc.llen * elem];
                for &h in &desc.holes {
                    section[h * elem..(h + 1) * elem].copy_from_slice(fill);
                }
            }
        }

        rearrange_comp2io(
            &self.comm,
            desc,
            &sbuf,
            elem,
            nvars,
            &mut iobuf,
            self.fc,
            tags::DARRAY_DATA,
        )?;

        match file.mode {
            WriteMode::Parallel => write_multi_par(
                &mut *file.dispatch,
                desc.llen,
                &desc.io_regions,
                &vars,
                elem,
                &iobuf,
            )?,
            WriteMode::Serial => write_multi_serial(
                &self.comm,
                &self.ios,
                &mut *file.dispatch,
                desc.llen,
                &desc.io_regions,
                &vars,
                elem,
                &iobuf,
            )?,
        }
        if let Some(vb) = file.buffers.get_mut(&ioid) {
            vb.state = BufferState::Flushed;
        }
        Ok(())
    }

    /// Read one variable's distributed data; collective.
    ///
    /// Pending writes against the decomposition are flushed first. Only
    /// mapped elements of `buf` are written; compute-map holes keep their
    /// prior contents.
    pub fn read_darray<T: Pod>(
        &mut self,
        ncid: i32,
        varid: i32,
        ioid: i32,
        frame: Option<usize>,
        buf: &mut [T],
    ) -> Result<(), PioError> {
        if self.file(ncid)?.has_buffered(ioid) {
            self.flush_buffer(ncid, ioid)?;
        }
        let desc = self.decomps.get(&ioid).ok_or(PioError::BadIoid(ioid))?;
        let file = self.files.get_mut(&ncid).ok_or(PioError::BadNcid(ncid))?;
        let elem = size_of::<T>();
        if buf.len() != desc.ndof {
            return Err(PioError::invalid(format!(
                "read buffer holds {} elements, expected ndof {}",
                buf.len(),
                desc.ndof
            )));
        }

        let mut iobuf = vec![0u8; desc.llen * elem];
        if desc.llen > 0 {
            let mut reg_off = 0usize;
            for region in &desc.io_regions {
                let rlen = region.len();
                file.dispatch.get_vara(
                    varid,
                    frame,
                    &region.start,
                    &region.count,
                    elem,
                    &mut iobuf[reg_off * elem..(reg_off + rlen) * elem],
                )?;
                reg_off += rlen;
            }
        }

        rearrange_io2comp(
            &self.comm,
            desc,
            &iobuf,
            elem,
            bytemuck::cast_slice_mut(buf),
            self.fc,
            tags::DARRAY_DATA,
        )
    }

    /// Flush every buffer of a file and sync the dispatch layer; collective.
    pub fn sync_file(&mut self, ncid: i32) -> Result<(), PioError> {
        let ioids: Vec<i32> = self.file(ncid)?.buffers.keys().copied().collect();
        for ioid in ioids {
            self.flush_buffer(ncid, ioid)?;
        }
        let rank = self.comm.rank();
        let ios = self.ios.clone();
        let file = self.files.get_mut(&ncid).ok_or(PioError::BadNcid(ncid))?;
        let should_sync = match file.mode {
            WriteMode::Parallel => ios.is_io_task(rank),
            WriteMode::Serial => rank == ios.io_root(),
        };
        if should_sync {
            file.dispatch.sync()?;
        }
        Ok(())
    }

    /// Sync, then drop the file from the registry; collective.
    pub fn close_file(&mut self, ncid: i32) -> Result<(), PioError> {
        self.sync_file(ncid)?;
        self.take_file(ncid)?;
        Ok(())
    }
}

/// Collective OR of each rank's flush request; every rank sees the same
/// answer, so the flush stays collective even when only one rank crossed
/// its limit.
fn any_rank_flushing<C: Communicator>(
    comm: &C,
    local: bool,
    fc: FlowControl,
) -> Result<bool, PioError> {
    let n = comm.size();
    if n == 1 {
        return Ok(local);
    }
    let sends = vec![vec![local as u8]; n];
    let mut recvs = vec![vec![0u8; 1]; n];
    swapm(comm, &sends, &mut recvs, fc, tags::DARRAY_FLUSH)?;
    Ok(recvs.iter().any(|r| r[0] != 0))
}

/// Collective-parallel path: each io task writes its own regions.
fn write_multi_par(
    dispatch: &mut dyn Dispatch,
    llen: usize,
    regions: &[Region],
    vars: &[PendingVar],
    elem: usize,
    iobuf: &[u8],
) -> Result<(), PioError> {
    if llen == 0 {
        return Ok(());
    }
    let mut reg_off = 0usize;
    for region in regions {
        let rlen = region.len();
        for (v, pv) in vars.iter().enumerate() {
            let base = v * llen + reg_off;
            dispatch.put_vara(
                pv.varid,
                pv.frame,
                &region.start,
                &region.count,
                elem,
                &iobuf[base * elem..(base + rlen) * elem],
            )?;
        }
        reg_off += rlen;
    }
    Ok(())
}

// Serial-funnel wire layout, little-endian:
//   u32 nblocks, then per block:
//   i32 varid, i64 frame (-1 = none), u32 ndims,
//   ndims x i64 start, ndims x i64 count, u64 nbytes, payload.
fn encode_blocks(
    llen: usize,
    regions: &[Region],
    vars: &[PendingVar],
    elem: usize,
    iobuf: &[u8],
) -> Vec<u8> {
    let nblocks = if llen == 0 { 0 } else { regions.len() * vars.len() };
    let mut out = Vec::new();
    out.extend_from_slice(&(nblocks as u32).to_le_bytes());
    if llen == 0 {
        return out;
    }
    let mut reg_off = 0usize;
    for region in regions {
        let rlen = region.len();
        for (v, pv) in vars.iter().enumerate() {
            out.extend_from_slice(&pv.varid.to_le_bytes());
            out.extend_from_slice(&pv.frame.map_or(-1i64, |f| f as i64).to_le_bytes());
            out.extend_from_slice(&(region.start.len() as u32).to_le_bytes());
            for &s in &region.start {
                out.extend_from_slice(&s.to_le_bytes());
            }
            for &c in &region.count {
                out.extend_from_slice(&c.to_le_bytes());
            }
            let base = v * llen + reg_off;
            let data = &iobuf[base * elem..(base + rlen) * elem];
            out.extend_from_slice(&(data.len() as u64).to_le_bytes());
            out.extend_from_slice(data);
        }
        reg_off += rlen;
    }
    out
}

struct BlockReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BlockReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PioError> {
        let end = self.pos + n;
        let s = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| PioError::Dispatch("truncated serial-funnel message".into()))?;
        self.pos = end;
        Ok(s)
    }
    fn u32(&mut self) -> Result<u32, PioError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn i32(&mut self) -> Result<i32, PioError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> Result<i64, PioError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64, PioError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn replay_blocks(dispatch: &mut dyn Dispatch, elem: usize, msg: &[u8]) -> Result<(), PioError> {
    let mut r = BlockReader { buf: msg, pos: 0 };
    let nblocks = r.u32()?;
    for _ in 0..nblocks {
        let varid = r.i32()?;
        let frame = match r.i64()? {
            -1 => None,
            f => Some(f as usize),
        };
        let ndims = r.u32()? as usize;
        let mut start = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            start.push(r.i64()?);
        }
        let mut count = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            count.push(r.i64()?);
        }
        let nbytes = r.u64()? as usize;
        let data = r.take(nbytes)?;
        dispatch.put_vara(varid, frame, &start, &count, elem, data)?;
    }
    Ok(())
}

/// Serial path: io tasks funnel their blocks through the io root, which
/// replays them against the dispatch layer in ascending io-rank order.
fn write_multi_serial<C: Communicator>(
    comm: &C,
    ios: &crate::iosystem::IoSystem,
    dispatch: &mut dyn Dispatch,
    llen: usize,
    regions: &[Region],
    vars: &[PendingVar],
    elem: usize,
    iobuf: &[u8],
) -> Result<(), PioError> {
    let rank = comm.rank();
    let root = ios.io_root();
    let size_tag = tags::SERIAL_FUNNEL;
    let data_tag = size_tag.offset(1);

    if rank == root {
        // root's own regions first, then each other io task in rank order
        replay_blocks(dispatch, elem, &encode_blocks(llen, regions, vars, elem, iobuf))?;
        for peer in ios.io_ranks().filter(|&r| r != root) {
            let mut szbuf = [0u8; 8];
            let got = comm.irecv(peer, size_tag.as_u16(), &mut szbuf).wait();
            if let Some(data) = got {
                if data.len() != szbuf.len() {
                    return Err(PioError::comm(
                        peer,
                        format!("serial funnel size header: got {} bytes", data.len()),
                    ));
                }
                szbuf.copy_from_slice(&data);
            }
            let sz = u64::from_le_bytes(szbuf) as usize;
            let mut msg = vec![0u8; sz];
            if sz > 0 {
                if let Some(data) = comm.irecv(peer, data_tag.as_u16(), &mut msg).wait() {
                    if data.len() != sz {
                        return Err(PioError::comm(
                            peer,
                            format!("serial funnel expected {sz} bytes, got {}", data.len()),
                        ));
                    }
                    msg.copy_from_slice(&data);
                }
                replay_blocks(dispatch, elem, &msg)?;
            }
        }
    } else if ios.is_io_task(rank) {
        let msg = encode_blocks(llen, regions, vars, elem, iobuf);
        comm.isend(root, size_tag.as_u16(), &(msg.len() as u64).to_le_bytes())
            .wait();
        if !msg.is_empty() {
            comm.isend(root, data_tag.as_u16(), &msg).wait();
        }
    }
    Ok(())
}
