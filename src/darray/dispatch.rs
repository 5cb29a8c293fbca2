//! Seam to the (out-of-scope) file-format layer.
//!
//! The darray orchestration hands each io task's regions to a [`Dispatch`]
//! implementation; HDF5/PnetCDF/classic encoders live behind this trait in a
//! full deployment. [`MemDispatch`] is the in-crate backend: an in-memory
//! variable store shared across ranks, used by the test suites and as a
//! serial fallback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::PioError;
use crate::index::coord_to_index;

/// Format-specific write/read entry points, region-at-a-time.
///
/// `start`/`count` describe one contiguous region in the variable's
/// non-record dimensions; `frame` selects the record (slowest, unlimited)
/// dimension when the variable has one. `data` is row-major for the region,
/// `elem` bytes per element.
pub trait Dispatch: Send {
    fn put_vara(
        &mut self,
        varid: i32,
        frame: Option<usize>,
        start: &[i64],
        count: &[i64],
        elem: usize,
        data: &[u8],
    ) -> Result<(), PioError>;

    fn get_vara(
        &mut self,
        varid: i32,
        frame: Option<usize>,
        start: &[i64],
        count: &[i64],
        elem: usize,
        data: &mut [u8],
    ) -> Result<(), PioError>;

    /// Flush format-level buffers.
    fn sync(&mut self) -> Result<(), PioError>;
}

struct MemVar {
    gdims: Vec<i64>,
    elem: usize,
    /// One flat buffer per frame; frame-less variables use key 0.
    frames: HashMap<usize, Vec<u8>>,
}

/// In-memory [`Dispatch`] backend.
///
/// Clones share one store, so every "rank" of an in-process run sees the
/// same file, the way ranks of an MPI job share one file on disk. Variables
/// must be defined before the first darray call against them.
#[derive(Clone, Default)]
pub struct MemDispatch {
    store: Arc<Mutex<HashMap<i32, MemVar>>>,
}

impl MemDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a variable over the given non-record dimensions.
    pub fn define_var(&self, varid: i32, gdims: &[i64], elem: usize) {
        let mut store = self.store.lock().unwrap();
        store.insert(
            varid,
            MemVar {
                gdims: gdims.to_vec(),
                elem,
                frames: HashMap::new(),
            },
        );
    }

    /// Full contents of one variable frame, for assertions.
    pub fn frame_data(&self, varid: i32, frame: Option<usize>) -> Option<Vec<u8>> {
        let store = self.store.lock().unwrap();
        let var = store.get(&varid)?;
        var.frames.get(&frame.unwrap_or(0)).cloned()
    }

    fn with_var<R>(
        &self,
        varid: i32,
        frame: Option<usize>,
        f: impl FnOnce(&[i64], usize, &mut Vec<u8>) -> Result<R, PioError>,
    ) -> Result<R, PioError> {
        let mut store = self.store.lock().unwrap();
        let var = store
            .get_mut(&varid)
            .ok_or_else(|| PioError::Dispatch(format!("variable {varid} not defined")))?;
        let gsize: i64 = var.gdims.iter().product();
        let bytes = gsize as usize * var.elem;
        let gdims = var.gdims.clone();
        let elem = var.elem;
        let buf = var
            .frames
            .entry(frame.unwrap_or(0))
            .or_insert_with(|| vec![0u8; bytes]);
        f(&gdims, elem, buf)
    }
}

/// Walk the region's elements in row-major order, yielding flat indices.
fn for_each_flat(
    gdims: &[i64],
    start: &[i64],
    count: &[i64],
    mut f: impl FnMut(usize, i64) -> Result<(), PioError>,
) -> Result<(), PioError> {
    let ndims = gdims.len();
    if start.len() != ndims || count.len() != ndims {
        return Err(PioError::Dispatch(format!(
            "region rank {} does not match variable rank {ndims}",
            start.len()
        )));
    }
    let total: i64 = count.iter().product();
    let mut coord = vec![0i64; ndims];
    for k in 0..total {
        let mut rem = k;
        for d in (0..ndims).rev() {
            coord[d] = start[d] + rem % count[d];
            rem /= count[d];
        }
        f(k as usize, coord_to_index(gdims, &coord))?;
    }
    Ok(())
}

impl Dispatch for MemDispatch {
    fn put_vara(
        &mut self,
        varid: i32,
        frame: Option<usize>,
        start: &[i64],
        count: &[i64],
        elem: usize,
        data: &[u8],
    ) -> Result<(), PioError> {
        self.with_var(varid, frame, |gdims, var_elem, buf| {
            if elem != var_elem {
                return Err(PioError::Dispatch(format!(
                    "element size {elem} does not match defined size {var_elem}"
                )));
            }
            for_each_flat(gdims, start, count, |k, flat| {
                let flat = flat as usize;
                buf[flat * elem..(flat + 1) * elem]
                    .copy_from_slice(&data[k * elem..(k + 1) * elem]);
                Ok(())
            })
        })
    }

    fn get_vara(
        &mut self,
        varid: i32,
        frame: Option<usize>,
        start: &[i64],
        count: &[i64],
        elem: usize,
        data: &mut [u8],
    ) -> Result<(), PioError> {
        self.with_var(varid, frame, |gdims, var_elem, buf| {
            if elem != var_elem {
                return Err(PioError::Dispatch(format!(
                    "element size {elem} does not match defined size {var_elem}"
                )));
            }
            for_each_flat(gdims, start, count, |k, flat| {
                let flat = flat as usize;
                data[k * elem..(k + 1) * elem]
                    .copy_from_slice(&buf[flat * elem..(flat + 1) * elem]);
                Ok(())
            })
        })
    }

    fn sync(&mut self) -> Result<(), PioError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_region_roundtrip() {
        let mut d = MemDispatch::new();
        d.define_var(1, &[4, 4], 4);
        let data: Vec<u8> = bytemuck::cast_slice(&[7i32, 8, 9, 10]).to_vec();
        // 2x2 block at (1,1)
        d.put_vara(1, None, &[1, 1], &[2, 2], 4, &data).unwrap();
        let mut out = vec![0u8; 16];
        d.get_vara(1, None, &[1, 1], &[2, 2], 4, &mut out).unwrap();
        assert_eq!(out, data);

        // the block landed at flat indices 5, 6, 9, 10
        let full = d.frame_data(1, None).unwrap();
        let ints: Vec<i32> = bytemuck::pod_collect_to_vec(&full);
        assert_eq!(ints[5], 7);
        assert_eq!(ints[6], 8);
        assert_eq!(ints[9], 9);
        assert_eq!(ints[10], 10);
        assert_eq!(ints[0], 0);
    }

    #[test]
    fn frames_are_independent() {
        let mut d = MemDispatch::new();
        d.define_var(2, &[2], 4);
        d.put_vara(2, Some(0), &[0], &[1], 4, &1i32.to_ne_bytes()).unwrap();
        d.put_vara(2, Some(1), &[0], &[1], 4, &2i32.to_ne_bytes()).unwrap();
        let f0: Vec<i32> = bytemuck::pod_collect_to_vec(&d.frame_data(2, Some(0)).unwrap());
        let f1: Vec<i32> = bytemuck::pod_collect_to_vec(&d.frame_data(2, Some(1)).unwrap());
        assert_eq!(f0, vec![1, 0]);
        assert_eq!(f1, vec![2, 0]);
    }

    #[test]
    fn undefined_variable_is_dispatch_error() {
        let mut d = MemDispatch::new();
        let err = d.put_vara(9, None, &[0], &[1], 1, &[0]);
        assert!(matches!(err, Err(PioError::Dispatch(_))));
    }
}
