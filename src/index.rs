//! Index math shared by the region finder and the rearrangers.
//!
//! Global arrays are row-major with the **last** dimension varying fastest;
//! all conversions here follow that convention.

use crate::error::PioError;

/// Greatest common divisor of two non-negative offsets.
pub fn gcd(mut a: i64, mut b: i64) -> i64 {
    debug_assert!(a >= 0 && b >= 0);
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// GCD over an array of offsets, with an early exit once it collapses to 1.
pub fn lgcd_array(arr: &[i64]) -> i64 {
    let mut bsize = match arr.first() {
        Some(&v) => v,
        None => return 0,
    };
    for &v in &arr[1..] {
        if bsize == 1 {
            break;
        }
        bsize = gcd(bsize, v);
    }
    bsize
}

/// Greatest common divisor of the lengths of maximal consecutive runs in a
/// strictly increasing index array.
///
/// Used as a cheap pre-pass: if every run in a task's map has the same block
/// length, the whole map collapses to one uniform-stride block instead of
/// many singleton regions.
///
/// Returns 0 for an empty array.
pub fn gcd_blocksize(arr: &[i64]) -> i64 {
    if arr.is_empty() {
        return 0;
    }
    let mut blocksize = 0i64;
    let mut runlen = 1i64;
    for w in arr.windows(2) {
        if w[1] == w[0] + 1 {
            runlen += 1;
        } else {
            blocksize = gcd(blocksize, runlen);
            runlen = 1;
            if blocksize == 1 {
                return 1;
            }
        }
    }
    gcd(blocksize, runlen)
}

/// Smallest power of two greater than or equal to `i`.
///
/// `ceil2(1) == 1`, `ceil2(5) == 8`, `ceil2(8) == 8`.
pub fn ceil2(i: usize) -> usize {
    debug_assert!(i >= 1);
    i.next_power_of_two()
}

/// Exchange partner of rank `k` at step `p` of a pairwise all-to-all over
/// `np` ranks: `(p + 1) XOR k`, or `None` when that lands outside the
/// communicator.
///
/// Symmetric per step: `pair(np, p, k) == Some(q)` implies
/// `pair(np, p, q) == Some(k)`.
pub fn pair(np: usize, p: usize, k: usize) -> Option<usize> {
    debug_assert!(np >= 1);
    let q = (p + 1) ^ k;
    if q >= np { None } else { Some(q) }
}

/// Convert a flat global index into per-dimension coordinates.
pub fn index_to_coord(gdims: &[i64], mut idx: i64, coord: &mut [i64]) {
    debug_assert_eq!(gdims.len(), coord.len());
    for (d, &g) in gdims.iter().enumerate().rev() {
        coord[d] = idx % g;
        idx /= g;
    }
    debug_assert_eq!(idx, 0, "index out of range for gdims");
}

/// Convert per-dimension coordinates back into a flat global index.
pub fn coord_to_index(gdims: &[i64], coord: &[i64]) -> i64 {
    debug_assert_eq!(gdims.len(), coord.len());
    let mut idx = 0i64;
    for (d, &c) in coord.iter().enumerate() {
        debug_assert!(c >= 0 && c < gdims[d]);
        idx = idx * gdims[d] + c;
    }
    idx
}

/// Product of the global dimension lengths, rejecting empty or non-positive
/// dimension arrays before any communicator activity.
pub fn global_size(gdims: &[i64]) -> Result<i64, PioError> {
    if gdims.is_empty() {
        return Err(PioError::invalid("gdims must not be empty"));
    }
    let mut gsize = 1i64;
    for (d, &g) in gdims.iter().enumerate() {
        if g <= 0 {
            return Err(PioError::invalid(format!(
                "gdims[{d}] = {g}, dimensions must be positive"
            )));
        }
        gsize = gsize.checked_mul(g).ok_or_else(|| {
            PioError::invalid("product of global dimensions overflows i64")
        })?;
    }
    Ok(gsize)
}
