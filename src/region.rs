//! Maximal contiguous (start, count) runs within one task's local-to-global
//! index map.
//!
//! The map handed to these functions is the task's list of **0-based** global
//! indices, sorted ascending. [`find_region`] grabs the longest block
//! describable as a single `(start, count)` starting at the first unconsumed
//! offset, and [`get_regions`] repeats that until the map is exhausted.
//! Callers that need exact allocation run the two-phase protocol:
//! [`count_regions`] first, then [`get_regions`] into a vector of exactly
//! that length.

use crate::error::PioError;
use crate::index::{global_size, index_to_coord};

/// One contiguous run of global indices owned by a task.
///
/// Regions for a task never overlap, and concatenated in order they exactly
/// cover that task's local map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    /// Per-dimension starting coordinate.
    pub start: Vec<i64>,
    /// Per-dimension extent.
    pub count: Vec<i64>,
}

impl Region {
    /// Number of elements covered by this region.
    pub fn len(&self) -> usize {
        self.count.iter().product::<i64>() as usize
    }

    /// True when the region covers nothing.
    pub fn is_empty(&self) -> bool {
        self.count.iter().any(|&c| c == 0)
    }
}

/// Grow `count[dim]` while the map stays consistent with a uniform block of
/// the region built so far, without exceeding `max_size[dim]`.
///
/// `region_size` is the element count of the region expanded over all faster
/// dimensions; `region_stride` is the global-index stride of one step along
/// `dim`.
pub fn expand_region(
    dim: usize,
    map: &[i64],
    region_size: usize,
    region_stride: i64,
    max_size: &[i64],
    count: &mut [i64],
) {
    let mut expand = 1i64;
    'outer: for i in 1..max_size[dim] {
        for j in 0..region_size {
            let test_idx = j + i as usize * region_size;
            if test_idx >= map.len() || map[test_idx] != map[j] + i * region_stride {
                break 'outer;
            }
        }
        expand = i + 1;
    }
    count[dim] = expand;
}

/// Find the largest `(start, count)` block at the head of `map`.
///
/// Works from the fastest-varying dimension to the slowest, expanding each
/// dimension as far as the map allows without crossing the array edge.
/// Returns the number of map elements the block consumes.
pub fn find_region(gdims: &[i64], map: &[i64], start: &mut [i64], count: &mut [i64]) -> usize {
    debug_assert!(!map.is_empty());
    let ndims = gdims.len();
    index_to_coord(gdims, map[0], start);

    // can't expand beyond the array edge in any dimension
    let max_size: Vec<i64> = (0..ndims).map(|d| gdims[d] - start[d]).collect();

    let mut region_size = 1usize;
    let mut region_stride = 1i64;
    for dim in (0..ndims).rev() {
        expand_region(dim, map, region_size, region_stride, &max_size, count);
        region_size *= count[dim] as usize;
        region_stride *= gdims[dim];
    }
    region_size
}

/// Count how many regions [`get_regions`] will produce for this map.
///
/// First phase of the count-then-fill protocol; an empty map counts zero
/// regions, which is not an error.
pub fn count_regions(gdims: &[i64], map: &[i64]) -> Result<usize, PioError> {
    let gsize = global_size(gdims)?;
    validate_map(map, gsize)?;
    let ndims = gdims.len();
    let mut start = vec![0i64; ndims];
    let mut count = vec![0i64; ndims];
    let mut consumed = 0usize;
    let mut nregions = 0usize;
    while consumed < map.len() {
        let n = find_region(gdims, &map[consumed..], &mut start, &mut count);
        debug_assert!(n >= 1);
        consumed += n;
        nregions += 1;
    }
    Ok(nregions)
}

/// Decompose the whole map into maximal contiguous regions.
///
/// The returned vector has exactly [`count_regions`] entries; callers that
/// pre-counted may assert on the length. An empty map yields an empty vector.
pub fn get_regions(gdims: &[i64], map: &[i64]) -> Result<Vec<Region>, PioError> {
    let gsize = global_size(gdims)?;
    validate_map(map, gsize)?;
    let ndims = gdims.len();
    let mut regions = Vec::new();
    let mut consumed = 0usize;
    while consumed < map.len() {
        let mut start = vec![0i64; ndims];
        let mut count = vec![0i64; ndims];
        let n = find_region(gdims, &map[consumed..], &mut start, &mut count);
        debug_assert!(n >= 1);
        consumed += n;
        regions.push(Region { start, count });
    }
    Ok(regions)
}

fn validate_map(map: &[i64], gsize: i64) -> Result<(), PioError> {
    for w in map.windows(2) {
        if w[1] <= w[0] {
            return Err(PioError::invalid(format!(
                "region map must be strictly increasing, got {} then {}",
                w[0], w[1]
            )));
        }
    }
    if let Some(&last) = map.last() {
        if map[0] < 0 || last >= gsize {
            return Err(PioError::MapOutOfRange {
                found: if map[0] < 0 { map[0] } else { last },
                gsize,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cover(gdims: &[i64], regions: &[Region]) -> Vec<i64> {
        // enumerate every global index each region covers, in order
        let mut out = Vec::new();
        for r in regions {
            let ndims = gdims.len();
            let total: i64 = r.count.iter().product();
            for k in 0..total {
                let mut rem = k;
                let mut coord = vec![0i64; ndims];
                for d in (0..ndims).rev() {
                    coord[d] = r.start[d] + rem % r.count[d];
                    rem /= r.count[d];
                }
                out.push(crate::index::coord_to_index(gdims, &coord));
            }
        }
        out
    }

    #[test]
    fn empty_map_yields_zero_regions() {
        assert_eq!(count_regions(&[4, 4], &[]).unwrap(), 0);
        assert!(get_regions(&[4, 4], &[]).unwrap().is_empty());
    }

    #[test]
    fn full_row_is_one_region() {
        let r = get_regions(&[4, 4], &[4, 5, 6, 7]).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r[0].start, vec![1, 0]);
        assert_eq!(r[0].count, vec![1, 4]);
    }

    #[test]
    fn adjacent_rows_merge() {
        // rows 1 and 2 of a 4x4: one 2x4 block
        let map: Vec<i64> = (4..12).collect();
        let r = get_regions(&[4, 4], &map).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r[0].start, vec![1, 0]);
        assert_eq!(r[0].count, vec![2, 4]);
    }

    #[test]
    fn partial_rows_do_not_merge() {
        // first half of row 0, first half of row 2
        let r = get_regions(&[4, 4], &[0, 1, 8, 9]).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].start, vec![0, 0]);
        assert_eq!(r[0].count, vec![1, 2]);
        assert_eq!(r[1].start, vec![2, 0]);
        assert_eq!(r[1].count, vec![1, 2]);
    }

    #[test]
    fn column_stays_singletons() {
        // a column of a 4x4 cannot be one run along the fastest dim
        let r = get_regions(&[4, 4], &[1, 5, 9, 13]).unwrap();
        assert_eq!(r.len(), 1, "uniform-stride column merges along dim 0");
        assert_eq!(r[0].start, vec![0, 1]);
        assert_eq!(r[0].count, vec![4, 1]);
    }

    #[test]
    fn flat_range_crossing_rows() {
        // indices 2..=9 of a 4x4: tail of row 0, rows 1-2 start, head...
        let map: Vec<i64> = (2..10).collect();
        let r = get_regions(&[4, 4], &map).unwrap();
        // tail of row 0 (2 elems), full row 1 merged with row 2 head? no:
        // regions are (0,2)x(1,2), (1,0)x(1,4), (2,0)x(1,2)
        assert_eq!(r.len(), 3);
        assert_eq!(cover(&[4, 4], &r), map);
    }

    #[test]
    fn regions_disjoint_and_exact_cover() {
        let gdims = [3i64, 5, 4];
        // an irregular but increasing map
        let map: Vec<i64> = vec![0, 1, 2, 3, 7, 8, 9, 10, 11, 20, 21, 22, 23, 40, 44, 48];
        let regions = get_regions(&gdims, &map).unwrap();
        assert_eq!(regions.len(), count_regions(&gdims, &map).unwrap());
        let covered = cover(&gdims, &regions);
        assert_eq!(covered, map, "concatenated regions re-enumerate the map");
    }

    #[test]
    fn decreasing_map_rejected() {
        assert!(get_regions(&[4, 4], &[3, 2]).is_err());
    }

    #[test]
    fn out_of_range_map_rejected() {
        assert!(matches!(
            get_regions(&[2, 2], &[3, 4]),
            Err(PioError::MapOutOfRange { found: 4, gsize: 4 })
        ));
    }
}
