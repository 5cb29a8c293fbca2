//! Decomposition construction and persistence across four in-process ranks.

use pario::decomp::file::MAP_FILL;
use pario::prelude::*;
use serial_test::serial;

const NRANKS: usize = 4;

/// 1-based contiguous slab for `rank`, remainder elements to the lowest
/// ranks, matching the box rearranger's io-side chunking.
fn slab(gsize: i64, n: usize, rank: usize) -> Vec<i64> {
    let base = gsize / n as i64;
    let rem = gsize % n as i64;
    let extra = (rank as i64).min(rem);
    let start = rank as i64 * base + extra;
    let len = base + if (rank as i64) < rem { 1 } else { 0 };
    (start + 1..=start + len).collect()
}

fn with_ranks<F, T>(f: F) -> Vec<T>
where
    F: Fn(usize) -> T + Copy + Send,
    T: Send,
{
    std::thread::scope(|s| {
        let joins: Vec<_> = (0..NRANKS).map(|rank| s.spawn(move || f(rank))).collect();
        joins.into_iter().map(|j| j.join().unwrap()).collect()
    })
}

fn build_box(gdims: &[i64], rank: usize) -> (PioContext<LocalComm>, i32) {
    let gsize: i64 = gdims.iter().product();
    let comm = LocalComm::new(rank, NRANKS);
    let ios = IoSystem::all_ranks_io(NRANKS).unwrap();
    let mut ctx = PioContext::new(comm, ios, FlowControl::default());
    let compmap = slab(gsize, NRANKS, rank);
    let ioid = ctx.init_decomp(gdims, &compmap, Rearranger::Box).unwrap();
    (ctx, ioid)
}

#[test]
#[serial]
fn box_even_grid_gives_equal_slabs() {
    LocalComm::reset_mailbox();
    let gdims = [1i64, 4, 4];
    let llens = with_ranks(|rank| {
        let (ctx, ioid) = build_box(&gdims, rank);
        let desc = ctx.decomp(ioid).unwrap();
        (desc.ndof, desc.llen)
    });
    assert_eq!(
        llens,
        vec![(4, 4), (4, 4), (4, 4), (4, 4)],
        "16 elements over 4 io tasks"
    );
}

#[test]
#[serial]
fn box_uneven_grid_gives_remainder_to_low_ranks() {
    LocalComm::reset_mailbox();
    let gdims = [1i64, 3, 3];
    let lens = with_ranks(|rank| {
        let (ctx, ioid) = build_box(&gdims, rank);
        let desc = ctx.decomp(ioid).unwrap();
        (desc.ndof, desc.llen)
    });
    assert_eq!(lens, vec![(3, 3), (2, 2), (2, 2), (2, 2)]);
    // partition invariant: the task maps tile the global array exactly
    let gsize: i64 = gdims.iter().product();
    assert_eq!(lens.iter().map(|&(n, _)| n as i64).sum::<i64>(), gsize);
    assert_eq!(lens.iter().map(|&(_, l)| l as i64).sum::<i64>(), gsize);
}

#[test]
#[serial]
fn decomp_file_roundtrip_reproduces_maps() {
    LocalComm::reset_mailbox();
    let gdims = [1i64, 3, 3];
    let path = std::env::temp_dir().join(format!("pario-decomp-{}.json", std::process::id()));
    let path_ref = &path;

    with_ranks(|rank| {
        let (ctx, ioid) = build_box(&gdims, rank);
        ctx.write_decomp_file(path_ref, ioid, "uneven box decomposition", "test run")
            .unwrap();
    });

    let file = read_decomp_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(file.ndims, 3);
    assert_eq!(file.gdims, gdims.to_vec());
    assert_eq!(file.ntasks, NRANKS);
    assert_eq!(file.maplen, vec![3, 2, 2, 2]);
    for rank in 0..NRANKS {
        assert_eq!(file.task_map(rank).unwrap(), slab(9, NRANKS, rank));
    }
    // short rows are padded to the widest row with the fill sentinel
    assert_eq!(file.map[1], vec![4, 5, MAP_FILL]);
}

#[test]
#[serial]
fn subset_decomp_accepts_scattered_map() {
    LocalComm::reset_mailbox();
    let gdims = [4i64, 4];
    // round-robin distribution, nothing contiguous anywhere
    let lens = with_ranks(|rank| {
        let comm = LocalComm::new(rank, NRANKS);
        let ios = IoSystem::all_ranks_io(NRANKS).unwrap();
        let mut ctx = PioContext::new(comm, ios, FlowControl::default());
        let compmap: Vec<i64> = (0..4).map(|i| (i * NRANKS + rank + 1) as i64).collect();
        let ioid = ctx.init_decomp(&gdims, &compmap, Rearranger::Subset).unwrap();
        let desc = ctx.decomp(ioid).unwrap();
        (desc.ndof, desc.llen)
    });
    let gsize: i64 = gdims.iter().product();
    assert_eq!(lens.iter().map(|&(_, l)| l as i64).sum::<i64>(), gsize);
    assert!(lens.iter().all(|&(n, _)| n == 4));
}
