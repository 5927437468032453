//! Parallel primitive contracts on the CPU backend: reductions, exclusive
//! scan, bucket permutation, and the boolean folds built on top.

mod common;

use common::setup;
use flint::{ReduceOp, VarType};
use proptest::prelude::*;

#[test]
fn reduce_add_matches_closed_form() {
    let _g = setup();
    let data: Vec<u32> = (1..=1024).collect();
    let mut out = 0u32;
    flint::reduce(
        VarType::U32,
        ReduceOp::Add,
        data.as_ptr() as usize,
        1024,
        &mut out as *mut u32 as usize,
    )
    .unwrap();
    assert_eq!(out, 524_800);
    flint::shutdown(true);
}

#[test]
fn reduce_min_max_identities() {
    let _g = setup();
    let data = [3.5f32, -2.0, 7.25, 0.0];
    let mut lo = 0f32;
    let mut hi = 0f32;
    flint::reduce(
        VarType::F32,
        ReduceOp::Min,
        data.as_ptr() as usize,
        4,
        &mut lo as *mut f32 as usize,
    )
    .unwrap();
    flint::reduce(
        VarType::F32,
        ReduceOp::Max,
        data.as_ptr() as usize,
        4,
        &mut hi as *mut f32 as usize,
    )
    .unwrap();
    assert_eq!(lo, -2.0);
    assert_eq!(hi, 7.25);

    // Bitwise reductions are only defined on integers.
    assert!(
        flint::reduce(
            VarType::F32,
            ReduceOp::And,
            data.as_ptr() as usize,
            4,
            &mut lo as *mut f32 as usize
        )
        .is_err()
    );
    flint::shutdown(true);
}

#[test]
fn scan_small_example() {
    let _g = setup();
    let input = [1u32, 1, 1, 1, 1];
    let mut out = [0u32; 5];
    flint::scan_u32(input.as_ptr() as usize, out.as_mut_ptr() as usize, 5).unwrap();
    assert_eq!(out, [0, 1, 2, 3, 4]);
    flint::shutdown(true);
}

#[test]
fn mkperm_small_example() {
    let _g = setup();
    let keys = [2u32, 0, 2, 1, 0, 2];
    let mut perm = [0u32; 6];
    let mut offsets = [0u32; 3 * 4 + 1];
    let unique = flint::mkperm(
        keys.as_ptr() as usize,
        6,
        3,
        perm.as_mut_ptr() as usize,
        Some(offsets.as_mut_ptr() as usize),
    )
    .unwrap();
    assert_eq!(unique, 3);
    assert_eq!(perm, [1, 4, 3, 0, 2, 5]);
    assert_eq!(&offsets[0..3], &[0, 0, 2]);
    assert_eq!(&offsets[4..7], &[1, 2, 1]);
    assert_eq!(&offsets[8..11], &[2, 3, 3]);
    flint::shutdown(true);
}

#[test]
fn all_any_handle_ragged_tails() {
    let _g = setup();
    for n in [1usize, 3, 4, 5, 63, 64, 65] {
        let mut data = vec![1u8; n];
        assert!(flint::all(data.as_ptr() as usize, n as u32).unwrap());
        assert!(flint::any(data.as_ptr() as usize, n as u32).unwrap());
        data[n - 1] = 0;
        assert!(!flint::all(data.as_ptr() as usize, n as u32).unwrap());
        assert_eq!(flint::any(data.as_ptr() as usize, n as u32).unwrap(), n > 1);
        data.fill(0);
        assert!(!flint::any(data.as_ptr() as usize, n as u32).unwrap());
    }
    flint::shutdown(true);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn scan_round_trip(input in prop::collection::vec(0u32..1000, 1..20_000)) {
        let _g = setup();
        let mut out = vec![0u32; input.len()];
        flint::scan_u32(
            input.as_ptr() as usize,
            out.as_mut_ptr() as usize,
            input.len() as u32,
        )
        .unwrap();
        prop_assert_eq!(out[0], 0);
        for k in 1..input.len() {
            prop_assert_eq!(out[k], out[k - 1].wrapping_add(input[k - 1]));
        }
        flint::shutdown(true);
    }

    #[test]
    fn mkperm_is_a_stable_partition(
        keys in prop::collection::vec(0u32..17, 1..10_000),
    ) {
        let _g = setup();
        let n = keys.len();
        let mut perm = vec![0u32; n];
        let mut offsets = vec![0u32; 17 * 4 + 1];
        let unique = flint::mkperm(
            keys.as_ptr() as usize,
            n as u32,
            17,
            perm.as_mut_ptr() as usize,
            Some(offsets.as_mut_ptr() as usize),
        )
        .unwrap();

        // A permutation of 0..n.
        let mut seen = vec![false; n];
        for &p in &perm {
            prop_assert!(!seen[p as usize]);
            seen[p as usize] = true;
        }

        // Keys are non-decreasing along the permutation, equal keys keep
        // their input order, and the descriptors tile the index space.
        for w in perm.windows(2) {
            let (a, b) = (w[0] as usize, w[1] as usize);
            prop_assert!(keys[a] < keys[b] || (keys[a] == keys[b] && a < b));
        }
        let mut covered = 0u32;
        for i in 0..unique as usize {
            let (key, start, count) = (offsets[i * 4], offsets[i * 4 + 1], offsets[i * 4 + 2]);
            prop_assert_eq!(start, covered);
            for k in start..start + count {
                prop_assert_eq!(keys[perm[k as usize] as usize], key);
            }
            covered += count;
        }
        prop_assert_eq!(covered, n as u32);
        flint::shutdown(true);
    }

    #[test]
    fn reduce_agrees_with_serial_fold(
        data in prop::collection::vec(0u32..100_000, 1..50_000),
    ) {
        let _g = setup();
        let mut out = 0u32;
        flint::reduce(
            VarType::U32,
            ReduceOp::Add,
            data.as_ptr() as usize,
            data.len() as u32,
            &mut out as *mut u32 as usize,
        )
        .unwrap();
        let expected = data.iter().fold(0u32, |a, b| a.wrapping_add(*b));
        prop_assert_eq!(out, expected);
        flint::shutdown(true);
    }
}
