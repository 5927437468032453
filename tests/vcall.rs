//! Indirect-call bucketization: coverage, ordering, caching.

mod common;

use common::{drop_vars, setup};
use flint::VarType;

fn upload_u32(values: &[u32]) -> u32 {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    flint::copy_to_backend(VarType::U32, &bytes).unwrap()
}

#[test]
fn buckets_cover_the_nonzero_lanes() {
    let _g = setup();
    let instances = [Box::new(1u64), Box::new(2u64), Box::new(3u64)];
    let ptrs: Vec<usize> = instances.iter().map(|b| &**b as *const u64 as usize).collect();
    for &p in &ptrs {
        flint::registry::put("shapes", p).unwrap();
    }
    assert_eq!(flint::registry::get_max("shapes"), 3);

    let ids = [2u32, 0, 3, 1, 0, 2, 2, 1];
    let index = upload_u32(&ids);
    let buckets = flint::vcall("shapes", index).unwrap();

    // One bucket per callee that occurs; id 0 lanes are dropped.
    assert_eq!(buckets.len(), 3);
    let total: u32 = buckets.iter().map(|b| b.size).sum();
    assert_eq!(total as usize, ids.iter().filter(|i| **i != 0).count());

    // Each bucket's view selects exactly the lanes of its callee, and the
    // union of all views is the set of non-zero lanes.
    let mut covered = Vec::new();
    for bucket in &buckets {
        let data = flint::var_ptr(bucket.index).unwrap();
        let lanes = unsafe {
            std::slice::from_raw_parts(data as *const u32, bucket.size as usize)
        };
        let key = ids[lanes[0] as usize];
        assert_eq!(bucket.ptr, ptrs[key as usize - 1]);
        for &lane in lanes {
            assert_eq!(ids[lane as usize], key);
            covered.push(lane);
        }
    }
    covered.sort_unstable();
    let expected: Vec<u32> = (0..ids.len() as u32).filter(|i| ids[*i as usize] != 0).collect();
    assert_eq!(covered, expected);

    drop_vars(&[index]);
    flint::shutdown(true);
}

#[test]
fn repeated_vcalls_hit_the_cache() {
    let _g = setup();
    let a = Box::new(7u64);
    flint::registry::put("lights", &*a as *const u64 as usize).unwrap();

    let index = upload_u32(&[1, 1, 0, 1]);
    let first = flint::vcall("lights", index).unwrap();
    let second = flint::vcall("lights", index).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].size, 3);

    // Destroying the index variable releases the cached views; shutdown
    // must then find a fully empty table.
    drop_vars(&[index]);
    flint::shutdown(true);
}

#[test]
fn all_zero_ids_produce_no_buckets() {
    let _g = setup();
    let b = Box::new(9u64);
    flint::registry::put("empty", &*b as *const u64 as usize).unwrap();
    let index = upload_u32(&[0, 0, 0]);
    let buckets = flint::vcall("empty", index).unwrap();
    assert!(buckets.is_empty());
    drop_vars(&[index]);
    flint::shutdown(true);
}

#[test]
fn registry_reuses_freed_slots() {
    let _g = setup();
    let a = Box::new(1u32);
    let b = Box::new(2u32);
    let pa = &*a as *const u32 as usize;
    let pb = &*b as *const u32 as usize;
    let ida = flint::registry::put("mats", pa).unwrap();
    assert_eq!(ida, 1);
    flint::registry::remove("mats", pa).unwrap();
    let idb = flint::registry::put("mats", pb).unwrap();
    assert_eq!(idb, 1);
    assert_eq!(flint::registry::get_ptr("mats", 1), pb);
    assert_eq!(flint::registry::get_ptr("mats", 0), 0);
    flint::shutdown(true);
}
