//! Variable table behavior: CSE folding, reference counting, evaluation
//! laws, and clean teardown.

mod common;

use common::{drop_vars, read_all_u32, read_u32, setup};
use flint::VarType;

#[test]
fn cse_folds_identical_expressions() {
    let _g = setup();
    let a = flint::index(VarType::U32, 16).unwrap();
    let b = flint::literal(VarType::U32, "3").unwrap();

    let x1 = flint::trace_append(VarType::U32, "$r0 = $r1 * $r2", &[a, b]).unwrap();
    let x2 = flint::trace_append(VarType::U32, "$r0 = $r1 * $r2", &[a, b]).unwrap();
    assert_eq!(x1, x2);
    assert_eq!(flint::var_refs(x1).unwrap(), (0, 2));

    // A different statement over the same operands is a different node.
    let y = flint::trace_append(VarType::U32, "$r0 = $r1 + $r2", &[a, b]).unwrap();
    assert_ne!(y, x1);

    // Operands carry one internal reference per unique dependent.
    assert_eq!(flint::var_refs(a).unwrap(), (2, 1));
    assert_eq!(flint::var_refs(b).unwrap(), (2, 1));

    // Dropping every external handle collects the whole graph.
    drop_vars(&[x1, x2, y, a, b]);
    assert!(flint::var_refs(x1).is_err());
    assert!(flint::var_refs(a).is_err());
    flint::shutdown(true);
}

#[test]
fn refcount_underflow_is_a_usage_error() {
    let _g = setup();
    let a = flint::index(VarType::U32, 4).unwrap();
    // No operand edges exist yet, so the internal count cannot drop.
    assert!(matches!(
        flint::dec_ref_int(a),
        Err(flint::Error::Usage(_))
    ));
    // The failed decrement left the variable untouched.
    assert_eq!(flint::var_refs(a).unwrap(), (0, 1));
    drop_vars(&[a]);
    flint::shutdown(true);
}

#[test]
fn unique_statements_are_not_folded() {
    let _g = setup();
    let a = flint::index(VarType::U32, 8).unwrap();
    let x1 = flint::trace_append_unique(VarType::U32, "$r0 = $r1 + 1", &[a]).unwrap();
    let x2 = flint::trace_append_unique(VarType::U32, "$r0 = $r1 + 1", &[a]).unwrap();
    assert_ne!(x1, x2);
    drop_vars(&[x1, x2, a]);
    flint::shutdown(true);
}

#[test]
fn sizes_broadcast_and_mismatches_reject() {
    let _g = setup();
    let a = flint::index(VarType::U32, 10).unwrap();
    let one = flint::literal(VarType::U32, "1").unwrap();
    let sum = flint::trace_append(VarType::U32, "$r0 = $r1 + $r2", &[a, one]).unwrap();
    assert_eq!(flint::var_size(sum).unwrap(), 10);

    let b = flint::index(VarType::U32, 5).unwrap();
    let err = flint::trace_append(VarType::U32, "$r0 = $r1 + $r2", &[a, b]);
    assert!(matches!(err, Err(flint::Error::Usage(_))));

    // The failed append must not have touched the graph.
    assert_eq!(flint::var_refs(a).unwrap(), (1, 1));
    assert_eq!(flint::var_refs(b).unwrap(), (0, 1));

    drop_vars(&[sum, one, a, b]);
    flint::shutdown(true);
}

#[test]
fn eval_materializes_and_is_idempotent() {
    let _g = setup();
    let a = flint::index(VarType::U32, 100).unwrap();
    let two = flint::literal(VarType::U32, "2").unwrap();
    let double = flint::trace_append(VarType::U32, "$r0 = $r1 * $r2", &[a, two]).unwrap();

    assert_eq!(flint::var_ptr(double).unwrap(), 0);
    flint::var_eval(double).unwrap();
    let ptr = flint::var_ptr(double).unwrap();
    assert_ne!(ptr, 0);

    // Re-evaluating a clean materialized variable changes nothing.
    flint::var_eval(double).unwrap();
    assert_eq!(flint::var_ptr(double).unwrap(), ptr);

    assert_eq!(read_u32(double, 0), 0);
    assert_eq!(read_u32(double, 99), 198);

    // Materialization dropped the operand edges.
    assert_eq!(flint::var_refs(double).unwrap(), (0, 1));
    drop_vars(&[double]);
    // `a` and `two` survive only through their own handles now.
    assert_eq!(flint::var_refs(a).unwrap(), (0, 1));
    drop_vars(&[a, two]);
    flint::shutdown(true);
}

#[test]
fn expressions_fuse_into_one_kernel() {
    let _g = setup();
    let i = flint::index(VarType::U32, 64).unwrap();
    let sq = flint::trace_append(VarType::U32, "$r0 = $r1 * $r1", &[i]).unwrap();
    let odd = flint::trace_append(VarType::U32, "$r0 = $r1 + $r2 + 1", &[sq, i]).unwrap();
    let values = {
        flint::var_eval(odd).unwrap();
        read_all_u32(odd)
    };
    for (k, v) in values.iter().enumerate() {
        let k = k as u32;
        assert_eq!(*v, k * k + k + 1);
    }
    // The fused intermediate was never materialized on its own.
    assert_eq!(flint::var_ptr(sq).unwrap(), 0);
    drop_vars(&[odd, sq, i]);
    flint::shutdown(true);
}

#[test]
fn read_write_single_elements() {
    let _g = setup();
    let data: Vec<u8> = [7u32, 8, 9].iter().flat_map(|v| v.to_ne_bytes()).collect();
    let v = flint::copy_to_backend(VarType::U32, &data).unwrap();
    assert_eq!(read_u32(v, 1), 8);
    flint::write(v, 1, &42u32.to_ne_bytes()).unwrap();
    assert_eq!(read_u32(v, 1), 42);
    assert!(flint::read(v, 3, &mut [0u8; 4]).is_err());
    drop_vars(&[v]);
    flint::shutdown(true);
}

#[test]
fn pointer_literals_are_interned() {
    let _g = setup();
    let buffer = [0u32; 4];
    let ptr = buffer.as_ptr() as usize;
    let p1 = flint::register_ptr(ptr).unwrap();
    let p2 = flint::register_ptr(ptr).unwrap();
    assert_eq!(p1, p2);
    assert_eq!(flint::var_refs(p1).unwrap(), (0, 2));
    assert_eq!(flint::var_ty(p1).unwrap(), VarType::Ptr);
    drop_vars(&[p1, p2]);
    flint::shutdown(true);
}

#[test]
fn set_size_resizes_pending_scalars() {
    let _g = setup();
    let zero = flint::literal(VarType::U32, "0").unwrap();
    let wide = flint::set_size(zero, 12, false).unwrap();
    assert_eq!(flint::var_size(wide).unwrap(), 12);
    assert_eq!(read_u32(wide, 11), 0);
    // Resizing a materialized variable requires a copy.
    assert!(flint::set_size(wide, 24, false).is_err());
    drop_vars(&[zero, wide]);
    flint::shutdown(true);
}

#[test]
fn labels_round_trip() {
    let _g = setup();
    let v = flint::literal(VarType::F32, "1.5").unwrap();
    flint::set_label(v, "loss").unwrap();
    assert_eq!(flint::var_label(v).unwrap().as_deref(), Some("loss"));
    assert!(flint::whos().contains("loss"));
    drop_vars(&[v]);
    flint::shutdown(true);
}

#[test]
fn malformed_statements_reject_cleanly() {
    let _g = setup();
    let a = flint::index(VarType::U32, 4).unwrap();
    assert!(flint::trace_append(VarType::U32, "$r0 = $r2", &[a]).is_err());
    assert!(flint::trace_append(VarType::U32, "$r0 = frob($r1)", &[a]).is_err());
    assert!(flint::trace_append(VarType::U32, "$r0 = $r1 +", &[a]).is_err());
    // Mixed operand types inside one expression are rejected up front.
    let f = flint::literal(VarType::F32, "1.0").unwrap();
    assert!(flint::trace_append(VarType::F32, "$r0 = $r1 + $r2", &[a, f]).is_err());
    assert_eq!(flint::var_refs(a).unwrap(), (0, 1));
    drop_vars(&[a, f]);
    flint::shutdown(true);
}

#[test]
fn allocator_parity_after_teardown() {
    let _g = setup();
    let a = flint::index(VarType::F32, 1000).unwrap();
    let b = flint::trace_append(VarType::F32, "$r0 = sqrt($r1 + 1.0)", &[a]).unwrap();
    flint::var_eval(b).unwrap();
    drop_vars(&[b, a]);
    flint::shutdown(true);
    let (used, free, inflight, provider) = flint::malloc::stats();
    assert_eq!(used, 0);
    assert_eq!(free, 0);
    assert_eq!(inflight, 0);
    assert_eq!(provider, 0);
}

#[test]
fn operations_without_a_stream_fail() {
    let _g = setup();
    flint::device_unset();
    assert!(matches!(
        flint::index(VarType::U32, 4),
        Err(flint::Error::Usage(_))
    ));
    flint::device_set(-1, 0).unwrap();
    flint::shutdown(true);
}
