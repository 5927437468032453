//! Host-driven recorded loops: masked updates with a boolean continuation
//! test, and side effects that must run exactly once per trace.

mod common;

use common::{drop_vars, read_all_u32, setup};
use flint::VarType;

/// `x = arange(10); y = 0; while (x < 5) { y += x; x += 1 }`
#[test]
fn masked_loop_converges() {
    let _g = setup();
    let five = flint::literal(VarType::U32, "5").unwrap();
    let zero = flint::literal(VarType::U32, "0").unwrap();
    let mut x = flint::index(VarType::U32, 10).unwrap();
    let mut y = flint::set_size(zero, 10, false).unwrap();

    let mut iterations = 0;
    loop {
        let mask = flint::trace_append(VarType::Bool, "$r0 = $r1 < $r2", &[x, five]).unwrap();
        flint::var_eval(mask).unwrap();
        let active = flint::any(flint::var_ptr(mask).unwrap(), 10).unwrap();
        if !active {
            drop_vars(&[mask]);
            break;
        }
        let y_next = flint::trace_append(
            VarType::U32,
            "$r0 = select($r1, $r2 + $r3, $r2)",
            &[mask, y, x],
        )
        .unwrap();
        let x_next = flint::trace_append(
            VarType::U32,
            "$r0 = select($r1, $r2 + 1, $r2)",
            &[mask, x],
        )
        .unwrap();
        drop_vars(&[mask, y, x]);
        (x, y) = (x_next, y_next);
        iterations += 1;
        assert!(iterations <= 5, "loop failed to converge");
    }

    assert_eq!(read_all_u32(x), [5, 5, 5, 5, 5, 5, 6, 7, 8, 9]);
    assert_eq!(read_all_u32(y), [10, 10, 9, 7, 4, 0, 0, 0, 0, 0]);
    assert_eq!(iterations, 5);

    drop_vars(&[x, y, five, zero]);
    flint::shutdown(true);
}

/// The same loop with a scatter-add side effect onto a zeroed length-11
/// target. Each traced scatter runs exactly once, even when evaluation is
/// triggered repeatedly.
#[test]
fn scatter_side_effects_run_once() {
    let _g = setup();
    let target = flint::copy_to_backend(VarType::U32, &[0u8; 11 * 4]).unwrap();
    let tptr = flint::register_ptr(flint::var_ptr(target).unwrap()).unwrap();
    let five = flint::literal(VarType::U32, "5").unwrap();
    let mut x = flint::index(VarType::U32, 10).unwrap();

    loop {
        let mask = flint::trace_append(VarType::Bool, "$r0 = $r1 < $r2", &[x, five]).unwrap();
        flint::var_eval(mask).unwrap();
        if !flint::any(flint::var_ptr(mask).unwrap(), 10).unwrap() {
            drop_vars(&[mask]);
            break;
        }

        // Masked-out lanes contribute zero.
        let value =
            flint::trace_append(VarType::U32, "$r0 = select($r1, 1, 0)", &[mask]).unwrap();
        let effect = flint::trace_append_unique(
            VarType::U32,
            "scatter_add($r1, $r2, $r3)",
            &[tptr, value, x],
        )
        .unwrap();
        flint::mark_side_effect(effect).unwrap();
        flint::mark_dirty(target).unwrap();
        // The client may discard its handle; the write still happens.
        drop_vars(&[effect, value]);

        flint::eval().unwrap();
        // A second evaluation must not replay the scatter.
        flint::eval().unwrap();

        let x_next = flint::trace_append(
            VarType::U32,
            "$r0 = select($r1, $r2 + 1, $r2)",
            &[mask, x],
        )
        .unwrap();
        drop_vars(&[mask, x]);
        x = x_next;
    }

    assert_eq!(read_all_u32(target), [1, 2, 3, 4, 5, 0, 0, 0, 0, 0, 0]);

    drop_vars(&[x, five, tptr, target]);
    flint::shutdown(true);
}

/// Gathers read through interned pointer literals.
#[test]
fn gather_through_pointer_literal() {
    let _g = setup();
    let table: Vec<u8> = [10u32, 20, 30, 40]
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();
    let data = flint::copy_to_backend(VarType::U32, &table).unwrap();
    let ptr = flint::register_ptr(flint::var_ptr(data).unwrap()).unwrap();

    let idx = flint::index(VarType::U32, 8).unwrap();
    let wrapped = flint::trace_append(VarType::U32, "$r0 = $r1 % 4", &[idx]).unwrap();
    let gathered =
        flint::trace_append_unique(VarType::U32, "$r0 = gather($r1, $r2)", &[ptr, wrapped])
            .unwrap();

    assert_eq!(
        read_all_u32(gathered),
        [10, 20, 30, 40, 10, 20, 30, 40]
    );

    drop_vars(&[gathered, wrapped, idx, ptr, data]);
    flint::shutdown(true);
}

/// Placeholders trace symbolically and refuse evaluation.
#[test]
fn placeholders_cannot_be_evaluated() {
    let _g = setup();
    let p = flint::placeholder(VarType::F32, 32).unwrap();
    let body = flint::trace_append(VarType::F32, "$r0 = $r1 * 2.0", &[p]).unwrap();
    assert!(flint::var_eval(body).is_err());
    drop_vars(&[body, p]);
    flint::shutdown(true);
}
