//! Shared harness: the engine is a process-wide singleton, so tests in one
//! binary serialize on a lock and reset the engine around themselves.

use std::sync::{Mutex, MutexGuard, OnceLock};

#[allow(dead_code)]
pub fn setup() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let guard = LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    // Clear anything a previously failed test left behind.
    flint::shutdown(true);
    flint::init(true, false).unwrap();
    flint::device_set(-1, 0).unwrap();
    guard
}

#[allow(dead_code)]
pub fn read_u32(id: u32, i: u32) -> u32 {
    let mut bytes = [0u8; 4];
    flint::read(id, i, &mut bytes).unwrap();
    u32::from_ne_bytes(bytes)
}

#[allow(dead_code)]
pub fn read_all_u32(id: u32) -> Vec<u32> {
    (0..flint::var_size(id).unwrap())
        .map(|i| read_u32(id, i))
        .collect()
}

#[allow(dead_code)]
pub fn read_f32(id: u32, i: u32) -> f32 {
    let mut bytes = [0u8; 4];
    flint::read(id, i, &mut bytes).unwrap();
    f32::from_ne_bytes(bytes)
}

#[allow(dead_code)]
pub fn drop_vars(ids: &[u32]) {
    for &id in ids {
        flint::dec_ref_ext(id).unwrap();
    }
}
