//! CPU backend: task-parallel execution over the rayon pool.
//!
//! Kernels and primitives split the index space into fixed chunks and fold
//! partial results in chunk order, so reductions are deterministic across
//! runs regardless of worker scheduling.

pub(crate) mod program;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::types::{ReduceOp, VarType};
use program::CpuProgram;

/// Elements per task; chunks below this are not worth a worker wakeup.
const BLOCK_SIZE: u32 = 16384;

/// Execute a compiled kernel over `size` elements.
pub(crate) fn launch(program: &CpuProgram, params: &[usize], size: u32) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let blocks = size.div_ceil(BLOCK_SIZE);
    if blocks <= 1 {
        return program.run_range(params, 0, size);
    }
    (0..blocks).into_par_iter().try_for_each(|b| {
        let start = b * BLOCK_SIZE;
        program.run_range(params, start, (start + BLOCK_SIZE).min(size))
    })
}

fn combine_op(op: ReduceOp) -> crate::stmt::BinOp {
    use crate::stmt::BinOp;
    match op {
        ReduceOp::Add => BinOp::Add,
        ReduceOp::Mul => BinOp::Mul,
        ReduceOp::Min => BinOp::Min,
        ReduceOp::Max => BinOp::Max,
        ReduceOp::And => BinOp::And,
        ReduceOp::Or => BinOp::Or,
    }
}

/// Identity element of a reduction, in canonical register bits.
fn identity(ty: VarType, op: ReduceOp) -> Result<u64> {
    use program::cast_bits;
    let bits = match op {
        ReduceOp::Add => cast_bits(0, VarType::U64, ty),
        ReduceOp::Mul => {
            if ty.is_float() {
                cast_bits((1f64).to_bits(), VarType::F64, ty)
            } else {
                1
            }
        }
        ReduceOp::Min => {
            if ty.is_float() {
                cast_bits(f64::INFINITY.to_bits(), VarType::F64, ty)
            } else if ty.is_signed() {
                // Largest positive value of the width.
                (1u64 << (ty.size() * 8 - 1)) - 1
            } else {
                u64::MAX >> (64 - ty.size() * 8)
            }
        }
        ReduceOp::Max => {
            if ty.is_float() {
                cast_bits(f64::NEG_INFINITY.to_bits(), VarType::F64, ty)
            } else if ty.is_signed() {
                1u64 << (ty.size() * 8 - 1)
            } else {
                0
            }
        }
        ReduceOp::And => {
            if ty.is_float() {
                return Err(Error::usage("bitwise reduction over float elements"));
            }
            u64::MAX >> (64 - ty.size() * 8)
        }
        ReduceOp::Or => {
            if ty.is_float() {
                return Err(Error::usage("bitwise reduction over float elements"));
            }
            0
        }
    };
    Ok(bits)
}

/// Deterministic parallel reduction: chunk partials folded in index order.
pub(crate) fn reduce(
    ty: VarType,
    op: ReduceOp,
    ptr: usize,
    size: u32,
    out: usize,
) -> Result<()> {
    let ident = identity(ty, op)?;
    let bin = combine_op(op);
    let fold_range = move |start: u32, end: u32| -> u64 {
        let mut acc = ident;
        for i in start..end {
            let v = unsafe { program::load_elem(ptr, i as usize, ty) };
            acc = program::exec_bin(bin, ty, acc, v);
        }
        acc
    };
    let blocks = size.div_ceil(BLOCK_SIZE);
    let result = if blocks <= 1 {
        fold_range(0, size)
    } else {
        let partials: Vec<u64> = (0..blocks)
            .into_par_iter()
            .map(|b| {
                let start = b * BLOCK_SIZE;
                fold_range(start, (start + BLOCK_SIZE).min(size))
            })
            .collect();
        partials
            .into_iter()
            .fold(ident, |acc, v| program::exec_bin(bin, ty, acc, v))
    };
    unsafe { program::store_elem(out, 0, ty, result) };
    Ok(())
}

/// Exclusive prefix sum over u32, in-place safe: per-chunk sums, a serial
/// scan over the (few) chunk totals, then a parallel fill pass.
pub(crate) fn scan_u32(input: usize, output: usize, size: u32) {
    if size == 0 {
        return;
    }
    let blocks = size.div_ceil(BLOCK_SIZE);
    let chunk_sum = |b: u32| -> u32 {
        let start = b * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(size);
        let mut sum = 0u32;
        for i in start..end {
            sum = sum.wrapping_add(unsafe { *(input as *const u32).add(i as usize) });
        }
        sum
    };
    let mut offsets: Vec<u32> = if blocks <= 1 {
        vec![0]
    } else {
        (0..blocks).into_par_iter().map(chunk_sum).collect()
    };
    let mut accum = 0u32;
    for v in offsets.iter_mut() {
        let s = *v;
        *v = accum;
        accum = accum.wrapping_add(s);
    }
    let fill = |b: u32, mut running: u32| {
        let start = b * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(size);
        for i in start..end {
            let v = unsafe { *(input as *const u32).add(i as usize) };
            unsafe { *(output as *mut u32).add(i as usize) = running };
            running = running.wrapping_add(v);
        }
    };
    if blocks <= 1 {
        fill(0, 0);
    } else {
        offsets
            .into_par_iter()
            .enumerate()
            .for_each(|(b, base)| fill(b as u32, base));
    }
}

/// Stable bucket partition. Per-task histograms, a serial pass that turns
/// counts into per-(bucket, task) output bases and emits the bucket
/// descriptors, then a parallel pass that writes the permutation.
pub(crate) fn mkperm(
    keys: usize,
    size: u32,
    bucket_count: u32,
    perm: usize,
    offsets: Option<usize>,
) -> u32 {
    if size == 0 {
        return 0;
    }
    let num_tasks = (rayon::current_num_threads() * 4).max(1) as u32;
    let items_per_task = 4096u32.max(size.div_ceil(num_tasks));
    let num_tasks = size.div_ceil(items_per_task);

    let mut buckets: Vec<Vec<u32>> = (0..num_tasks)
        .map(|_| vec![0u32; bucket_count as usize])
        .collect();

    buckets.par_iter_mut().enumerate().for_each(|(t, local)| {
        let start = t as u32 * items_per_task;
        let end = (start + items_per_task).min(size);
        for i in start..end {
            let key = unsafe { *(keys as *const u32).add(i as usize) };
            local[key as usize] += 1;
        }
    });

    let mut sum = 0u32;
    let mut unique_count = 0u32;
    for b in 0..bucket_count as usize {
        let mut sum_local = 0u32;
        for local in buckets.iter_mut() {
            let value = local[b];
            local[b] = sum + sum_local;
            sum_local += value;
        }
        if sum_local > 0 {
            if let Some(offsets) = offsets {
                let q = unsafe { (offsets as *mut u32).add(unique_count as usize * 4) };
                unsafe {
                    *q = b as u32;
                    *q.add(1) = sum;
                    *q.add(2) = sum_local;
                    *q.add(3) = 0;
                }
            }
            unique_count += 1;
            sum += sum_local;
        }
    }
    if let Some(offsets) = offsets {
        unsafe { *(offsets as *mut u32).add(bucket_count as usize * 4) = unique_count };
    }

    buckets.par_iter_mut().enumerate().for_each(|(t, local)| {
        let start = t as u32 * items_per_task;
        let end = (start + items_per_task).min(size);
        for i in start..end {
            let key = unsafe { *(keys as *const u32).add(i as usize) };
            let slot = local[key as usize];
            local[key as usize] += 1;
            unsafe { *(perm as *mut u32).add(slot as usize) = i };
        }
    });

    unique_count
}

pub(crate) fn transpose_u32(input: usize, output: usize, rows: u32, cols: u32) {
    (0..rows).into_par_iter().for_each(|r| {
        for c in 0..cols {
            unsafe {
                let v = *(input as *const u32).add((r * cols + c) as usize);
                *(output as *mut u32).add((c * rows + r) as usize) = v;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_matches_serial() {
        let input: Vec<u32> = (0..100_000u32).map(|i| i % 7).collect();
        let mut out = vec![0u32; input.len()];
        scan_u32(
            input.as_ptr() as usize,
            out.as_mut_ptr() as usize,
            input.len() as u32,
        );
        let mut accum = 0u32;
        for (i, v) in input.iter().enumerate() {
            assert_eq!(out[i], accum);
            accum += v;
        }
    }

    #[test]
    fn scan_in_place() {
        let mut data = vec![1u32; 5];
        let ptr = data.as_mut_ptr() as usize;
        scan_u32(ptr, ptr, 5);
        assert_eq!(data, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn reduce_add_u32() {
        let data: Vec<u32> = (1..=1024).collect();
        let mut out = 0u32;
        reduce(
            VarType::U32,
            ReduceOp::Add,
            data.as_ptr() as usize,
            1024,
            &mut out as *mut u32 as usize,
        )
        .unwrap();
        assert_eq!(out, 524_800);
    }

    #[test]
    fn reduce_min_uses_min() {
        let data: Vec<i32> = vec![5, -3, 17, 0];
        let mut out = 0i32;
        reduce(
            VarType::I32,
            ReduceOp::Min,
            data.as_ptr() as usize,
            4,
            &mut out as *mut i32 as usize,
        )
        .unwrap();
        assert_eq!(out, -3);

        let data: Vec<f32> = vec![2.5, -1.0, 7.0];
        let mut out = 0f32;
        reduce(
            VarType::F32,
            ReduceOp::Min,
            data.as_ptr() as usize,
            3,
            &mut out as *mut f32 as usize,
        )
        .unwrap();
        assert_eq!(out, -1.0);
    }

    #[test]
    fn mkperm_example() {
        let keys: Vec<u32> = vec![2, 0, 2, 1, 0, 2];
        let mut perm = vec![0u32; 6];
        let mut offsets = vec![0u32; 3 * 4 + 1];
        let unique = mkperm(
            keys.as_ptr() as usize,
            6,
            3,
            perm.as_mut_ptr() as usize,
            Some(offsets.as_mut_ptr() as usize),
        );
        assert_eq!(unique, 3);
        assert_eq!(perm, [1, 4, 3, 0, 2, 5]);
        assert_eq!(&offsets[0..4], &[0, 0, 2, 0]);
        assert_eq!(&offsets[4..8], &[1, 2, 1, 0]);
        assert_eq!(&offsets[8..12], &[2, 3, 3, 0]);
        assert_eq!(offsets[12], 3);
    }

    #[test]
    fn transpose_round_trip() {
        let input: Vec<u32> = (0..12).collect();
        let mut t = vec![0u32; 12];
        let mut back = vec![0u32; 12];
        transpose_u32(input.as_ptr() as usize, t.as_mut_ptr() as usize, 3, 4);
        transpose_u32(t.as_ptr() as usize, back.as_mut_ptr() as usize, 4, 3);
        assert_eq!(input, back);
        assert_eq!(t[0], 0);
        assert_eq!(t[1], 4);
    }
}
