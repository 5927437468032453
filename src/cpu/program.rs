//! Compiled CPU kernels.
//!
//! A fused kernel on the CPU is a flat register program derived from the
//! scheduled statements. Registers hold raw 64-bit lanes; every instruction
//! carries the element type it interprets them as. One program instance is
//! executed over index chunks by the worker pool, so instructions touching
//! shared memory (scatters) go through atomics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use half::f16;

use crate::error::Result;
use crate::stmt::{BinOp, Expr, Stmt, UnOp};
use crate::types::VarType;

#[derive(Clone, Copy, Debug)]
pub(crate) enum Instr {
    /// Load the element at the running index from a buffer parameter.
    Load { dst: u16, slot: u16, ty: VarType, broadcast: bool },
    /// Take a parameter's value itself (pointer literals).
    Value { dst: u16, slot: u16 },
    Index { dst: u16 },
    Const { dst: u16, bits: u64 },
    Un { dst: u16, op: UnOp, a: u16, ty: VarType },
    Bin { dst: u16, op: BinOp, a: u16, b: u16, ty: VarType },
    Select { dst: u16, c: u16, a: u16, b: u16 },
    Gather { dst: u16, ptr: u16, idx: u16, ty: VarType },
    Scatter { ptr: u16, val: u16, idx: u16, ty: VarType, add: bool },
    Cast { dst: u16, a: u16, from: VarType, to: VarType },
    Store { src: u16, slot: u16, ty: VarType },
}

pub struct CpuProgram {
    pub(crate) instrs: Vec<Instr>,
    pub(crate) n_regs: usize,
}

// ---------------------------------------------------------------------------
// Value encoding: every register is a u64 holding the canonical bits of its
// type (zero-extended integers, IEEE bits for floats, 0/1 for bool).
// ---------------------------------------------------------------------------

pub(crate) fn mask(ty: VarType) -> u64 {
    match ty.size() {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

pub(crate) fn to_i64(bits: u64, ty: VarType) -> i64 {
    match ty.size() {
        1 => bits as u8 as i8 as i64,
        2 => bits as u16 as i16 as i64,
        4 => bits as u32 as i32 as i64,
        _ => bits as i64,
    }
}

pub(crate) fn to_f64(bits: u64, ty: VarType) -> f64 {
    match ty {
        VarType::F16 => f16::from_bits(bits as u16).to_f64(),
        VarType::F32 => f32::from_bits(bits as u32) as f64,
        _ => f64::from_bits(bits),
    }
}

pub(crate) fn from_f64(v: f64, ty: VarType) -> u64 {
    match ty {
        VarType::F16 => f16::from_f64(v).to_bits() as u64,
        VarType::F32 => (v as f32).to_bits() as u64,
        _ => v.to_bits(),
    }
}

pub(crate) unsafe fn load_elem(base: usize, idx: usize, ty: VarType) -> u64 {
    unsafe {
        match ty.size() {
            1 => *(base as *const u8).add(idx) as u64,
            2 => *((base as *const u16).add(idx)) as u64,
            4 => *((base as *const u32).add(idx)) as u64,
            _ => *((base as *const u64).add(idx)),
        }
    }
}

pub(crate) unsafe fn store_elem(base: usize, idx: usize, ty: VarType, bits: u64) {
    unsafe {
        match ty.size() {
            1 => *(base as *mut u8).add(idx) = bits as u8,
            2 => *((base as *mut u16).add(idx)) = bits as u16,
            4 => *((base as *mut u32).add(idx)) = bits as u32,
            _ => *((base as *mut u64).add(idx)) = bits,
        }
    }
}

pub(crate) fn exec_bin(op: BinOp, ty: VarType, a: u64, b: u64) -> u64 {
    if op.is_comparison() {
        let r = if ty.is_float() {
            let (x, y) = (to_f64(a, ty), to_f64(b, ty));
            match op {
                BinOp::Lt => x < y,
                BinOp::Le => x <= y,
                BinOp::Gt => x > y,
                BinOp::Ge => x >= y,
                BinOp::Eq => x == y,
                _ => x != y,
            }
        } else if ty.is_signed() {
            let (x, y) = (to_i64(a, ty), to_i64(b, ty));
            match op {
                BinOp::Lt => x < y,
                BinOp::Le => x <= y,
                BinOp::Gt => x > y,
                BinOp::Ge => x >= y,
                BinOp::Eq => x == y,
                _ => x != y,
            }
        } else {
            match op {
                BinOp::Lt => a < b,
                BinOp::Le => a <= b,
                BinOp::Gt => a > b,
                BinOp::Ge => a >= b,
                BinOp::Eq => a == b,
                _ => a != b,
            }
        };
        return r as u64;
    }

    if ty.is_float() {
        let (x, y) = (to_f64(a, ty), to_f64(b, ty));
        let r = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Mod => x % y,
            BinOp::Min => x.min(y),
            BinOp::Max => x.max(y),
            _ => unreachable!("bitwise float op rejected at append time"),
        };
        return from_f64(r, ty);
    }

    let m = mask(ty);
    if ty.is_signed() {
        let (x, y) = (to_i64(a, ty), to_i64(b, ty));
        let r = match op {
            BinOp::Add => x.wrapping_add(y),
            BinOp::Sub => x.wrapping_sub(y),
            BinOp::Mul => x.wrapping_mul(y),
            BinOp::Div => x.checked_div(y).unwrap_or(0),
            BinOp::Mod => x.checked_rem(y).unwrap_or(0),
            BinOp::And => x & y,
            BinOp::Or => x | y,
            BinOp::Xor => x ^ y,
            BinOp::Shl => x.wrapping_shl(y as u32),
            BinOp::Shr => x.wrapping_shr(y as u32),
            BinOp::Min => x.min(y),
            BinOp::Max => x.max(y),
            _ => unreachable!(),
        };
        (r as u64) & m
    } else {
        let (x, y) = (a & m, b & m);
        let r = match op {
            BinOp::Add => x.wrapping_add(y),
            BinOp::Sub => x.wrapping_sub(y),
            BinOp::Mul => x.wrapping_mul(y),
            BinOp::Div => x.checked_div(y).unwrap_or(0),
            BinOp::Mod => x.checked_rem(y).unwrap_or(0),
            BinOp::And => x & y,
            BinOp::Or => x | y,
            BinOp::Xor => x ^ y,
            BinOp::Shl => x.wrapping_shl(y as u32),
            BinOp::Shr => x.wrapping_shr(y as u32),
            BinOp::Min => x.min(y),
            BinOp::Max => x.max(y),
            _ => unreachable!(),
        };
        r & m
    }
}

pub(crate) fn exec_un(op: UnOp, ty: VarType, a: u64) -> u64 {
    match op {
        UnOp::Not => (a & mask(ty) == 0) as u64,
        UnOp::BitNot => !a & mask(ty),
        UnOp::Neg => {
            if ty.is_float() {
                from_f64(-to_f64(a, ty), ty)
            } else {
                (to_i64(a, ty).wrapping_neg() as u64) & mask(ty)
            }
        }
        UnOp::Abs => {
            if ty.is_float() {
                from_f64(to_f64(a, ty).abs(), ty)
            } else if ty.is_signed() {
                (to_i64(a, ty).wrapping_abs() as u64) & mask(ty)
            } else {
                a
            }
        }
        UnOp::Sqrt => from_f64(to_f64(a, ty).sqrt(), ty),
    }
}

pub(crate) fn cast_bits(bits: u64, from: VarType, to: VarType) -> u64 {
    if from == to {
        return bits;
    }
    match (from.is_float(), to.is_float()) {
        (true, true) => from_f64(to_f64(bits, from), to),
        (true, false) => {
            let v = to_f64(bits, from);
            if to.is_signed() {
                (v as i64 as u64) & mask(to)
            } else {
                (v as u64) & mask(to)
            }
        }
        (false, true) => {
            if from.is_signed() {
                from_f64(to_i64(bits, from) as f64, to)
            } else {
                from_f64((bits & mask(from)) as f64, to)
            }
        }
        (false, false) => {
            if to == VarType::Bool {
                (bits & mask(from) != 0) as u64
            } else if from.is_signed() {
                (to_i64(bits, from) as u64) & mask(to)
            } else {
                bits & mask(from) & mask(to)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Register/type pair of a resolved operand.
#[derive(Clone, Copy)]
pub(crate) struct Operand {
    pub reg: u16,
    pub ty: VarType,
}

pub(crate) struct Builder {
    pub instrs: Vec<Instr>,
    pub next_reg: u16,
}

impl Builder {
    pub fn new(first_tmp: u16) -> Self {
        Builder { instrs: Vec::new(), next_reg: first_tmp }
    }

    fn tmp(&mut self) -> u16 {
        let r = self.next_reg;
        self.next_reg += 1;
        r
    }

    pub fn finish(self) -> CpuProgram {
        CpuProgram { instrs: self.instrs, n_regs: self.next_reg as usize }
    }

    /// Compile one scheduled statement, leaving its value in `out.reg`.
    pub fn stmt(&mut self, stmt: &Stmt, out: Operand, deps: &[Operand]) -> Result<()> {
        match stmt {
            Stmt::Assign(e) => {
                let (reg, ty) = self.expr(e, out.ty, out.ty, deps)?;
                if ty != out.ty {
                    self.instrs.push(Instr::Cast { dst: out.reg, a: reg, from: ty, to: out.ty });
                } else if reg != out.reg {
                    self.instrs.push(Instr::Cast { dst: out.reg, a: reg, from: ty, to: ty });
                }
                Ok(())
            }
            Stmt::Scatter { ptr, value, index, add } => {
                let (val, vty) = self.expr(value, out.ty, out.ty, deps)?;
                let val = self.coerce(val, vty, out.ty);
                let (idx, ity) = self.expr(index, VarType::U32, out.ty, deps)?;
                let idx = self.coerce(idx, ity, VarType::U32);
                self.instrs.push(Instr::Scatter {
                    ptr: deps[*ptr as usize - 1].reg,
                    val,
                    idx,
                    ty: out.ty,
                    add: *add,
                });
                Ok(())
            }
        }
    }

    fn coerce(&mut self, reg: u16, from: VarType, to: VarType) -> u16 {
        if from == to {
            return reg;
        }
        let dst = self.tmp();
        self.instrs.push(Instr::Cast { dst, a: reg, from, to });
        dst
    }

    fn expr(
        &mut self,
        e: &Expr,
        ctx: VarType,
        out_ty: VarType,
        deps: &[Operand],
    ) -> Result<(u16, VarType)> {
        let dep_tys: Vec<VarType> = deps.iter().map(|o| o.ty).collect();
        let ty = crate::stmt::check_expr(e, ctx, out_ty, &dep_tys)?;
        let reg = match e {
            Expr::Reg(r) => return Ok((deps[*r as usize - 1].reg, dep_tys[*r as usize - 1])),
            Expr::Index => {
                let dst = self.tmp();
                self.instrs.push(Instr::Index { dst });
                dst
            }
            Expr::Int(v) => {
                let bits = if ty.is_float() {
                    from_f64(*v as f64, ty)
                } else {
                    (*v as u64) & mask(ty)
                };
                let dst = self.tmp();
                self.instrs.push(Instr::Const { dst, bits });
                dst
            }
            Expr::Float(v) => {
                let bits = if ty.is_float() {
                    from_f64(*v, ty)
                } else {
                    (*v as i64 as u64) & mask(ty)
                };
                let dst = self.tmp();
                self.instrs.push(Instr::Const { dst, bits });
                dst
            }
            Expr::Un(op, a) => {
                let (ra, ta) = self.expr(a, ty, out_ty, deps)?;
                let dst = self.tmp();
                self.instrs.push(Instr::Un { dst, op: *op, a: ra, ty: ta });
                dst
            }
            Expr::Bin(op, a, b) => {
                let operand_ctx = if op.is_comparison() {
                    crate::stmt::known_ty(a, out_ty, &dep_tys)
                        .or_else(|| crate::stmt::known_ty(b, out_ty, &dep_tys))
                        .unwrap_or(VarType::I32)
                } else {
                    ty
                };
                let (ra, ta) = self.expr(a, operand_ctx, out_ty, deps)?;
                let (rb, _) = self.expr(b, ta, out_ty, deps)?;
                let dst = self.tmp();
                self.instrs.push(Instr::Bin { dst, op: *op, a: ra, b: rb, ty: ta });
                dst
            }
            Expr::Select(c, a, b) => {
                let (rc, _) = self.expr(c, VarType::Bool, out_ty, deps)?;
                let (ra, ta) = self.expr(a, ty, out_ty, deps)?;
                let (rb, _) = self.expr(b, ta, out_ty, deps)?;
                let dst = self.tmp();
                self.instrs.push(Instr::Select { dst, c: rc, a: ra, b: rb });
                dst
            }
            Expr::Gather(p, idx) => {
                let (ri, ity) = self.expr(idx, VarType::U32, out_ty, deps)?;
                let ri = self.coerce(ri, ity, VarType::U32);
                let dst = self.tmp();
                self.instrs.push(Instr::Gather {
                    dst,
                    ptr: deps[*p as usize - 1].reg,
                    idx: ri,
                    ty: out_ty,
                });
                dst
            }
        };
        Ok((reg, ty))
    }

    pub fn load(&mut self, dst: u16, slot: u16, ty: VarType, broadcast: bool) {
        if ty == VarType::Ptr {
            self.instrs.push(Instr::Value { dst, slot });
        } else {
            self.instrs.push(Instr::Load { dst, slot, ty, broadcast });
        }
    }

    pub fn store(&mut self, src: u16, slot: u16, ty: VarType) {
        self.instrs.push(Instr::Store { src, slot, ty });
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

impl CpuProgram {
    /// Execute the program over `[start, end)`. `params` holds one buffer
    /// base address (or pointer-literal value) per parameter slot.
    pub(crate) fn run_range(&self, params: &[usize], start: u32, end: u32) -> Result<()> {
        let mut regs = vec![0u64; self.n_regs];
        for i in start..end {
            for instr in &self.instrs {
                match *instr {
                    Instr::Load { dst, slot, ty, broadcast } => {
                        let idx = if broadcast { 0 } else { i as usize };
                        regs[dst as usize] = unsafe { load_elem(params[slot as usize], idx, ty) };
                    }
                    Instr::Value { dst, slot } => {
                        regs[dst as usize] = params[slot as usize] as u64;
                    }
                    Instr::Index { dst } => regs[dst as usize] = i as u64,
                    Instr::Const { dst, bits } => regs[dst as usize] = bits,
                    Instr::Un { dst, op, a, ty } => {
                        regs[dst as usize] = exec_un(op, ty, regs[a as usize]);
                    }
                    Instr::Bin { dst, op, a, b, ty } => {
                        regs[dst as usize] = exec_bin(op, ty, regs[a as usize], regs[b as usize]);
                    }
                    Instr::Select { dst, c, a, b } => {
                        regs[dst as usize] = if regs[c as usize] != 0 {
                            regs[a as usize]
                        } else {
                            regs[b as usize]
                        };
                    }
                    Instr::Gather { dst, ptr, idx, ty } => {
                        let base = regs[ptr as usize] as usize;
                        regs[dst as usize] =
                            unsafe { load_elem(base, regs[idx as usize] as usize, ty) };
                    }
                    Instr::Scatter { ptr, val, idx, ty, add } => {
                        let base = regs[ptr as usize] as usize;
                        let index = regs[idx as usize] as usize;
                        let bits = regs[val as usize];
                        if add {
                            scatter_add(base, index, ty, bits);
                        } else {
                            scatter_store(base, index, ty, bits);
                        }
                    }
                    Instr::Cast { dst, a, from, to } => {
                        regs[dst as usize] = cast_bits(regs[a as usize], from, to);
                    }
                    Instr::Store { src, slot, ty } => {
                        unsafe {
                            store_elem(params[slot as usize], i as usize, ty, regs[src as usize])
                        };
                    }
                }
            }
        }
        Ok(())
    }
}

/// Scattered stores may collide across lanes; which value wins is
/// unspecified, but every store is atomic.
fn scatter_store(base: usize, index: usize, ty: VarType, bits: u64) {
    use std::sync::atomic::{AtomicU8, AtomicU16};
    unsafe {
        match ty.size() {
            1 => (*((base as *const u8).add(index) as *const AtomicU8))
                .store(bits as u8, Ordering::Relaxed),
            2 => (*((base as *const u16).add(index) as *const AtomicU16))
                .store(bits as u16, Ordering::Relaxed),
            4 => (*((base as *const u32).add(index) as *const AtomicU32))
                .store(bits as u32, Ordering::Relaxed),
            _ => (*((base as *const u64).add(index) as *const AtomicU64))
                .store(bits, Ordering::Relaxed),
        }
    }
}

/// Atomic accumulation matching the accelerator's atomicAdd contract.
fn scatter_add(base: usize, index: usize, ty: VarType, bits: u64) {
    unsafe {
        match ty {
            VarType::I32 | VarType::U32 => {
                let p = &*((base as *const u32).add(index) as *const AtomicU32);
                p.fetch_add(bits as u32, Ordering::Relaxed);
            }
            VarType::I64 | VarType::U64 => {
                let p = &*((base as *const u64).add(index) as *const AtomicU64);
                p.fetch_add(bits, Ordering::Relaxed);
            }
            VarType::F32 => {
                let p = &*((base as *const u32).add(index) as *const AtomicU32);
                let mut old = p.load(Ordering::Relaxed);
                loop {
                    let new = (f32::from_bits(old) + f32::from_bits(bits as u32)).to_bits();
                    match p.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
                        Ok(_) => break,
                        Err(v) => old = v,
                    }
                }
            }
            VarType::F64 => {
                let p = &*((base as *const u64).add(index) as *const AtomicU64);
                let mut old = p.load(Ordering::Relaxed);
                loop {
                    let new = (f64::from_bits(old) + f64::from_bits(bits)).to_bits();
                    match p.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
                        Ok(_) => break,
                        Err(v) => old = v,
                    }
                }
            }
            _ => unreachable!("rejected at append time"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_wraps_to_width() {
        let r = exec_bin(BinOp::Add, VarType::U8, 250, 10);
        assert_eq!(r, 4);
    }

    #[test]
    fn int_division_by_zero_is_zero() {
        assert_eq!(exec_bin(BinOp::Div, VarType::I32, 7, 0), 0);
        assert_eq!(exec_bin(BinOp::Mod, VarType::U32, 7, 0), 0);
    }

    #[test]
    fn float_bits_round_trip() {
        let bits = from_f64(1.5, VarType::F32);
        assert_eq!(to_f64(bits, VarType::F32), 1.5);
        let h = from_f64(2.0, VarType::F16);
        assert_eq!(to_f64(h, VarType::F16), 2.0);
    }

    #[test]
    fn casts() {
        assert_eq!(cast_bits(from_f64(3.7, VarType::F32), VarType::F32, VarType::I32), 3);
        assert_eq!(cast_bits(5, VarType::U32, VarType::F32), (5.0f32).to_bits() as u64);
        assert_eq!(cast_bits(2, VarType::U32, VarType::Bool), 1);
    }
}
