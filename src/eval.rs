//! Scheduler / evaluator.
//!
//! Evaluation materializes the transitive closure of the active stream's
//! scheduled variables and pending side effects. The closure is walked in
//! post-order, stably sorted by size, and partitioned into one kernel per
//! size group. Register indices are assigned densely in schedule order so
//! that structurally identical programs produce byte-identical source: the
//! kernel cache key.
//!
//! The engine lock is held while the plan is built and released around
//! backend compilation and CPU execution; a dedicated evaluation lock keeps
//! a second thread from entering during those windows.

use std::sync::Arc;

use itertools::Itertools;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, trace};

use crate::cpu::program::{Builder, CpuProgram, Operand};
use crate::error::{Error, Result};
use crate::malloc::AllocType;
use crate::state::{self, Kernel, KernelKey, State};
use crate::stmt::{BinOp, Expr, Stmt, UnOp};
use crate::types::{Backend, VarType};

#[derive(Clone, Copy)]
struct ScheduledVar {
    size: u32,
    id: u32,
}

#[derive(Clone, Copy, PartialEq)]
enum Class {
    /// Materialized buffer (or pointer literal) passed as a parameter.
    Input,
    /// Freshly allocated buffer stored from the kernel.
    Output,
    /// Computed in registers only.
    Register,
}

struct Member {
    id: u32,
    reg: u32,
    class: Class,
    ty: VarType,
    size: u32,
    data: usize,
    stmt: Option<String>,
    dep: [u32; 3],
}

struct PlannedKernel {
    size: u32,
    source: String,
    /// Buffer addresses / pointer-literal values, one per parameter slot.
    params: Vec<usize>,
    outputs: Vec<(u32, usize)>,
    artifact: Option<Kernel>,
    blocks: u32,
    threads: u32,
}

struct Plan {
    backend: Backend,
    device: i32,
    schedule: Vec<ScheduledVar>,
    outputs_set: FxHashSet<u32>,
    /// Buffer addresses the scheduled scatter statements write through;
    /// only these targets have their pending-write flag cleared afterwards.
    effect_targets: Vec<usize>,
    kernels: Vec<PlannedKernel>,
}

/// Evaluate everything scheduled on the calling thread's active stream.
pub fn eval() -> Result<()> {
    if state::active_stream_key().is_none() {
        return Ok(());
    }

    // The main lock is released at several points below; the eval lock keeps
    // other threads from starting a second evaluation meanwhile.
    let _eval_guard = state::EVAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut st = state::lock();

    let mut plan = match build_plan(&mut st) {
        Ok(plan) => plan,
        Err(e) => return Err(e),
    };
    if plan.kernels.is_empty() {
        return Ok(());
    }
    info!(
        kernels = plan.kernels.len(),
        backend = %plan.backend,
        "eval: launching"
    );

    match plan.backend {
        Backend::Cuda => {
            let stream = st.active_cuda()?.ok_or_else(|| {
                Error::usage("evaluation of accelerator variables requires their stream")
            })?;
            // Compile cache misses with the lock released.
            let missing: Vec<(usize, String)> = plan
                .kernels
                .iter()
                .enumerate()
                .filter(|(_, k)| k.artifact.is_none())
                .map(|(i, k)| (i, k.source.clone()))
                .collect();
            if !missing.is_empty() {
                drop(st);
                let mut compiled = Vec::with_capacity(missing.len());
                for (i, source) in missing {
                    let (module, func) = match crate::cuda::compile(&stream, &source, "flint_kernel")
                    {
                        Ok(pair) => pair,
                        Err(e) => {
                            let mut st = state::lock();
                            abort_plan(&mut st, &plan);
                            return Err(e);
                        }
                    };
                    compiled.push((i, source, Kernel::Cuda { module, func }));
                }
                st = state::lock();
                for (i, source, kernel) in compiled {
                    st.kernel_misses += 1;
                    st.kernel_cache.insert(
                        KernelKey { backend: Backend::Cuda, device: plan.device, source },
                        kernel.clone(),
                    );
                    plan.kernels[i].artifact = Some(kernel);
                }
            }
            for kernel in &plan.kernels {
                let Some(Kernel::Cuda { func, .. }) = &kernel.artifact else {
                    unreachable!("artifact installed above");
                };
                let params: Vec<u64> = kernel.params.iter().map(|p| *p as u64).collect();
                if let Err(e) = crate::cuda::launch_fused(
                    &stream,
                    func,
                    kernel.blocks,
                    kernel.threads,
                    kernel.size,
                    &params,
                ) {
                    abort_plan(&mut st, &plan);
                    return Err(e);
                }
                st.kernel_launches += 1;
                trace!(size = kernel.size, "eval: kernel launched");
            }
            // Gate buffer reuse on the work submitted above.
            st.free_flush()?;
            finish(&mut st, &plan);
        }
        Backend::Cpu => {
            // Execution blocks until the workers drain, so run it unlocked.
            drop(st);
            for kernel in &plan.kernels {
                let Some(Kernel::Cpu { program }) = &kernel.artifact else {
                    unreachable!("cpu programs are built during planning");
                };
                let result = crate::cpu::launch(program, &kernel.params, kernel.size);
                if let Err(e) = result {
                    let mut st = state::lock();
                    abort_plan(&mut st, &plan);
                    return Err(e);
                }
            }
            let mut st = state::lock();
            st.kernel_launches += plan.kernels.len() as u64;
            st.free_flush()?;
            finish(&mut st, &plan);
        }
    }
    Ok(())
}

fn build_plan(st: &mut State) -> Result<Plan> {
    let (backend, device) = {
        let stream = st.active()?;
        (stream.backend(), stream.device)
    };
    let scheduled = std::mem::take(&mut st.active()?.scheduled);
    let side_effects = std::mem::take(&mut st.active()?.side_effects);

    let mut visited: FxHashSet<(u32, u32)> = FxHashSet::default();
    let mut schedule: Vec<ScheduledVar> = Vec::new();
    let mut outputs_set: FxHashSet<u32> = FxHashSet::default();

    for (roots, is_side_effect) in [(&scheduled, false), (&side_effects, true)] {
        for &id in roots {
            let Some(v) = st.variables.get(&id) else { continue };
            if v.is_data() && !v.dirty {
                if is_side_effect && v.side_effect {
                    // Already materialized by an earlier pass; release the
                    // engine's keep-alive reference.
                    st.variables.get_mut(&id).unwrap().side_effect = false;
                    st.var_dec_ref_ext(id)?;
                }
                continue;
            }
            let size = v.size;
            traverse(st, &mut visited, &mut schedule, size, id)?;
            if !st.var(id)?.stmt_is_effect {
                outputs_set.insert(id);
            }
        }
    }

    // Record where the scheduled scatters write, while their operand
    // edges are still intact.
    let mut effect_targets = Vec::new();
    for sv in &schedule {
        let Ok(v) = st.var(sv.id) else { continue };
        if !v.stmt_is_effect {
            continue;
        }
        let Some(stmt) = v.stmt.as_deref() else { continue };
        let deps: Vec<u32> = v.dep.iter().copied().filter(|d| *d != 0).collect();
        if let Ok(Stmt::Scatter { ptr, .. }) = crate::stmt::parse(stmt, deps.len())
            && let Ok(target) = st.var(deps[ptr as usize - 1])
        {
            effect_targets.push(target.data);
        }
    }

    if schedule.is_empty() {
        return Ok(Plan {
            backend,
            device,
            schedule,
            outputs_set,
            effect_targets,
            kernels: Vec::new(),
        });
    }

    // Group by size, large fronts first; the sort is stable so the
    // post-order within a group survives.
    schedule.sort_by(|a, b| b.size.cmp(&a.size));

    let chunked = schedule.iter().chunk_by(|sv| sv.size);
    let mut kernels: Vec<PlannedKernel> = Vec::new();
    for (_, group) in &chunked {
        let group: Vec<ScheduledVar> = group.copied().collect();
        match assemble(st, backend, device, &group, &outputs_set) {
            Ok(kernel) => kernels.push(kernel),
            Err(e) => {
                for kernel in &kernels {
                    for (_, ptr) in &kernel.outputs {
                        let _ = st.free_ptr(*ptr);
                    }
                }
                return Err(e);
            }
        }
    }
    drop(chunked);

    Ok(Plan { backend, device, schedule, outputs_set, effect_targets, kernels })
}

/// Iterative post-order walk over unevaluated operands.
fn traverse(
    st: &State,
    visited: &mut FxHashSet<(u32, u32)>,
    schedule: &mut Vec<ScheduledVar>,
    size: u32,
    root: u32,
) -> Result<()> {
    if !visited.insert((size, root)) {
        return Ok(());
    }
    let mut stack: Vec<(u32, usize)> = vec![(root, 0)];
    while let Some((id, child)) = stack.last_mut() {
        let id = *id;
        let v = st.var(id)?;
        // Materialized variables are leaves; any operand edges they still
        // carry (permutation views) exist for lifetime only.
        if *child < 3 && !v.is_data() {
            let d = v.dep[*child];
            *child += 1;
            if d != 0 && visited.insert((size, d)) {
                stack.push((d, 0));
            }
        } else {
            schedule.push(ScheduledVar { size, id });
            stack.pop();
        }
    }
    Ok(())
}

fn assemble(
    st: &mut State,
    backend: Backend,
    device: i32,
    group: &[ScheduledVar],
    outputs_set: &FxHashSet<u32>,
) -> Result<PlannedKernel> {
    let size = group[0].size;

    // Pass 1: classify members and assign dense register indices.
    let mut members = Vec::with_capacity(group.len());
    let mut reg_map: FxHashMap<u32, u32> = FxHashMap::default();
    let mut next_reg = 1u32;
    for sv in group {
        let v = st.var(sv.id)?;
        if v.placeholder {
            return Err(Error::usage(format!(
                "placeholder variable {} cannot be evaluated",
                sv.id
            )));
        }
        if v.size != 1 && v.size != size {
            return Err(Error::usage(format!(
                "variable {} has size {} but was scheduled in a kernel of size {size}",
                sv.id, v.size
            )));
        }
        let class = if v.is_data() {
            Class::Input
        } else if outputs_set.contains(&sv.id) && v.size == size && !v.stmt_is_effect {
            Class::Output
        } else {
            Class::Register
        };
        let reg = next_reg;
        next_reg += 1;
        reg_map.insert(sv.id, reg);
        members.push(Member {
            id: sv.id,
            reg,
            class,
            ty: v.ty,
            size: v.size,
            data: v.data,
            stmt: v.stmt.as_ref().map(|s| s.to_string()),
            dep: v.dep,
        });
    }

    // Pass 2: lay out the parameter slots. Output buffers are allocated
    // only after every fallible step, so a rejected statement leaves no
    // allocation behind.
    let mut params: Vec<usize> = Vec::new();
    let mut slots: FxHashMap<u32, usize> = FxHashMap::default();
    let mut output_members: Vec<(u32, usize, usize)> = Vec::new();
    for member in &members {
        match member.class {
            Class::Input => {
                slots.insert(member.id, params.len());
                params.push(member.data);
            }
            Class::Output => {
                slots.insert(member.id, params.len());
                output_members.push((member.id, params.len(), member.ty.size()));
                params.push(0);
            }
            Class::Register => {}
        }
    }

    // Pass 3: render the kernel source (the cache key for both backends)
    // and, on the CPU, build the register program.
    let source = render_source(&members, &reg_map, &slots)?;

    let key = KernelKey { backend, device, source };
    let mut artifact = st.kernel_cache.get(&key).cloned();
    if artifact.is_some() {
        st.kernel_hits += 1;
    } else if backend == Backend::Cpu {
        let program = Arc::new(build_cpu_program(&members, &reg_map, &slots)?);
        let kernel = Kernel::Cpu { program };
        st.kernel_misses += 1;
        st.kernel_cache.insert(key.clone(), kernel.clone());
        artifact = Some(kernel);
    }

    // Pass 4: allocate the output buffers and patch them into the slots.
    let out_class = if backend == Backend::Cuda {
        AllocType::Device
    } else {
        AllocType::HostAsync
    };
    let mut outputs: Vec<(u32, usize)> = Vec::new();
    for (id, slot, elem_size) in output_members {
        let ptr = match st.malloc(out_class, size as usize * elem_size) {
            Ok(ptr) => ptr,
            Err(e) => {
                for (_, ptr) in &outputs {
                    let _ = st.free_ptr(*ptr);
                }
                return Err(e);
            }
        };
        params[slot] = ptr;
        outputs.push((id, ptr));
    }

    let (blocks, threads) = if backend == Backend::Cuda {
        st.device(device)?.launch_config(size, None, None)
    } else {
        (0, 0)
    };

    debug!(
        size,
        members = members.len(),
        params = params.len(),
        cached = artifact.is_some(),
        "eval: assembled kernel"
    );

    Ok(PlannedKernel {
        size,
        source: key.source,
        params,
        outputs,
        artifact,
        blocks,
        threads,
    })
}

/// Resolve a member's operand registers and types.
fn operand_info(member: &Member, members: &[Member], reg_map: &FxHashMap<u32, u32>) -> Vec<Operand> {
    member
        .dep
        .iter()
        .filter(|d| **d != 0)
        .map(|d| {
            let reg = reg_map[d];
            let ty = members.iter().find(|m| m.id == *d).map(|m| m.ty).unwrap();
            Operand { reg: reg as u16, ty }
        })
        .collect()
}

fn build_cpu_program(
    members: &[Member],
    reg_map: &FxHashMap<u32, u32>,
    slots: &FxHashMap<u32, usize>,
) -> Result<CpuProgram> {
    let mut builder = Builder::new(members.len() as u16 + 1);
    for member in members {
        let reg = member.reg as u16;
        match member.class {
            Class::Input => {
                builder.load(reg, slots[&member.id] as u16, member.ty, member.size == 1);
            }
            Class::Output | Class::Register => {
                let stmt = member.stmt.as_deref().ok_or_else(|| {
                    Error::usage(format!("variable {} has neither data nor statement", member.id))
                })?;
                let deps = operand_info(member, members, reg_map);
                let parsed = crate::stmt::parse(stmt, deps.len())?;
                builder.stmt(&parsed, Operand { reg, ty: member.ty }, &deps)?;
                if member.class == Class::Output {
                    builder.store(reg, slots[&member.id] as u16, member.ty);
                }
            }
        }
    }
    Ok(builder.finish())
}

// ---------------------------------------------------------------------------
// Source rendering
// ---------------------------------------------------------------------------

fn render_source(
    members: &[Member],
    reg_map: &FxHashMap<u32, u32>,
    slots: &FxHashMap<u32, usize>,
) -> Result<String> {
    use std::fmt::Write;

    let uses_f16 = members.iter().any(|m| m.ty == VarType::F16);
    let mut src = String::new();
    if uses_f16 {
        src.push_str("#include <cuda_fp16.h>\n");
    }
    src.push_str("extern \"C\" __global__ void flint_kernel(unsigned int n");
    for slot in 0..slots.len() {
        let _ = write!(src, ", unsigned long long a{slot}");
    }
    src.push_str(") {\n");
    for member in members {
        if member.class == Class::Output {
            let cty = member.ty.cuda_name();
            let _ = writeln!(src, "    {cty} *q{} = ({cty} *) a{};", member.reg, slots[&member.id]);
        } else if member.class == Class::Input && member.ty != VarType::Ptr {
            let cty = member.ty.cuda_name();
            let _ = writeln!(
                src,
                "    const {cty} *p{} = (const {cty} *) a{};",
                member.reg, slots[&member.id]
            );
        }
    }
    src.push_str(
        "    for (unsigned int i = blockIdx.x * blockDim.x + threadIdx.x; i < n; \
         i += blockDim.x * gridDim.x) {\n",
    );
    for member in members {
        match member.class {
            Class::Input => {
                if member.ty == VarType::Ptr {
                    let _ = writeln!(
                        src,
                        "        unsigned long long v{} = a{};",
                        member.reg, slots[&member.id]
                    );
                } else {
                    let idx = if member.size == 1 { "0" } else { "i" };
                    let _ = writeln!(
                        src,
                        "        {} v{} = p{}[{idx}];",
                        member.ty.cuda_name(),
                        member.reg,
                        member.reg
                    );
                }
            }
            Class::Output | Class::Register => {
                let stmt = member.stmt.as_deref().ok_or_else(|| {
                    Error::usage(format!("variable {} has neither data nor statement", member.id))
                })?;
                let deps = operand_info(member, members, reg_map);
                let parsed = crate::stmt::parse(stmt, deps.len())?;
                match &parsed {
                    Stmt::Assign(e) => {
                        let (text, _) = render_expr(e, member.ty, member.ty, &deps);
                        let _ = writeln!(
                            src,
                            "        {} v{} = {text};",
                            member.ty.cuda_name(),
                            member.reg
                        );
                    }
                    Stmt::Scatter { ptr, value, index, add } => {
                        let cty = member.ty.cuda_name();
                        let p = format!("v{}", deps[*ptr as usize - 1].reg);
                        let (val, _) = render_expr(value, member.ty, member.ty, &deps);
                        let (idx, _) = render_expr(index, VarType::U32, member.ty, &deps);
                        if *add {
                            let _ = writeln!(
                                src,
                                "        atomicAdd(({cty} *) {p} + ({idx}), ({cty}) {val});"
                            );
                        } else {
                            let _ = writeln!(
                                src,
                                "        (({cty} *) {p})[{idx}] = ({cty}) {val};"
                            );
                        }
                    }
                }
                if member.class == Class::Output {
                    let _ = writeln!(src, "        q{}[i] = v{};", member.reg, member.reg);
                }
            }
        }
    }
    src.push_str("    }\n}\n");
    Ok(src)
}

/// Render an expression to C, mirroring the CPU compiler's typing rules so
/// both backends agree on every intermediate.
fn render_expr(
    e: &Expr,
    ctx: VarType,
    out_ty: VarType,
    deps: &[Operand],
) -> (String, VarType) {
    let dep_tys: Vec<VarType> = deps.iter().map(|o| o.ty).collect();
    match e {
        Expr::Reg(r) => (format!("v{}", deps[*r as usize - 1].reg), dep_tys[*r as usize - 1]),
        Expr::Index => ("i".to_string(), VarType::U32),
        Expr::Int(v) => (format!("{v}"), ctx),
        Expr::Float(v) => (format!("{v:?}"), ctx),
        Expr::Un(op, a) => {
            let (ta, ty) = render_expr(a, ctx, out_ty, deps);
            let text = match op {
                UnOp::Neg => format!("-({ta})"),
                UnOp::Not => format!("!({ta})"),
                UnOp::BitNot => format!("~({ta})"),
                UnOp::Abs => match ty {
                    VarType::F32 => format!("fabsf({ta})"),
                    VarType::F64 => format!("fabs({ta})"),
                    VarType::F16 => format!("(__half) fabsf((float) ({ta}))"),
                    _ => format!("(({ta}) < 0 ? -({ta}) : ({ta}))"),
                },
                UnOp::Sqrt => match ty {
                    VarType::F64 => format!("sqrt({ta})"),
                    VarType::F16 => format!("(__half) sqrtf((float) ({ta}))"),
                    _ => format!("sqrtf({ta})"),
                },
            };
            let ty = if *op == UnOp::Not { VarType::Bool } else { ty };
            (text, ty)
        }
        Expr::Bin(op, a, b) => {
            let operand_ctx = if op.is_comparison() {
                crate::stmt::known_ty(a, out_ty, &dep_tys)
                    .or_else(|| crate::stmt::known_ty(b, out_ty, &dep_tys))
                    .unwrap_or(VarType::I32)
            } else {
                ctx
            };
            let (ta, ty) = render_expr(a, operand_ctx, out_ty, deps);
            let (tb, _) = render_expr(b, ty, out_ty, deps);
            let text = match op {
                BinOp::Min => format!("(({ta}) < ({tb}) ? ({ta}) : ({tb}))"),
                BinOp::Max => format!("(({ta}) > ({tb}) ? ({ta}) : ({tb}))"),
                _ => {
                    let sym = match op {
                        BinOp::Add => "+",
                        BinOp::Sub => "-",
                        BinOp::Mul => "*",
                        BinOp::Div => "/",
                        BinOp::Mod => "%",
                        BinOp::And => "&",
                        BinOp::Or => "|",
                        BinOp::Xor => "^",
                        BinOp::Shl => "<<",
                        BinOp::Shr => ">>",
                        BinOp::Lt => "<",
                        BinOp::Le => "<=",
                        BinOp::Gt => ">",
                        BinOp::Ge => ">=",
                        BinOp::Eq => "==",
                        BinOp::Ne => "!=",
                        BinOp::Min | BinOp::Max => unreachable!(),
                    };
                    format!("(({ta}) {sym} ({tb}))")
                }
            };
            let ty = if op.is_comparison() { VarType::Bool } else { ty };
            (text, ty)
        }
        Expr::Select(c, a, b) => {
            let (tc, _) = render_expr(c, VarType::Bool, out_ty, deps);
            let branch_ctx = crate::stmt::known_ty(a, out_ty, &dep_tys)
                .or_else(|| crate::stmt::known_ty(b, out_ty, &dep_tys))
                .unwrap_or(out_ty);
            let (ta, ty) = render_expr(a, branch_ctx, out_ty, deps);
            let (tb, _) = render_expr(b, ty, out_ty, deps);
            (format!("(({tc}) ? ({ta}) : ({tb}))"), ty)
        }
        Expr::Gather(p, idx) => {
            let (ti, _) = render_expr(idx, VarType::U32, out_ty, deps);
            let cty = out_ty.cuda_name();
            let preg = format!("v{}", deps[*p as usize - 1].reg);
            (format!("((const {cty} *) {preg})[{ti}]"), out_ty)
        }
    }
}

fn abort_plan(st: &mut State, plan: &Plan) {
    for kernel in &plan.kernels {
        for (_, ptr) in &kernel.outputs {
            let _ = st.free_ptr(*ptr);
        }
    }
}

/// Post-launch cleanup: assign output buffers, drop statements and operand
/// edges of everything that materialized, and clear dirty flags on the
/// backend now that pending writes have run.
fn finish(st: &mut State, plan: &Plan) {
    let mut out_ptr: FxHashMap<u32, usize> = plan
        .kernels
        .iter()
        .flat_map(|k| k.outputs.iter().copied())
        .collect();

    for sv in &plan.schedule {
        let Some(v) = st.variables.get(&sv.id) else { continue };
        let is_output = plan.outputs_set.contains(&sv.id);
        if !(is_output || v.side_effect) {
            continue;
        }
        let cse_key = v.in_cse.then(|| st.cse_key(v));
        let v = st.variables.get_mut(&sv.id).unwrap();
        v.in_cse = false;
        v.stmt = None;
        if is_output
            && v.size == sv.size
            && v.data == 0
            && let Some(ptr) = out_ptr.remove(&sv.id)
        {
            v.data = ptr;
        }
        let deps = std::mem::take(&mut v.dep);
        let was_side_effect = v.side_effect;
        v.side_effect = false;
        v.dirty = false;
        if let Some(key) = cse_key {
            st.cse_cache.remove(&key);
        }
        for d in deps {
            let _ = st.var_dec_ref_int(d);
        }
        if was_side_effect {
            let _ = st.var_dec_ref_ext(sv.id);
        }
    }

    // A variable destroyed while the lock was released leaves its fresh
    // buffer unclaimed; return it to the pool.
    for (_, ptr) in out_ptr {
        let _ = st.free_ptr(ptr);
    }

    // The scatters that just ran wrote through pointers; clear the
    // pending-write flag on exactly the variables whose buffers they
    // targeted. Writes still queued on other streams stay dirty.
    for v in st.variables.values_mut() {
        if v.dirty && v.data != 0 {
            let end = v.data + v.size as usize * v.ty.size();
            if plan.effect_targets.iter().any(|t| *t >= v.data && *t < end) {
                v.dirty = false;
            }
        }
    }
    debug!("eval: done");
}
