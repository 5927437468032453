//! The variable table: the tracing IR.
//!
//! Every traced operation is a `Variable` in a dense id-indexed table. A
//! variable is either *unevaluated* (it carries a statement template and
//! operand ids) or *materialized* (it carries a buffer pointer and nothing
//! else). Two reference counts govern lifetime: `ref_count_int` counts
//! operand edges from other variables, `ref_count_ext` counts client
//! handles. When both reach zero the variable is destroyed, its operands
//! decremented and its buffer returned to the pool.
//!
//! Because ids are handed out monotonically and an operand can only name an
//! existing id, the dataflow graph is acyclic by construction and reference
//! counting alone suffices to collect it.

use std::borrow::Cow;

use tracing::trace;

use crate::error::{Error, Result};
use crate::state::{self, State, VariableKey};
use crate::types::{Backend, VarType};

pub(crate) struct Variable {
    /// Statement template; `None` once materialized (or for placeholders).
    pub stmt: Option<Cow<'static, str>>,
    /// Operand ids; 0 means absent.
    pub dep: [u32; 3],
    /// Buffer pointer; non-zero iff materialized.
    pub data: usize,
    /// Element count.
    pub size: u32,
    pub ty: VarType,
    pub backend: Backend,
    pub ref_count_int: u32,
    pub ref_count_ext: u32,
    /// Borrowed buffer: do not return `data` to the pool on destruction.
    pub retain_data: bool,
    /// Pending writes (scatters) have not been evaluated yet.
    pub dirty: bool,
    /// Symbolic input used while tracing recorded control flow.
    pub placeholder: bool,
    /// Must be evaluated even without external references.
    pub side_effect: bool,
    /// `data` does not point at the beginning of an allocation.
    pub unaligned: bool,
    /// The statement is an effect (scatter) and defines no value.
    pub stmt_is_effect: bool,
    /// Present in the CSE cache (so finalization knows to remove it).
    pub in_cse: bool,
    /// A vcall dispatch table is cached under this variable's id.
    pub vcall_cached: bool,
    pub label: Option<String>,
}

impl Variable {
    pub fn is_data(&self) -> bool {
        self.data != 0
    }
}

impl State {
    pub(crate) fn var(&self, id: u32) -> Result<&Variable> {
        self.variables
            .get(&id)
            .ok_or_else(|| Error::usage(format!("unknown variable {id}")))
    }

    pub(crate) fn var_mut(&mut self, id: u32) -> Result<&mut Variable> {
        self.variables
            .get_mut(&id)
            .ok_or_else(|| Error::usage(format!("unknown variable {id}")))
    }

    pub(crate) fn cse_key(&self, v: &Variable) -> VariableKey {
        VariableKey {
            stmt: v.stmt.as_deref().unwrap_or("").to_string(),
            size: v.size,
            dep: v.dep,
            ty: v.ty,
            backend: v.backend,
        }
    }

    fn insert_var(&mut self, v: Variable) -> u32 {
        let id = self.variable_index;
        self.variable_index += 1;
        self.variables.insert(id, v);
        id
    }

    /// Append a traced operation, folding it onto an equivalent live node
    /// when the statement is CSE-eligible. Returns an owned handle (one
    /// external reference) either way.
    pub(crate) fn trace_append(
        &mut self,
        ty: VarType,
        stmt: Cow<'static, str>,
        deps: &[u32],
        unique: bool,
        size_override: Option<u32>,
    ) -> Result<u32> {
        if deps.len() > 3 {
            return Err(Error::usage("a statement takes at most three operands"));
        }
        let backend = self.active_backend()?;
        let parsed = crate::stmt::parse(&stmt, deps.len())?;
        let effect = parsed.is_effect();

        // Validate operands and derive the size before touching any table.
        let mut size = 1u32;
        let mut dirty = false;
        let mut dep_tys = Vec::with_capacity(deps.len());
        for &d in deps {
            let v = self.var(d)?;
            dep_tys.push(v.ty);
            if v.backend != backend {
                return Err(Error::usage(format!(
                    "operand {d} belongs to the {} backend but the active stream is {}",
                    v.backend, backend
                )));
            }
            if v.stmt_is_effect {
                return Err(Error::usage(format!(
                    "operand {d} is a side-effect statement and has no value"
                )));
            }
            if v.size != 1 {
                if size != 1 && v.size != size {
                    return Err(Error::usage(format!(
                        "incompatible operand sizes {} and {}",
                        size, v.size
                    )));
                }
                size = v.size;
            }
            dirty |= v.dirty;
        }
        crate::stmt::check(&parsed, ty, &dep_tys)?;
        if let Some(s) = size_override {
            if size != 1 && size != s {
                return Err(Error::usage(format!(
                    "cannot impose size {s} on a statement of size {size}"
                )));
            }
            size = s;
        }

        let mut dep = [0u32; 3];
        dep[..deps.len()].copy_from_slice(deps);

        let eligible = !unique && !effect;
        if eligible {
            let key = VariableKey {
                stmt: stmt.to_string(),
                size,
                dep,
                ty,
                backend,
            };
            if let Some(&id) = self.cse_cache.get(&key) {
                self.var_inc_ref_ext(id)?;
                trace!(id, "trace_append: cse hit");
                return Ok(id);
            }
        }

        for &d in deps {
            self.var_mut(d)?.ref_count_int += 1;
        }
        let v = Variable {
            stmt: Some(stmt),
            dep,
            data: 0,
            size,
            ty,
            backend,
            ref_count_int: 0,
            ref_count_ext: 1,
            retain_data: false,
            dirty,
            placeholder: false,
            side_effect: false,
            unaligned: false,
            stmt_is_effect: effect,
            in_cse: eligible,
            vcall_cached: false,
            label: None,
        };
        let key = eligible.then(|| self.cse_key(&v));
        let id = self.insert_var(v);
        if let Some(key) = key {
            self.cse_cache.insert(key, id);
        }
        trace!(id, size, ty = %ty, "trace_append");
        Ok(id)
    }

    /// Wrap an already-materialized buffer. With `free_on_drop` the table
    /// takes ownership and returns the buffer to the pool on destruction.
    pub(crate) fn register_external(
        &mut self,
        ty: VarType,
        ptr: usize,
        size: u32,
        free_on_drop: bool,
    ) -> Result<u32> {
        if ptr == 0 || size == 0 {
            return Err(Error::usage("cannot register an empty buffer"));
        }
        let backend = self.active_backend()?;
        let id = self.insert_var(Variable {
            stmt: None,
            dep: [0; 3],
            data: ptr,
            size,
            ty,
            backend,
            ref_count_int: 0,
            ref_count_ext: 1,
            retain_data: !free_on_drop,
            dirty: false,
            placeholder: false,
            side_effect: false,
            unaligned: false,
            stmt_is_effect: false,
            in_cse: false,
            vcall_cached: false,
            label: None,
        });
        trace!(id, ptr, size, "register_external");
        Ok(id)
    }

    /// Intern a pointer literal: all references to the same pointer value
    /// share one size-1 variable of type `Ptr`.
    pub(crate) fn register_ptr(&mut self, ptr: usize) -> Result<u32> {
        if let Some(&id) = self.var_from_ptr.get(&ptr) {
            self.var_inc_ref_ext(id)?;
            return Ok(id);
        }
        let id = self.register_external(VarType::Ptr, ptr, 1, false)?;
        self.var_from_ptr.insert(ptr, id);
        Ok(id)
    }

    pub(crate) fn var_inc_ref_ext(&mut self, id: u32) -> Result<()> {
        if id == 0 {
            return Ok(());
        }
        self.var_mut(id)?.ref_count_ext += 1;
        Ok(())
    }

    pub(crate) fn var_dec_ref_ext(&mut self, id: u32) -> Result<()> {
        if id == 0 {
            return Ok(());
        }
        let v = self.var_mut(id)?;
        if v.ref_count_ext == 0 {
            return Err(Error::usage(format!(
                "variable {id} has no external references left"
            )));
        }
        v.ref_count_ext -= 1;
        self.var_maybe_free(id);
        Ok(())
    }

    pub(crate) fn var_inc_ref_int(&mut self, id: u32) -> Result<()> {
        if id == 0 {
            return Ok(());
        }
        self.var_mut(id)?.ref_count_int += 1;
        Ok(())
    }

    pub(crate) fn var_dec_ref_int(&mut self, id: u32) -> Result<()> {
        if id == 0 {
            return Ok(());
        }
        let v = self.var_mut(id)?;
        if v.ref_count_int == 0 {
            return Err(Error::usage(format!(
                "variable {id} has no internal references left"
            )));
        }
        v.ref_count_int -= 1;
        self.var_maybe_free(id);
        Ok(())
    }

    /// Destroy `id` if both counts dropped to zero, cascading into its
    /// operands and any engine-held references (vcall views).
    pub(crate) fn var_maybe_free(&mut self, id: u32) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let Some(v) = self.variables.get(&id) else { continue };
            if v.ref_count_int + v.ref_count_ext > 0 {
                continue;
            }
            let v = self.variables.remove(&id).unwrap();
            trace!(id, "destroying variable");
            if v.in_cse {
                let key = self.cse_key(&v);
                self.cse_cache.remove(&key);
            }
            if v.ty == VarType::Ptr
                && self.var_from_ptr.get(&v.data) == Some(&id)
            {
                self.var_from_ptr.remove(&v.data);
            }
            if v.vcall_cached
                && let Some(buckets) = self.vcall_cache.remove(&id)
            {
                for bucket in buckets {
                    if let Some(sub) = self.variables.get_mut(&bucket.index) {
                        sub.ref_count_ext = sub.ref_count_ext.saturating_sub(1);
                        work.push(bucket.index);
                    }
                }
            }
            for d in v.dep {
                if d != 0
                    && let Some(op) = self.variables.get_mut(&d)
                {
                    op.ref_count_int = op.ref_count_int.saturating_sub(1);
                    work.push(d);
                }
            }
            if v.data != 0 && !v.retain_data {
                if let Err(e) = self.free_ptr(v.data) {
                    tracing::warn!(id, "failed to release variable data: {e}");
                }
            }
        }
    }

    /// Queue a variable for the next evaluation on its stream.
    pub(crate) fn var_schedule(&mut self, id: u32) -> Result<()> {
        let backend = self.active_backend()?;
        let v = self.var(id)?;
        if v.backend != backend {
            return Err(Error::usage(format!(
                "variable {id} belongs to the {} backend but the active stream is {}",
                v.backend, backend
            )));
        }
        if v.is_data() && !v.dirty {
            return Ok(());
        }
        if v.placeholder {
            return Err(Error::usage(format!(
                "placeholder variable {id} cannot be evaluated"
            )));
        }
        self.active()?.scheduled.push(id);
        Ok(())
    }

    /// Derived view over a slice of a permutation buffer: borrows the data,
    /// keeps the owning variable alive through an operand edge.
    pub(crate) fn register_perm_view(
        &mut self,
        perm_var: u32,
        data: usize,
        size: u32,
    ) -> Result<u32> {
        let backend = self.active_backend()?;
        self.var_mut(perm_var)?.ref_count_int += 1;
        let id = self.insert_var(Variable {
            stmt: None,
            dep: [perm_var, 0, 0],
            data,
            size,
            ty: VarType::U32,
            backend,
            ref_count_int: 0,
            ref_count_ext: 1,
            retain_data: true,
            dirty: false,
            placeholder: false,
            side_effect: false,
            unaligned: true,
            stmt_is_effect: false,
            in_cse: false,
            vcall_cached: false,
            label: None,
        });
        Ok(id)
    }

    pub(crate) fn var_mark_side_effect(&mut self, id: u32) -> Result<()> {
        let backend = self.active_backend()?;
        let v = self.var_mut(id)?;
        if v.backend != backend {
            return Err(Error::usage("side effect scheduled on the wrong backend"));
        }
        if !v.side_effect {
            v.side_effect = true;
            // The engine keeps the variable alive until the effect has run,
            // even if the client drops its handle.
            v.ref_count_ext += 1;
            self.active()?.side_effects.push(id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Append a traced operation over up to three operands. Returns an owned
/// handle; equivalent pending operations fold onto the same id.
pub fn trace_append(
    ty: VarType,
    stmt: impl Into<Cow<'static, str>>,
    deps: &[u32],
) -> Result<u32> {
    state::lock().trace_append(ty, stmt.into(), deps, false, None)
}

/// Like [`trace_append`] but never folded by common-subexpression
/// elimination (gathers from raw pointers, anything address-dependent).
pub fn trace_append_unique(
    ty: VarType,
    stmt: impl Into<Cow<'static, str>>,
    deps: &[u32],
) -> Result<u32> {
    state::lock().trace_append(ty, stmt.into(), deps, true, None)
}

/// Scalar constant of the given type.
pub fn literal(ty: VarType, value: &str) -> Result<u32> {
    state::lock().trace_append(ty, format!("$r0 = {value}").into(), &[], false, None)
}

/// `[0, 1, .., size)` as an unevaluated variable.
pub fn index(ty: VarType, size: u32) -> Result<u32> {
    state::lock().trace_append(ty, "$r0 = $i".into(), &[], false, Some(size))
}

/// Symbolic input used while tracing recorded control flow. Ineligible for
/// CSE and never evaluated.
pub fn placeholder(ty: VarType, size: u32) -> Result<u32> {
    let mut st = state::lock();
    let backend = st.active_backend()?;
    let id = st.insert_var(Variable {
        stmt: None,
        dep: [0; 3],
        data: 0,
        size,
        ty,
        backend,
        ref_count_int: 0,
        ref_count_ext: 1,
        retain_data: false,
        dirty: false,
        placeholder: true,
        side_effect: false,
        unaligned: false,
        stmt_is_effect: false,
        in_cse: false,
        vcall_cached: false,
        label: None,
    });
    Ok(id)
}

/// Intern a pointer literal.
pub fn register_ptr(ptr: usize) -> Result<u32> {
    state::lock().register_ptr(ptr)
}

/// Wrap an existing buffer as a materialized variable.
pub fn register_external(ty: VarType, ptr: usize, size: u32, free_on_drop: bool) -> Result<u32> {
    state::lock().register_external(ty, ptr, size, free_on_drop)
}

/// Upload a host byte buffer to the active backend and wrap it.
pub fn copy_to_backend(ty: VarType, data: &[u8]) -> Result<u32> {
    let isize = ty.size();
    if data.is_empty() || !data.len().is_multiple_of(isize) {
        return Err(Error::usage("buffer length is not a multiple of the element size"));
    }
    let size = (data.len() / isize) as u32;
    let mut st = state::lock();
    let class = if st.active_backend()? == Backend::Cuda {
        crate::malloc::AllocType::Device
    } else {
        crate::malloc::AllocType::HostAsync
    };
    let ptr = st.malloc(class, data.len())?;
    if let Err(e) = st.upload(ptr, data) {
        let _ = st.free_ptr(ptr);
        return Err(e);
    }
    st.register_external(ty, ptr, size, true)
}

pub fn inc_ref_ext(id: u32) -> Result<()> {
    state::lock().var_inc_ref_ext(id)
}

pub fn dec_ref_ext(id: u32) -> Result<()> {
    state::lock().var_dec_ref_ext(id)
}

/// Add an operand-side reference. For clients building graph structures
/// outside the table (recorded loops); most code never needs this.
pub fn inc_ref_int(id: u32) -> Result<()> {
    state::lock().var_inc_ref_int(id)
}

pub fn dec_ref_int(id: u32) -> Result<()> {
    state::lock().var_dec_ref_int(id)
}

pub fn var_ty(id: u32) -> Result<VarType> {
    Ok(state::lock().var(id)?.ty)
}

pub fn var_size(id: u32) -> Result<u32> {
    Ok(state::lock().var(id)?.size)
}

/// Buffer pointer of a materialized variable (0 while unevaluated).
pub fn var_ptr(id: u32) -> Result<usize> {
    Ok(state::lock().var(id)?.data)
}

/// (internal, external) reference counts, for diagnostics and tests.
pub fn var_refs(id: u32) -> Result<(u32, u32)> {
    let st = state::lock();
    let v = st.var(id)?;
    Ok((v.ref_count_int, v.ref_count_ext))
}

pub fn set_label(id: u32, label: &str) -> Result<()> {
    state::lock().var_mut(id)?.label = Some(label.to_string());
    Ok(())
}

pub fn var_label(id: u32) -> Result<Option<String>> {
    Ok(state::lock().var(id)?.label.clone())
}

/// Declare that evaluating `id` has observable effects beyond its value.
/// The engine keeps it alive until the next evaluation on its stream.
pub fn mark_side_effect(id: u32) -> Result<()> {
    state::lock().var_mark_side_effect(id)
}

/// Flag pending out-of-band writes against this variable's buffer.
pub fn mark_dirty(id: u32) -> Result<()> {
    state::lock().var_mut(id)?.dirty = true;
    Ok(())
}

/// Queue a variable for the next [`crate::eval`].
pub fn schedule(id: u32) -> Result<()> {
    state::lock().var_schedule(id)
}

/// Materialize `id` if it is unevaluated or has pending writes.
pub fn var_eval(id: u32) -> Result<()> {
    {
        let mut st = state::lock();
        let v = st.var(id)?;
        if v.is_data() && !v.dirty {
            return Ok(());
        }
        st.var_schedule(id)?;
    }
    crate::eval::eval()
}

/// Grow a size-1 variable, or (with `copy`) broadcast any variable, to a new
/// size. Returns a new owned handle.
pub fn set_size(id: u32, size: u32, copy: bool) -> Result<u32> {
    let mut st = state::lock();
    let v = st.var(id)?;
    if v.size == size {
        st.var_inc_ref_ext(id)?;
        return Ok(id);
    }
    let ty = v.ty;
    if !copy {
        if v.is_data() || v.size != 1 {
            return Err(Error::usage(
                "set_size() without copy requires an unevaluated size-1 variable",
            ));
        }
        let stmt = v.stmt.clone().ok_or_else(|| {
            Error::usage("set_size() cannot resize a placeholder")
        })?;
        let deps: Vec<u32> = v.dep.iter().copied().filter(|d| *d != 0).collect();
        return st.trace_append(ty, stmt, &deps, false, Some(size));
    }
    if v.size != 1 {
        return Err(Error::usage("set_size() with copy requires a size-1 operand"));
    }
    st.trace_append(ty, "$r0 = $r1".into(), &[id], false, Some(size))
}

/// Read one element into `dst` (must match the element width), evaluating
/// the variable first if needed.
pub fn read(id: u32, offset: u32, dst: &mut [u8]) -> Result<()> {
    var_eval(id)?;
    let (addr, backend, stream) = {
        let st = state::lock();
        let v = st.var(id)?;
        if offset >= v.size {
            return Err(Error::usage(format!(
                "read(): offset {offset} out of bounds for size {}",
                v.size
            )));
        }
        if dst.len() != v.ty.size() {
            return Err(Error::usage("read(): destination width mismatch"));
        }
        (v.data + offset as usize * v.ty.size(), v.backend, st.active_cuda()?)
    };
    match backend {
        Backend::Cpu => unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, dst.as_mut_ptr(), dst.len());
        },
        Backend::Cuda => {
            let stream = stream.ok_or_else(|| {
                Error::usage("reading an accelerator variable requires its stream active")
            })?;
            // Blocking single-element transfer with the engine lock released.
            crate::cuda::copy_from_device(&stream, addr, dst)?;
        }
    }
    Ok(())
}

/// Overwrite one element; the inverse of [`read`].
pub fn write(id: u32, offset: u32, src: &[u8]) -> Result<()> {
    var_eval(id)?;
    let (addr, backend, stream) = {
        let st = state::lock();
        let v = st.var(id)?;
        if offset >= v.size {
            return Err(Error::usage(format!(
                "write(): offset {offset} out of bounds for size {}",
                v.size
            )));
        }
        if src.len() != v.ty.size() {
            return Err(Error::usage("write(): source width mismatch"));
        }
        (v.data + offset as usize * v.ty.size(), v.backend, st.active_cuda()?)
    };
    match backend {
        Backend::Cpu => unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), addr as *mut u8, src.len());
        },
        Backend::Cuda => {
            let stream = stream.ok_or_else(|| {
                Error::usage("writing an accelerator variable requires its stream active")
            })?;
            crate::cuda::copy_to_device(&stream, addr, src)?;
        }
    }
    Ok(())
}

/// Move a variable's buffer to a different allocation class.
pub fn migrate(id: u32, ty: crate::malloc::AllocType) -> Result<()> {
    var_eval(id)?;
    let mut st = state::lock();
    let v = st.var(id)?;
    if v.retain_data {
        return Err(Error::usage("cannot migrate a borrowed buffer"));
    }
    let old = v.data;
    let new = st.migrate_ptr(old, ty)?;
    st.var_mut(id)?.data = new;
    Ok(())
}

/// Human-readable summary of the variable table and engine counters.
pub fn whos() -> String {
    use std::fmt::Write;

    let st = state::lock();
    let mut ids: Vec<u32> = st.variables.keys().copied().collect();
    ids.sort_unstable();
    let mut out = String::new();
    let _ = writeln!(out, "  id       type   size  refs   status  label");
    let _ = writeln!(out, "  -------------------------------------------");
    for id in ids {
        let v = &st.variables[&id];
        let status = if v.is_data() {
            "data"
        } else if v.placeholder {
            "symbolic"
        } else {
            "pending"
        };
        let _ = writeln!(
            out,
            "  {:<7} {:<6} {:<6} {}/{}   {:<8} {}",
            id,
            v.ty.name(),
            v.size,
            v.ref_count_int,
            v.ref_count_ext,
            status,
            v.label.as_deref().unwrap_or("")
        );
    }
    let _ = writeln!(
        out,
        "\n  variables: {}, kernels: {} hits / {} misses / {} launches",
        st.variables.len(),
        st.kernel_hits,
        st.kernel_misses,
        st.kernel_launches
    );
    let _ = writeln!(
        out,
        "  memory: {} used, {} pooled, {} in flight",
        st.malloc.bytes_used, st.malloc.bytes_free, st.malloc.bytes_inflight
    );
    out
}
