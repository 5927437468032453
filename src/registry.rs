//! Domain registry for indirect calls.
//!
//! Client code registers opaque instance pointers under a domain string and
//! receives dense ids starting at 1; id 0 means "no callee". `vcall` uses
//! the registry to translate bucket keys back into instance pointers.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::state;

#[derive(Default)]
pub(crate) struct DomainRegistry {
    /// Slot `i` holds the pointer registered under id `i + 1`; 0 is free.
    entries: Vec<usize>,
    ids: FxHashMap<usize, u32>,
}

impl DomainRegistry {
    pub(crate) fn max_id(&self) -> u32 {
        self.entries.len() as u32
    }
}

/// Register a pointer, returning its id within the domain. Freed slots are
/// reused before the id space grows.
pub fn put(domain: &str, ptr: usize) -> Result<u32> {
    if ptr == 0 {
        return Err(Error::usage("cannot register a null pointer"));
    }
    let mut st = state::lock();
    let reg = st.registry.entry(domain.to_string()).or_default();
    if reg.ids.contains_key(&ptr) {
        return Err(Error::usage(format!(
            "pointer {ptr:#x} is already registered in domain \"{domain}\""
        )));
    }
    let id = match reg.entries.iter().position(|p| *p == 0) {
        Some(slot) => {
            reg.entries[slot] = ptr;
            slot as u32 + 1
        }
        None => {
            reg.entries.push(ptr);
            reg.entries.len() as u32
        }
    };
    reg.ids.insert(ptr, id);
    Ok(id)
}

/// Unregister a pointer; its id becomes reusable.
pub fn remove(domain: &str, ptr: usize) -> Result<()> {
    let mut st = state::lock();
    let reg = st
        .registry
        .get_mut(domain)
        .ok_or_else(|| Error::usage(format!("unknown domain \"{domain}\"")))?;
    let id = reg
        .ids
        .remove(&ptr)
        .ok_or_else(|| Error::usage(format!("pointer {ptr:#x} is not registered")))?;
    reg.entries[id as usize - 1] = 0;
    Ok(())
}

/// Largest id ever handed out in the domain (0 if none).
pub fn get_max(domain: &str) -> u32 {
    let st = state::lock();
    st.registry
        .get(domain)
        .map(|r| r.entries.len() as u32)
        .unwrap_or(0)
}

/// Pointer registered under an id, or 0 when the slot is empty.
pub fn get_ptr(domain: &str, id: u32) -> usize {
    let st = state::lock();
    get_ptr_locked(&st, domain, id)
}

pub(crate) fn get_ptr_locked(st: &crate::state::State, domain: &str, id: u32) -> usize {
    if id == 0 {
        return 0;
    }
    st.registry
        .get(domain)
        .and_then(|r| r.entries.get(id as usize - 1).copied())
        .unwrap_or(0)
}
