/// Gradient-isolation registry.
///
/// Lifts a computed value out of the graph that produced it and installs it
/// as an independent parameter-like entity. Each registration is a barrier
/// node on the tape: same data, fresh storage, no gradient edge back to the
/// producer. Gradients accumulate on the registered value as on any leaf.
///
/// Flow into the producer is restored only on request, once per registration,
/// through `Tape::reattach` / `Tape::reattach_all`.

use std::collections::BTreeMap;

use crate::error::{CdeError, CdeResult};
use crate::tape::{BufId, Tape};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Registered {
    id: BufId,
    /// Lookup-only: where the value came from. Never a gradient edge.
    source: Option<BufId>,
}

/// Named registered parameters owned by one container (e.g. a control path).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterRegistry {
    entries: BTreeMap<String, Registered>,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        ParameterRegistry::default()
    }

    /// Install a barrier copy of `value` under `name`. Returns the new id.
    pub fn register(&mut self, tape: &mut Tape, name: &str, value: BufId) -> CdeResult<BufId> {
        if self.entries.contains_key(name) {
            return Err(CdeError::config(format!("parameter '{name}' is already registered")));
        }
        let id = tape.barrier(value);
        log::trace!("registered '{name}' as buffer {id} (from {value})");
        self.entries.insert(name.to_string(), Registered { id, source: Some(value) });
        Ok(id)
    }

    pub fn get(&self, name: &str) -> Option<BufId> {
        self.entries.get(name).map(|r| r.id)
    }

    /// The value a registered parameter was copied from, for debugging.
    pub fn source_of(&self, name: &str) -> Option<BufId> {
        self.entries.get(name).and_then(|r| r.source)
    }

    /// Registered ids in name order.
    pub fn buffers(&self) -> Vec<BufId> {
        self.entries.values().map(|r| r.id).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move every registered parameter onto another tape as a fresh leaf with
    /// copied storage. The returned registry refers only to `to`.
    pub fn relocate(&self, from: &Tape, to: &mut Tape) -> ParameterRegistry {
        let entries = self.entries.iter().map(|(name, r)| {
            let id = to.leaf(from.buf_data(r.id), from.buf_shape(r.id).to_vec(),
                             from.requires_grad(r.id));
            (name.clone(), Registered { id, source: None })
        }).collect();
        ParameterRegistry { entries }
    }
}
