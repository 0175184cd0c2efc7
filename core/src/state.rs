/// CDE state: one array or an ordered tuple of arrays.
///
/// Every per-component computation iterates `components()`, so single and
/// tuple states share one code path. All components share a batch shape;
/// their channel counts may differ.

use crate::tape::{BufId, Tape};
use crate::tensor;
use crate::traced::{traced_add, traced_scale, traced_scale_by};

/// Whether a state is one array or a tuple, fixed for one solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralMode {
    Single,
    Tuple,
}

impl StructuralMode {
    /// Noun used in error messages: "a tensor" / "a tuple/list".
    pub fn describe(self) -> &'static str {
        match self {
            StructuralMode::Single => "a tensor",
            StructuralMode::Tuple => "a tuple/list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Single(BufId),
    Tuple(Vec<BufId>),
}

impl State {
    pub fn mode(&self) -> StructuralMode {
        match self {
            State::Single(_) => StructuralMode::Single,
            State::Tuple(_) => StructuralMode::Tuple,
        }
    }

    pub fn components(&self) -> &[BufId] {
        match self {
            State::Single(id) => std::slice::from_ref(id),
            State::Tuple(ids) => ids,
        }
    }

    pub fn len(&self) -> usize {
        self.components().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components().is_empty()
    }

    /// Rebuild a state of the given mode from its components.
    pub fn from_components(mode: StructuralMode, mut ids: Vec<BufId>) -> State {
        match mode {
            StructuralMode::Single => {
                debug_assert_eq!(ids.len(), 1);
                State::Single(ids.remove(0))
            }
            StructuralMode::Tuple => State::Tuple(ids),
        }
    }

    /// Apply `f` to each component, keeping the structure.
    pub fn map(&self, tape: &mut Tape, mut f: impl FnMut(&mut Tape, BufId) -> BufId) -> State {
        let ids = self.components().iter().map(|&id| f(tape, id)).collect();
        State::from_components(self.mode(), ids)
    }

    /// Apply `f` to matching components of two states with the same structure.
    pub fn zip_map(&self, other: &State, tape: &mut Tape,
                   mut f: impl FnMut(&mut Tape, BufId, BufId) -> BufId) -> State {
        debug_assert_eq!(self.len(), other.len());
        let ids = self.components().iter().zip(other.components().iter())
            .map(|(&a, &b)| f(tape, a, b)).collect();
        State::from_components(self.mode(), ids)
    }

    /// Component-wise a + b.
    pub fn add(&self, other: &State, tape: &mut Tape) -> State {
        self.zip_map(other, tape, traced_add)
    }

    /// Component-wise c * self for a constant c.
    pub fn scale(&self, c: f64, tape: &mut Tape) -> State {
        self.map(tape, |t, id| traced_scale(t, id, c))
    }

    /// Component-wise s * self for a one-element tape buffer s.
    pub fn scale_by(&self, s: BufId, tape: &mut Tape) -> State {
        self.map(tape, |t, id| traced_scale_by(t, id, s))
    }
}

/// Shapes of a state's components; flattens to and from one contiguous vector.
#[derive(Debug, Clone, PartialEq)]
pub struct StateLayout {
    pub mode: StructuralMode,
    pub shapes: Vec<Vec<usize>>,
}

impl StateLayout {
    pub fn of(tape: &Tape, state: &State) -> Self {
        StateLayout {
            mode: state.mode(),
            shapes: state.components().iter().map(|&id| tape.buf_shape(id).to_vec()).collect(),
        }
    }

    pub fn numel(&self) -> usize {
        self.shapes.iter().map(|s| tensor::numel(s)).sum()
    }

    /// Element count of each component, in order.
    pub fn sizes(&self) -> Vec<usize> {
        self.shapes.iter().map(|s| tensor::numel(s)).collect()
    }

    /// Concatenate the component data.
    pub fn flatten(&self, tape: &Tape, state: &State) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.numel());
        for &id in state.components() {
            out.extend_from_slice(tape.buf_data(id));
        }
        out
    }

    /// Split a flat vector into per-component slices.
    pub fn split<'a>(&self, flat: &'a [f64]) -> Vec<&'a [f64]> {
        let mut parts = Vec::with_capacity(self.shapes.len());
        let mut offset = 0;
        for n in self.sizes() {
            parts.push(&flat[offset..offset + n]);
            offset += n;
        }
        parts
    }

    /// Allocate leaves holding `flat`, one per component.
    pub fn to_leaves(&self, tape: &mut Tape, flat: &[f64], requires_grad: bool) -> State {
        let parts = self.split(flat);
        let ids = parts.iter().zip(self.shapes.iter())
            .map(|(p, s)| tape.leaf(p, s.clone(), requires_grad)).collect();
        State::from_components(self.mode, ids)
    }
}
