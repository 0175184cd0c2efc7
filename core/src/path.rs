/// Control path interface.
///
/// A control path is a continuous signal X(t) reconstructed from discrete
/// observations. It is queried at scalar tape times and returns a `State`
/// whose components are shaped (batch..., input_channels), mirroring the
/// structure of the CDE state.
///
/// Paths are cheap handles over tape buffers: cloning a path clones ids, not
/// data. Operations must be pure in `t`.

use crate::error::{CdeError, CdeResult};
use crate::state::State;
use crate::tape::{BufId, Tape};

/// Operations a path declares it supports. Read once per solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathCapabilities {
    pub derivative: bool,
    pub evaluate: bool,
}

impl PathCapabilities {
    pub const DERIVATIVE_ONLY: PathCapabilities = PathCapabilities { derivative: true, evaluate: false };
    pub const FULL: PathCapabilities = PathCapabilities { derivative: true, evaluate: true };
}

pub trait ControlPath {
    fn capabilities(&self) -> PathCapabilities;

    /// dX/dt at time `t` (a one-element tape buffer).
    fn derivative(&self, tape: &mut Tape, t: BufId) -> CdeResult<State>;

    /// X(t). Only called when `capabilities().evaluate` is set.
    fn evaluate(&self, _tape: &mut Tape, _t: BufId) -> CdeResult<State> {
        Err(CdeError::config("X must have an 'evaluate' method."))
    }

    /// Differentiable buffers owned by the path (e.g. interpolation coefficients).
    fn buffers(&self) -> Vec<BufId> {
        Vec::new()
    }
}
