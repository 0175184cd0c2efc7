/// Vector field interface.
///
/// In matmul coupling a field maps (t, z) to a system shaped
/// (batch..., hidden, input) per state component. A field may also declare a
/// `prod` shortcut computing f(t, z) · dX/dt directly, shaped like z, which
/// avoids materialising the full system.
///
/// In evaluate/derivative coupling the field instead receives
/// concat(z, X(t)) or concat(z, dX/dt) and returns values shaped like z.

use crate::error::{CdeError, CdeResult};
use crate::state::State;
use crate::tape::{BufId, Tape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldCapabilities {
    pub prod: bool,
}

pub trait VectorField {
    fn capabilities(&self) -> FieldCapabilities {
        FieldCapabilities::default()
    }

    fn call(&self, tape: &mut Tape, t: BufId, z: &State) -> CdeResult<State>;

    /// f(t, z) · dxdt. Only called when `capabilities().prod` is set.
    fn prod(&self, _tape: &mut Tape, _t: BufId, _z: &State, _dxdt: &State) -> CdeResult<State> {
        Err(CdeError::config("func does not provide a 'prod' method."))
    }

    /// Parameter buffers; the default adjoint-sensitive set.
    fn parameters(&self) -> Vec<BufId>;
}
