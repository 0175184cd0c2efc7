/// Vector field adapter: turns (X, f) into the ODE right-hand side.
///
///   matmul:      dz/dt = f(t, z) · dX/dt          (or f.prod(t, z, dX/dt))
///   evaluate:    dz/dt = f(t, concat(z, X(t)))
///   derivative:  dz/dt = f(t, concat(z, dX/dt))
///
/// Capabilities and coupling are fixed at construction; `rhs` is pure in (t, z).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::compat::Compatibility;
use crate::error::{CdeError, CdeResult};
use crate::field::VectorField;
use crate::path::ControlPath;
use crate::solver::OdeFunc;
use crate::state::{State, StructuralMode};
use crate::tape::{BufId, Tape};
use crate::traced::{traced_batch_matvec, traced_concat_last};

/// How the control path enters the vector field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coupling {
    #[default]
    Matmul,
    Evaluate,
    Derivative,
}

impl Coupling {
    pub fn as_str(self) -> &'static str {
        match self {
            Coupling::Matmul => "matmul",
            Coupling::Evaluate => "evaluate",
            Coupling::Derivative => "derivative",
        }
    }
}

impl fmt::Display for Coupling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Coupling {
    type Err = CdeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "matmul" => Ok(Coupling::Matmul),
            "evaluate" => Ok(Coupling::Evaluate),
            "derivative" => Ok(Coupling::Derivative),
            _ => Err(CdeError::config("vector_field_type string not recognised")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorFieldAdapter<X, F> {
    x: X,
    f: F,
    mode: StructuralMode,
    coupling: Coupling,
    has_prod: bool,
}

impl<X: ControlPath, F: VectorField> VectorFieldAdapter<X, F> {
    pub fn new(x: X, f: F, compat: Compatibility, coupling: Coupling) -> CdeResult<Self> {
        if compat.has_prod && coupling != Coupling::Matmul {
            return Err(CdeError::config(format!(
                "func.prod is only supported with the 'matmul' vector_field_type, not '{coupling}'."
            )));
        }
        if coupling == Coupling::Evaluate && !x.capabilities().evaluate {
            return Err(CdeError::config(
                "X must have an 'evaluate' method to use the 'evaluate' vector_field_type.",
            ));
        }
        Ok(VectorFieldAdapter { x, f, mode: compat.mode, coupling, has_prod: compat.has_prod })
    }

    pub fn coupling(&self) -> Coupling {
        self.coupling
    }

    pub fn mode(&self) -> StructuralMode {
        self.mode
    }

    /// Differentiable buffers of the control path.
    pub fn path_buffers(&self) -> Vec<BufId> {
        self.x.buffers()
    }

    pub fn path(&self) -> &X {
        &self.x
    }

    pub fn field(&self) -> &F {
        &self.f
    }
}

impl<X: ControlPath, F: VectorField> OdeFunc for VectorFieldAdapter<X, F> {
    fn rhs(&self, tape: &mut Tape, t: BufId, z: &State) -> CdeResult<State> {
        let out = match self.coupling {
            Coupling::Matmul => {
                let control_gradient = self.x.derivative(tape, t)?;
                if self.has_prod {
                    self.f.prod(tape, t, z, &control_gradient)?
                } else {
                    let system = self.f.call(tape, t, z)?;
                    system.zip_map(&control_gradient, tape, traced_batch_matvec)
                }
            }
            Coupling::Evaluate | Coupling::Derivative => {
                let data = if self.coupling == Coupling::Evaluate {
                    self.x.evaluate(tape, t)?
                } else {
                    self.x.derivative(tape, t)?
                };
                let inputs = z.zip_map(&data, tape, |tp, zi, di| traced_concat_last(tp, &[zi, di]));
                self.f.call(tape, t, &inputs)?
            }
        };
        debug_assert_eq!(out.mode(), self.mode);
        Ok(out)
    }

    fn parameters(&self) -> Vec<BufId> {
        self.f.parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldCapabilities;
    use crate::path::PathCapabilities;
    use crate::traced::traced_scale;

    fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(actual.len(), expected.len());
        for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
            assert!((a - e).abs() < tol, "[{i}]: actual={a} expected={e}");
        }
    }

    /// X(t) = t * v, so dX/dt = v.
    #[derive(Debug, Clone)]
    struct Ray {
        v: BufId,
    }

    impl ControlPath for Ray {
        fn capabilities(&self) -> PathCapabilities {
            PathCapabilities::FULL
        }

        fn derivative(&self, _tape: &mut Tape, _t: BufId) -> CdeResult<State> {
            Ok(State::Single(self.v))
        }

        fn evaluate(&self, tape: &mut Tape, t: BufId) -> CdeResult<State> {
            Ok(State::Single(crate::traced::traced_scale_by(tape, self.v, t)))
        }
    }

    /// Constant system matrix, or 2x its input in concat modes.
    #[derive(Debug, Clone)]
    struct Fixed {
        system: BufId,
        prod: bool,
    }

    impl VectorField for Fixed {
        fn capabilities(&self) -> FieldCapabilities {
            FieldCapabilities { prod: self.prod }
        }

        fn call(&self, tape: &mut Tape, _t: BufId, z: &State) -> CdeResult<State> {
            if tape.buf_shape(z.components()[0]).len() == 2 && tape.buf_shape(z.components()[0])[1] != 2 {
                return Ok(z.map(tape, |tp, id| traced_scale(tp, id, 2.0)));
            }
            Ok(State::Single(self.system))
        }

        fn prod(&self, tape: &mut Tape, _t: BufId, z: &State, _dxdt: &State) -> CdeResult<State> {
            Ok(z.scale(-1.0, tape))
        }

        fn parameters(&self) -> Vec<BufId> {
            vec![self.system]
        }
    }

    fn compat(has_prod: bool) -> Compatibility {
        Compatibility { mode: StructuralMode::Single, has_prod }
    }

    #[test]
    fn test_matmul_rhs_is_system_times_derivative() {
        let mut tape = Tape::new();
        // batch 1, hidden 2, input 3
        let system = tape.alloc(vec![1.0, 0.0, 2.0, 0.0, 1.0, -1.0], vec![1, 2, 3]);
        let v = tape.alloc(vec![1.0, 2.0, 3.0], vec![1, 3]);
        let z = tape.alloc(vec![0.0, 0.0], vec![1, 2]);
        let t = tape.constant(0.5);
        let adapter = VectorFieldAdapter::new(Ray { v }, Fixed { system, prod: false },
                                              compat(false), Coupling::Matmul).unwrap();
        let out = adapter.rhs(&mut tape, t, &State::Single(z)).unwrap();
        assert_close(tape.buf_data(out.components()[0]), &[7.0, -1.0], 1e-12);
        assert_eq!(adapter.parameters(), vec![system]);
    }

    #[test]
    fn test_prod_shortcut_used_when_declared() {
        let mut tape = Tape::new();
        let system = tape.alloc(vec![0.0; 6], vec![1, 2, 3]);
        let v = tape.alloc(vec![1.0, 2.0, 3.0], vec![1, 3]);
        let z = tape.alloc(vec![4.0, 5.0], vec![1, 2]);
        let t = tape.constant(0.0);
        let adapter = VectorFieldAdapter::new(Ray { v }, Fixed { system, prod: true },
                                              compat(true), Coupling::Matmul).unwrap();
        let out = adapter.rhs(&mut tape, t, &State::Single(z)).unwrap();
        assert_close(tape.buf_data(out.components()[0]), &[-4.0, -5.0], 1e-12);
    }

    #[test]
    fn test_evaluate_concatenates_path_value() {
        let mut tape = Tape::new();
        let system = tape.alloc(vec![0.0; 6], vec![1, 2, 3]);
        let v = tape.alloc(vec![1.0, 2.0, 3.0], vec![1, 3]);
        let z = tape.alloc(vec![4.0, 5.0], vec![1, 2]);
        let t = tape.constant(2.0);
        let adapter = VectorFieldAdapter::new(Ray { v }, Fixed { system, prod: false },
                                              compat(false), Coupling::Evaluate).unwrap();
        let out = adapter.rhs(&mut tape, t, &State::Single(z)).unwrap();
        // concat(z, 2v) doubled
        assert_close(tape.buf_data(out.components()[0]), &[8.0, 10.0, 4.0, 8.0, 12.0], 1e-12);

        let adapter = VectorFieldAdapter::new(Ray { v }, Fixed { system, prod: false },
                                              compat(false), Coupling::Derivative).unwrap();
        let out = adapter.rhs(&mut tape, t, &State::Single(z)).unwrap();
        assert_close(tape.buf_data(out.components()[0]), &[8.0, 10.0, 2.0, 4.0, 6.0], 1e-12);
    }

    #[test]
    fn test_prod_with_concat_coupling_rejected() {
        let mut tape = Tape::new();
        let system = tape.alloc(vec![0.0; 6], vec![1, 2, 3]);
        let v = tape.alloc(vec![1.0, 2.0, 3.0], vec![1, 3]);
        let err = VectorFieldAdapter::new(Ray { v }, Fixed { system, prod: true },
                                          compat(true), Coupling::Evaluate).unwrap_err();
        assert!(matches!(err, CdeError::Config(_)));
    }

    #[test]
    fn test_coupling_parse() {
        assert_eq!("matmul".parse::<Coupling>().unwrap(), Coupling::Matmul);
        assert_eq!("derivative".parse::<Coupling>().unwrap(), Coupling::Derivative);
        let err = "cubic".parse::<Coupling>().unwrap_err();
        assert_eq!(err.to_string(), "configuration error: vector_field_type string not recognised");
        let c: Coupling = serde_json::from_str("\"evaluate\"").unwrap();
        assert_eq!(c, Coupling::Evaluate);
        assert_eq!(Coupling::Evaluate.to_string(), "evaluate");
    }
}
