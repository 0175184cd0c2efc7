/// Solving controlled differential equations.
///
///   z_t = z_{t_0} + ∫_{t_0}^t f(s, z_s) dX_s
///
/// `cdeint` checks that the control path, vector field and initial state fit
/// together, wraps them into an ODE right-hand side, integrates it (directly
/// or by the adjoint method) and returns the solution at every requested time,
/// shaped (batch..., len(t), hidden) per state component.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::adapter::{Coupling, VectorFieldAdapter};
use crate::compat::{check, check_times};
use crate::error::CdeResult;
use crate::field::VectorField;
use crate::path::ControlPath;
use crate::solver::{Method, OdeFunc, OdeIntegrator, RungeKutta, SolveStats, SolverOptions};
use crate::state::{State, StructuralMode};
use crate::tape::{BufId, Tape};
use crate::traced::traced_stack_seq;

// ── Options ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdeOptions {
    /// Backpropagate with the adjoint method rather than through the solver.
    pub adjoint: bool,
    #[serde(rename = "vector_field_type", alias = "coupling")]
    pub coupling: Coupling,
    #[serde(flatten)]
    pub solver: SolverOptions,
    /// Buffers that should receive gradients in adjoint mode. When unset,
    /// gradients flow to the vector field's parameters, but every path buffer
    /// requiring gradients is reported as undeclared. Runtime ids; never
    /// serialized.
    #[serde(skip)]
    pub adjoint_params: Option<Vec<BufId>>,
}

impl Default for CdeOptions {
    fn default() -> Self {
        CdeOptions {
            adjoint: true,
            coupling: Coupling::Matmul,
            solver: SolverOptions::default(),
            adjoint_params: None,
        }
    }
}

impl CdeOptions {
    pub fn from_json(json: &str) -> CdeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Differentiate through the solver instead of using the adjoint.
    pub fn direct() -> Self {
        CdeOptions { adjoint: false, ..CdeOptions::default() }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.solver.method = method;
        self
    }

    pub fn step_size(mut self, step_size: f64) -> Self {
        self.solver.step_size = Some(step_size);
        self
    }

    pub fn coupling(mut self, coupling: Coupling) -> Self {
        self.coupling = coupling;
        self
    }

    pub fn adjoint_params(mut self, params: Vec<BufId>) -> Self {
        self.adjoint_params = Some(params);
        self
    }
}

// ── Diagnostics ──────────────────────────────────────────────────────

/// Advisory findings about a solve. Returned, never printed by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A control path buffer requires gradients but is not among the adjoint
    /// parameters, so it will not receive one.
    UndeclaredAdjointBuffer { buffer: BufId },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UndeclaredAdjointBuffer { buffer } => write!(
                f,
                "buffer {buffer} of the control path X requires gradients but is not listed in \
                 `adjoint_params`. This is probably a mistake: it will not receive a gradient when \
                 using the adjoint method. Either have the input not require gradients, or include it \
                 (and every other parameter needing gradients) in `adjoint_params`, e.g. \
                 `CdeOptions::default().adjoint_params([func.parameters(), X.buffers()].concat())`."
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn push(&mut self, d: Diagnostic) {
        self.items.push(d);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    /// Report every diagnostic through `log::warn!`.
    pub fn emit(&self) {
        for d in &self.items {
            log::warn!("{d}");
        }
    }
}

// ── Solve ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Solution {
    /// Per component: (batch..., len(t), hidden).
    pub trajectory: State,
    pub diagnostics: Diagnostics,
    pub stats: SolveStats,
}

/// Solve a CDE with the bundled Runge–Kutta integrator.
pub fn cdeint<X, F>(tape: &mut Tape, x: &X, f: &F, z0: &State, t: BufId,
                    opts: &CdeOptions) -> CdeResult<Solution>
where
    X: ControlPath + Clone + 'static,
    F: VectorField + Clone + 'static,
{
    cdeint_with(&RungeKutta, tape, x, f, z0, t, opts)
}

/// Solve a CDE with any integrator.
pub fn cdeint_with<I, X, F>(integrator: &I, tape: &mut Tape, x: &X, f: &F, z0: &State, t: BufId,
                            opts: &CdeOptions) -> CdeResult<Solution>
where
    I: OdeIntegrator + ?Sized,
    X: ControlPath + Clone + 'static,
    F: VectorField + Clone + 'static,
{
    let solver = opts.solver.clone().with_default_tolerances();

    check_times(tape, t)?;
    let compat = check(tape, x, f, z0, t, opts.coupling)?;
    let adapter = VectorFieldAdapter::new(x.clone(), f.clone(), compat, opts.coupling)?;

    log::debug!("cdeint: mode={:?} coupling={} prod={} adjoint={} method={} times={}",
                compat.mode, opts.coupling, compat.has_prod, opts.adjoint, solver.method,
                tape.buf_numel(t));

    let mut diagnostics = Diagnostics::default();
    let solved = if opts.adjoint {
        let listed: &[BufId] = opts.adjoint_params.as_deref().unwrap_or(&[]);
        for buffer in adapter.path_buffers() {
            if tape.requires_grad(buffer) && !listed.contains(&buffer) {
                diagnostics.push(Diagnostic::UndeclaredAdjointBuffer { buffer });
            }
        }
        let declared = opts.adjoint_params.clone().unwrap_or_else(|| f.parameters());
        let func: Rc<dyn OdeFunc> = Rc::new(adapter);
        integrator.integrate_adjoint(tape, func, z0, t, &solver, &declared)?
    } else {
        integrator.integrate(tape, &adapter, z0, t, &solver)?
    };

    let trajectory = stack_times(tape, compat.mode, &solved.states);
    Ok(Solution { trajectory, diagnostics, stats: solved.stats })
}

/// Per component, stack the per-time states along a new second-to-last axis.
fn stack_times(tape: &mut Tape, mode: StructuralMode, states: &[State]) -> State {
    let n_comp = states.first().map_or(0, |s| s.len());
    let ids = (0..n_comp).map(|i| {
        let per_time: Vec<BufId> = states.iter().map(|s| s.components()[i]).collect();
        traced_stack_seq(tape, &per_time)
    }).collect();
    State::from_components(mode, ids)
}
