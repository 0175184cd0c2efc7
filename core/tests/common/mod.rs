//! Shared fixtures for the integration tests and benches.
//!
//! - `LinearPath`: piecewise-linear control path whose knots, values and
//!   slopes are registered through `ParameterRegistry`.
//! - `SigmoidField`: z.sigmoid().unsqueeze(-1) + variable, the smallest
//!   vector field that exercises every gradient path.
//! - `ProdField`, `CountingField`, `ConcatField`: variants for the `prod`
//!   shortcut, call counting and the concatenating couplings.

#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use cdeint_core::error::{CdeError, CdeResult};
use cdeint_core::field::{FieldCapabilities, VectorField};
use cdeint_core::path::{ControlPath, PathCapabilities};
use cdeint_core::registry::ParameterRegistry;
use cdeint_core::state::State;
use cdeint_core::tape::{BufId, Tape};
use cdeint_core::tensor::{self, SimpleRng};
use cdeint_core::traced::{
    traced_add, traced_batch_matvec, traced_broadcast_to, traced_linear, traced_reciprocal,
    traced_reshape, traced_scale_by, traced_select_seq, traced_sigmoid, traced_slice,
    traced_stack_seq, traced_sub, traced_tanh,
};

// ── Helpers ──────────────────────────────────────────────────────────

pub fn assert_close(actual: &[f64], expected: &[f64], tol: f64, msg: &str) {
    assert_eq!(actual.len(), expected.len(), "{msg}: length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!((a - e).abs() < tol, "{msg}[{i}]: actual={a} expected={e}");
    }
}

pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| if i == n - 1 { end } else { start + step * i as f64 }).collect()
}

/// Uniform [0, 1) data.
pub fn rand(rng: &mut SimpleRng, n: usize) -> Vec<f64> {
    (0..n).map(|_| 0.5 * (rng.uniform(1.0) + 1.0)).collect()
}

/// True when a gradient flowed to `id` and it is finite and not all zero.
pub fn has_grad(tape: &Tape, id: BufId) -> bool {
    match tape.get_grad(id) {
        Some(g) => g.iter().all(|v| v.is_finite()) && g.iter().any(|v| *v != 0.0),
        None => false,
    }
}

// ── Control path ─────────────────────────────────────────────────────

/// Piecewise-linear interpolation of `data` (batch..., L, C) over `knots` (L).
#[derive(Debug, Clone)]
pub struct LinearPath {
    registry: ParameterRegistry,
    knots: BufId,
    values: BufId,
    slopes: BufId,
    knot_values: Vec<f64>,
}

impl LinearPath {
    pub fn new(tape: &mut Tape, knots: BufId, data: BufId) -> CdeResult<Self> {
        let len = tape.buf_numel(knots);
        let shape = tape.buf_shape(data).to_vec();
        if len < 2 || shape.len() < 2 || shape[shape.len() - 2] != len {
            return Err(CdeError::shape(format!(
                "path data of shape {} does not match {} knots",
                tensor::fmt_shape(&shape), len
            )));
        }

        let mut segments = Vec::with_capacity(len - 1);
        for s in 0..len - 1 {
            let x0 = traced_select_seq(tape, data, s);
            let x1 = traced_select_seq(tape, data, s + 1);
            let dx = traced_sub(tape, x1, x0);
            let k0 = traced_slice(tape, knots, s, 1);
            let k1 = traced_slice(tape, knots, s + 1, 1);
            let dt = traced_sub(tape, k1, k0);
            let inv = traced_reciprocal(tape, dt);
            segments.push(traced_scale_by(tape, dx, inv));
        }
        let slopes = traced_stack_seq(tape, &segments);

        let mut registry = ParameterRegistry::new();
        let knots_id = registry.register(tape, "knots", knots)?;
        let values = registry.register(tape, "values", data)?;
        let slopes = registry.register(tape, "slopes", slopes)?;
        Ok(LinearPath {
            registry,
            knots: knots_id,
            values,
            slopes,
            knot_values: tape.buf_data(knots_id).to_vec(),
        })
    }

    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    fn segment(&self, t: f64) -> usize {
        let last = self.knot_values.len() - 2;
        let mut s = 0;
        while s < last && self.knot_values[s + 1] <= t {
            s += 1;
        }
        s
    }
}

impl ControlPath for LinearPath {
    fn capabilities(&self) -> PathCapabilities {
        PathCapabilities::FULL
    }

    fn derivative(&self, tape: &mut Tape, t: BufId) -> CdeResult<State> {
        let s = self.segment(tape.scalar(t));
        Ok(State::Single(traced_select_seq(tape, self.slopes, s)))
    }

    fn evaluate(&self, tape: &mut Tape, t: BufId) -> CdeResult<State> {
        let s = self.segment(tape.scalar(t));
        let x_s = traced_select_seq(tape, self.values, s);
        let k_s = traced_slice(tape, self.knots, s, 1);
        let dt = traced_sub(tape, t, k_s);
        let slope = traced_select_seq(tape, self.slopes, s);
        let inc = traced_scale_by(tape, slope, dt);
        Ok(State::Single(traced_add(tape, x_s, inc)))
    }

    fn buffers(&self) -> Vec<BufId> {
        self.registry.buffers()
    }
}

/// Feeds the same control to every component of a tuple state.
#[derive(Debug, Clone)]
pub struct TuplePath {
    pub inner: LinearPath,
    pub arity: usize,
}

impl ControlPath for TuplePath {
    fn capabilities(&self) -> PathCapabilities {
        self.inner.capabilities()
    }

    fn derivative(&self, tape: &mut Tape, t: BufId) -> CdeResult<State> {
        let d = self.inner.derivative(tape, t)?.components()[0];
        Ok(State::Tuple(vec![d; self.arity]))
    }

    fn buffers(&self) -> Vec<BufId> {
        self.inner.buffers()
    }
}

/// Path that only knows how to be evaluated.
#[derive(Debug, Clone)]
pub struct NoDerivativePath(pub LinearPath);

impl ControlPath for NoDerivativePath {
    fn capabilities(&self) -> PathCapabilities {
        PathCapabilities { derivative: false, evaluate: true }
    }

    fn derivative(&self, _tape: &mut Tape, _t: BufId) -> CdeResult<State> {
        Err(CdeError::config("no derivative"))
    }
}

/// Knots 0..L-1 and random (batch..., L, channels) data.
pub fn random_path(tape: &mut Tape, rng: &mut SimpleRng, batch: &[usize], len: usize, channels: usize,
                   requires_grad: bool) -> (LinearPath, BufId, BufId) {
    let knots = tape.leaf(&linspace(0.0, (len - 1) as f64, len), vec![len], requires_grad);
    let mut shape = batch.to_vec();
    shape.push(len);
    shape.push(channels);
    let data = tape.leaf(&rand(rng, tensor::numel(&shape)), shape, requires_grad);
    let path = LinearPath::new(tape, knots, data).expect("path");
    (path, knots, data)
}

// ── Vector fields ────────────────────────────────────────────────────

/// f(t, z) = sigmoid(z)[..., None] + variable, variable: [1, 1, input].
#[derive(Debug, Clone)]
pub struct SigmoidField {
    pub variable: BufId,
    pub input: usize,
}

impl SigmoidField {
    pub fn new(tape: &mut Tape, rng: &mut SimpleRng, input: usize) -> Self {
        let variable = tape.register_param(&rand(rng, input), vec![1, 1, input]);
        SigmoidField { variable, input }
    }

    fn system(&self, tape: &mut Tape, z: BufId) -> BufId {
        let z_shape = tape.buf_shape(z).to_vec();
        let sig = traced_sigmoid(tape, z);
        let mut column = z_shape.clone();
        column.push(1);
        let sig = traced_reshape(tape, sig, column);
        let mut full = z_shape;
        full.push(self.input);
        let a = traced_broadcast_to(tape, sig, full.clone());
        let b = traced_broadcast_to(tape, self.variable, full);
        traced_add(tape, a, b)
    }
}

impl VectorField for SigmoidField {
    fn call(&self, tape: &mut Tape, _t: BufId, z: &State) -> CdeResult<State> {
        Ok(z.map(tape, |tp, zi| self.system(tp, zi)))
    }

    fn parameters(&self) -> Vec<BufId> {
        vec![self.variable]
    }
}

/// `SigmoidField` that also declares the `prod` shortcut.
#[derive(Debug, Clone)]
pub struct ProdField(pub SigmoidField);

impl VectorField for ProdField {
    fn capabilities(&self) -> FieldCapabilities {
        FieldCapabilities { prod: true }
    }

    fn call(&self, tape: &mut Tape, t: BufId, z: &State) -> CdeResult<State> {
        self.0.call(tape, t, z)
    }

    fn prod(&self, tape: &mut Tape, t: BufId, z: &State, dxdt: &State) -> CdeResult<State> {
        let system = self.0.call(tape, t, z)?;
        Ok(system.zip_map(dxdt, tape, traced_batch_matvec))
    }

    fn parameters(&self) -> Vec<BufId> {
        self.0.parameters()
    }
}

/// Counts how often the field is evaluated. Clones share the counter.
#[derive(Debug, Clone)]
pub struct CountingField {
    pub inner: SigmoidField,
    pub calls: Rc<Cell<usize>>,
}

impl CountingField {
    pub fn new(inner: SigmoidField) -> Self {
        CountingField { inner, calls: Rc::new(Cell::new(0)) }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl VectorField for CountingField {
    fn call(&self, tape: &mut Tape, t: BufId, z: &State) -> CdeResult<State> {
        self.calls.set(self.calls.get() + 1);
        self.inner.call(tape, t, z)
    }

    fn parameters(&self) -> Vec<BufId> {
        self.inner.parameters()
    }
}

/// f(t, concat(z, x)) = tanh(concat(z, x) @ w + b), for evaluate/derivative coupling.
#[derive(Debug, Clone)]
pub struct ConcatField {
    pub w: BufId,
    pub b: BufId,
}

impl ConcatField {
    pub fn new(tape: &mut Tape, rng: &mut SimpleRng, hidden: usize, input: usize) -> Self {
        let w = tape.register_param(&rng.vec_uniform((hidden + input) * hidden, 0.5),
                                    vec![hidden + input, hidden]);
        let b = tape.register_param(&rng.vec_uniform(hidden, 0.1), vec![hidden]);
        ConcatField { w, b }
    }
}

impl VectorField for ConcatField {
    fn call(&self, tape: &mut Tape, _t: BufId, z: &State) -> CdeResult<State> {
        Ok(z.map(tape, |tp, zi| {
            let y = traced_linear(tp, zi, self.w, self.b);
            traced_tanh(tp, y)
        }))
    }

    fn parameters(&self) -> Vec<BufId> {
        vec![self.w, self.b]
    }
}
