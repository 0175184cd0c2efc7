/// ODE integration on the tape.
///
/// `OdeIntegrator` is the seam the CDE layer integrates through. The shipped
/// backend, `RungeKutta`, provides explicit fixed-step methods (euler,
/// midpoint, rk4) and adaptive Dormand–Prince 5(4).
///
/// One stepping loop serves both differentiation modes:
///   - `Retention::Keep`: every accepted stage stays on the tape, so the
///     solution is differentiable by ordinary backward (direct mode).
///   - `Retention::Discard`: after each accepted step the tape is rewound and
///     the state re-enters as plain leaves. Memory stays bounded; gradients
///     come from the adjoint block instead.
///
/// Rejected adaptive steps are always rewound.

use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CdeError, CdeResult};
use crate::state::{State, StateLayout};
use crate::tape::{BufId, Tape, TapeMark};
use crate::traced::{traced_add, traced_scale, traced_slice, traced_sub};

pub const DEFAULT_RTOL: f64 = 1e-4;
pub const DEFAULT_ATOL: f64 = 1e-6;
pub const DEFAULT_MAX_NUM_STEPS: usize = 100_000;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

// ── Right-hand side and integrator traits ────────────────────────────

/// dy/dt = rhs(t, y). `t` is a one-element tape buffer.
pub trait OdeFunc {
    fn rhs(&self, tape: &mut Tape, t: BufId, y: &State) -> CdeResult<State>;

    /// Buffers the right-hand side reads that should receive gradients.
    fn parameters(&self) -> Vec<BufId>;
}

/// Counters for one solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SolveStats {
    pub nfev: usize,
    pub accepted: usize,
    pub rejected: usize,
}

impl SolveStats {
    pub fn merge(&mut self, other: SolveStats) {
        self.nfev += other.nfev;
        self.accepted += other.accepted;
        self.rejected += other.rejected;
    }
}

/// Solution at every requested time, `states[0]` being the initial state.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub states: Vec<State>,
    pub stats: SolveStats,
}

pub trait OdeIntegrator {
    /// Differentiate through the solver's internal operations.
    fn integrate(&self, tape: &mut Tape, func: &dyn OdeFunc, y0: &State, times: BufId,
                 opts: &SolverOptions) -> CdeResult<Trajectory>;

    /// Differentiate by solving the adjoint equations backwards in time.
    /// Gradients reach `y0`, `times` and `adjoint_params` only.
    fn integrate_adjoint(&self, tape: &mut Tape, func: Rc<dyn OdeFunc>, y0: &State, times: BufId,
                         opts: &SolverOptions, adjoint_params: &[BufId]) -> CdeResult<Trajectory>;
}

// ── Methods and options ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Euler,
    Midpoint,
    Rk4,
    #[default]
    Dopri5,
}

impl Method {
    pub fn is_adaptive(self) -> bool {
        matches!(self, Method::Dopri5)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Euler => "euler",
            Method::Midpoint => "midpoint",
            Method::Rk4 => "rk4",
            Method::Dopri5 => "dopri5",
        }
    }

    fn tableau(self) -> &'static Tableau {
        match self {
            Method::Euler => &EULER,
            Method::Midpoint => &MIDPOINT,
            Method::Rk4 => &RK4,
            Method::Dopri5 => &DOPRI5,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = CdeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "euler" => Ok(Method::Euler),
            "midpoint" => Ok(Method::Midpoint),
            "rk4" => Ok(Method::Rk4),
            "dopri5" => Ok(Method::Dopri5),
            _ => Err(CdeError::config(format!("method '{s}' not recognised"))),
        }
    }
}

/// Solver configuration. Adjoint settings fall back to the forward ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub method: Method,
    pub rtol: Option<f64>,
    pub atol: Option<f64>,
    /// Fixed-step methods: upper bound on the step. Each output interval is
    /// split into equal substeps no longer than this.
    pub step_size: Option<f64>,
    /// Adaptive methods: initial step magnitude.
    pub first_step: Option<f64>,
    pub max_num_steps: usize,
    pub adjoint_method: Option<Method>,
    pub adjoint_rtol: Option<f64>,
    pub adjoint_atol: Option<f64>,
    pub adjoint_step_size: Option<f64>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            method: Method::default(),
            rtol: None,
            atol: None,
            step_size: None,
            first_step: None,
            max_num_steps: DEFAULT_MAX_NUM_STEPS,
            adjoint_method: None,
            adjoint_rtol: None,
            adjoint_atol: None,
            adjoint_step_size: None,
        }
    }
}

impl SolverOptions {
    pub fn with_method(method: Method) -> Self {
        SolverOptions { method, ..SolverOptions::default() }
    }

    /// Fill unset tolerances with the CDE defaults (atol 1e-6, rtol 1e-4).
    pub fn with_default_tolerances(mut self) -> Self {
        self.rtol.get_or_insert(DEFAULT_RTOL);
        self.atol.get_or_insert(DEFAULT_ATOL);
        self
    }

    pub fn forward_control(&self) -> CdeResult<StepControl> {
        StepControl::new(
            self.method,
            self.rtol.unwrap_or(DEFAULT_RTOL),
            self.atol.unwrap_or(DEFAULT_ATOL),
            self.step_size,
            self.first_step,
            self.max_num_steps,
        )
    }

    pub fn adjoint_control(&self) -> CdeResult<StepControl> {
        let forward = self.forward_control()?;
        StepControl::new(
            self.adjoint_method.unwrap_or(forward.method),
            self.adjoint_rtol.unwrap_or(forward.rtol),
            self.adjoint_atol.unwrap_or(forward.atol),
            self.adjoint_step_size.or(forward.step_size),
            None,
            forward.max_num_steps,
        )
    }
}

/// Resolved, validated step settings for one direction of integration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepControl {
    pub method: Method,
    pub rtol: f64,
    pub atol: f64,
    pub step_size: Option<f64>,
    pub first_step: Option<f64>,
    pub max_num_steps: usize,
}

impl StepControl {
    pub fn new(method: Method, rtol: f64, atol: f64, step_size: Option<f64>,
               first_step: Option<f64>, max_num_steps: usize) -> CdeResult<Self> {
        if !(rtol >= 0.0 && rtol.is_finite()) || !(atol >= 0.0 && atol.is_finite()) {
            return Err(CdeError::config(format!(
                "tolerances must be finite and non-negative, got rtol={rtol} atol={atol}"
            )));
        }
        if rtol == 0.0 && atol == 0.0 && method.is_adaptive() {
            return Err(CdeError::config("rtol and atol cannot both be zero"));
        }
        for (name, v) in [("step_size", step_size), ("first_step", first_step)] {
            if let Some(v) = v {
                if !(v > 0.0 && v.is_finite()) {
                    return Err(CdeError::config(format!("{name} must be positive, got {v}")));
                }
            }
        }
        if max_num_steps == 0 {
            return Err(CdeError::config("max_num_steps must be at least 1"));
        }
        Ok(StepControl { method, rtol, atol, step_size, first_step, max_num_steps })
    }
}

// ── Butcher tableaus ─────────────────────────────────────────────────

struct Tableau {
    c: &'static [f64],
    a: &'static [&'static [f64]],
    b: &'static [f64],
    /// Error weights b - b̂ over the stages plus the first-same-as-last stage.
    e: Option<&'static [f64]>,
}

static EULER: Tableau = Tableau { c: &[0.0], a: &[&[]], b: &[1.0], e: None };

static MIDPOINT: Tableau = Tableau {
    c: &[0.0, 0.5],
    a: &[&[], &[0.5]],
    b: &[0.0, 1.0],
    e: None,
};

static RK4: Tableau = Tableau {
    c: &[0.0, 0.5, 0.5, 1.0],
    a: &[&[], &[0.5], &[0.0, 0.5], &[0.0, 0.0, 1.0]],
    b: &[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
    e: None,
};

static DOPRI5: Tableau = Tableau {
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0],
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
        &[9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0],
    ],
    b: &[35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0],
    e: Some(&[
        71.0 / 57600.0, 0.0, -71.0 / 16695.0, 71.0 / 1920.0,
        -17253.0 / 339200.0, 22.0 / 525.0, -1.0 / 40.0,
    ]),
};

// ── Reference backend ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct RungeKutta;

impl OdeIntegrator for RungeKutta {
    fn integrate(&self, tape: &mut Tape, func: &dyn OdeFunc, y0: &State, times: BufId,
                 opts: &SolverOptions) -> CdeResult<Trajectory> {
        let control = opts.forward_control()?;
        log::debug!("direct solve: method={} rtol={} atol={} over {} times",
                    control.method, control.rtol, control.atol, tape.buf_numel(times));
        let mut states = Vec::with_capacity(tape.buf_numel(times));
        let stats = run(tape, func, y0, times, &control, Retention::Keep, &mut |_, y| {
            states.push(y.clone());
            Ok(())
        })?;
        Ok(Trajectory { states, stats })
    }

    fn integrate_adjoint(&self, tape: &mut Tape, func: Rc<dyn OdeFunc>, y0: &State, times: BufId,
                         opts: &SolverOptions, adjoint_params: &[BufId]) -> CdeResult<Trajectory> {
        let forward = opts.forward_control()?;
        let backward = opts.adjoint_control()?;
        crate::adjoint::solve(tape, func, y0, times, forward, backward, adjoint_params)
    }
}

// ── Stepping loop ────────────────────────────────────────────────────

/// What happens to the tape after each accepted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Keep,
    Discard,
}

/// Current time, state and (for FSAL methods) the last stage derivative.
struct Cursor {
    t: BufId,
    y: State,
    fsal: Option<State>,
}

struct Step {
    y: State,
    fsal: Option<State>,
    /// Error-weighted norm for adaptive methods.
    err: Option<f64>,
}

/// Integrate from `times[0]` through every entry of `times` (a 1-D buffer,
/// strictly monotone in either direction). `emit` sees the state at each
/// output time, starting with `y0`.
pub fn run(tape: &mut Tape, func: &dyn OdeFunc, y0: &State, times: BufId, control: &StepControl,
           retention: Retention,
           emit: &mut dyn FnMut(&Tape, &State) -> CdeResult<()>) -> CdeResult<SolveStats> {
    let t_vals = tape.buf_data(times).to_vec();
    let layout = StateLayout::of(tape, y0);
    let run_mark = tape.mark();
    let mut stats = SolveStats::default();

    emit(tape, y0)?;
    if t_vals.len() < 2 {
        return Ok(stats);
    }

    let t0 = traced_slice(tape, times, 0, 1);
    let mut cur = Cursor { t: t0, y: y0.clone(), fsal: None };
    let tableau = control.method.tableau();

    if control.method.is_adaptive() {
        let span = t_vals[t_vals.len() - 1] - t_vals[0];
        let mut h_abs = match control.first_step {
            Some(h) => h,
            None => initial_step(tape, func, &layout, &cur, span.signum(), control, &mut stats)?,
        }
        .min(span.abs());

        for k in 0..t_vals.len() - 1 {
            let t_end = t_vals[k + 1];
            let dir = (t_end - t_vals[k]).signum();
            loop {
                let t_now = tape.scalar(cur.t);
                let remaining = (t_end - t_now).abs();
                if stats.accepted + stats.rejected >= control.max_num_steps {
                    return Err(CdeError::numerical(format!(
                        "max_num_steps exceeded ({}) at t = {t_now}", control.max_num_steps
                    )));
                }
                if h_abs <= 16.0 * f64::EPSILON * t_now.abs().max(1.0) {
                    return Err(CdeError::numerical(format!("step size underflow at t = {t_now}")));
                }

                let last = h_abs >= remaining;
                let trial = tape.mark();
                let (target, h) = if last {
                    let target = traced_slice(tape, times, k + 1, 1);
                    (Some(target), traced_sub(tape, target, cur.t))
                } else {
                    (None, tape.constant(dir * h_abs))
                };
                let step = rk_step(tape, func, tableau, &layout, &cur, h, control, &mut stats)?;
                let err = step.err.unwrap_or(0.0);
                if !err.is_finite() {
                    return Err(CdeError::numerical(format!(
                        "non-finite error estimate at t = {t_now} with step {}", dir * h_abs
                    )));
                }
                let factor = if err == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * err.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
                };

                let used = if last { remaining } else { h_abs };
                if err <= 1.0 {
                    stats.accepted += 1;
                    cur.t = match target {
                        Some(target) => target,
                        None => traced_add(tape, cur.t, h),
                    };
                    cur.y = step.y;
                    cur.fsal = step.fsal;
                    // A step clipped to hit an output time does not shrink the next proposal.
                    h_abs = if last { h_abs.max(used * factor) } else { used * factor };
                    settle(tape, &layout, &mut cur, run_mark, retention);
                    if last {
                        emit(tape, &cur.y)?;
                        break;
                    }
                } else {
                    tape.rewind(trial);
                    stats.rejected += 1;
                    log::trace!("rejected step at t = {t_now}: h = {} err = {err:.3e}", dir * used);
                    h_abs = used * factor.min(1.0);
                }
            }
        }
    } else {
        for k in 0..t_vals.len() - 1 {
            let n = substeps(t_vals[k + 1] - t_vals[k], control.step_size);
            let mut interval: Option<(BufId, BufId)> = None;
            for j in 0..n {
                if stats.accepted >= control.max_num_steps {
                    return Err(CdeError::numerical(format!(
                        "max_num_steps exceeded ({}) at t = {}", control.max_num_steps, tape.scalar(cur.t)
                    )));
                }
                let (target, h) = match interval {
                    Some(bufs) if retention == Retention::Keep => bufs,
                    _ => {
                        let start = traced_slice(tape, times, k, 1);
                        let target = traced_slice(tape, times, k + 1, 1);
                        let dt = traced_sub(tape, target, start);
                        let bufs = (target, traced_scale(tape, dt, 1.0 / n as f64));
                        interval = Some(bufs);
                        bufs
                    }
                };
                let step = rk_step(tape, func, tableau, &layout, &cur, h, control, &mut stats)?;
                stats.accepted += 1;
                cur.t = if j + 1 == n { target } else { traced_add(tape, cur.t, h) };
                cur.y = step.y;
                settle(tape, &layout, &mut cur, run_mark, retention);
            }
            emit(tape, &cur.y)?;
        }
    }

    Ok(stats)
}

/// Number of equal substeps for one output interval.
fn substeps(dt: f64, step_size: Option<f64>) -> usize {
    match step_size {
        Some(s) => {
            let ratio = dt.abs() / s;
            // Absorb rounding so 1.0 / 0.5 stays exactly two steps.
            (ratio * (1.0 - 1e-12)).ceil().max(1.0) as usize
        }
        None => 1,
    }
}

/// In discard mode, rewind to `run_mark` and re-enter the cursor as leaves.
fn settle(tape: &mut Tape, layout: &StateLayout, cur: &mut Cursor, run_mark: TapeMark,
          retention: Retention) {
    if retention == Retention::Keep {
        return;
    }
    let t = tape.scalar(cur.t);
    let y = layout.flatten(tape, &cur.y);
    let fsal = cur.fsal.as_ref().map(|k| layout.flatten(tape, k));
    tape.rewind(run_mark);
    cur.t = tape.constant(t);
    cur.y = layout.to_leaves(tape, &y, false);
    cur.fsal = fsal.map(|k| layout.to_leaves(tape, &k, false));
}

/// y + h * Σ coeffs[j] * ks[j], skipping zero coefficients.
fn combine(tape: &mut Tape, y: &State, h: BufId, coeffs: &[f64], ks: &[State]) -> State {
    let mut acc: Option<State> = None;
    for (&a, k) in coeffs.iter().zip(ks.iter()) {
        if a == 0.0 {
            continue;
        }
        let term = k.scale(a, tape);
        acc = Some(match acc {
            None => term,
            Some(s) => s.add(&term, tape),
        });
    }
    match acc {
        None => y.clone(),
        Some(s) => {
            let inc = s.scale_by(h, tape);
            y.add(&inc, tape)
        }
    }
}

fn stage_time(tape: &mut Tape, t: BufId, h: BufId, c: f64) -> BufId {
    if c == 0.0 {
        t
    } else if c == 1.0 {
        traced_add(tape, t, h)
    } else {
        let ch = traced_scale(tape, h, c);
        traced_add(tape, t, ch)
    }
}

#[allow(clippy::too_many_arguments)]
fn rk_step(tape: &mut Tape, func: &dyn OdeFunc, tableau: &Tableau, layout: &StateLayout,
           cur: &Cursor, h: BufId, control: &StepControl, stats: &mut SolveStats) -> CdeResult<Step> {
    let k1 = match &cur.fsal {
        Some(k) => k.clone(),
        None => {
            stats.nfev += 1;
            func.rhs(tape, cur.t, &cur.y)?
        }
    };
    let mut ks = vec![k1];
    for (i, (&c, a)) in tableau.c.iter().zip(tableau.a.iter()).enumerate().skip(1) {
        debug_assert_eq!(a.len(), i);
        let ti = stage_time(tape, cur.t, h, c);
        let yi = combine(tape, &cur.y, h, a, &ks);
        stats.nfev += 1;
        ks.push(func.rhs(tape, ti, &yi)?);
    }
    let y_new = combine(tape, &cur.y, h, tableau.b, &ks);

    let Some(e) = tableau.e else {
        return Ok(Step { y: y_new, fsal: None, err: None });
    };

    let t_new = traced_add(tape, cur.t, h);
    stats.nfev += 1;
    let k_last = func.rhs(tape, t_new, &y_new)?;
    ks.push(k_last.clone());

    let h_val = tape.scalar(h);
    let mut err_vec = vec![0.0f64; layout.numel()];
    for (&ei, k) in e.iter().zip(ks.iter()) {
        if ei != 0.0 {
            crate::tensor::axpy_f64(&mut err_vec, h_val * ei, &layout.flatten(tape, k));
        }
    }
    let y0 = layout.flatten(tape, &cur.y);
    let y1 = layout.flatten(tape, &y_new);
    let err = error_norm(&err_vec, &y0, &y1, control.rtol, control.atol);
    Ok(Step { y: y_new, fsal: Some(k_last), err: Some(err) })
}

/// RMS of err / (atol + rtol * max(|y0|, |y1|)).
pub fn error_norm(err: &[f64], y0: &[f64], y1: &[f64], rtol: f64, atol: f64) -> f64 {
    if err.is_empty() {
        return 0.0;
    }
    let sum: f64 = err.iter().zip(y0.iter().zip(y1.iter()))
        .map(|(e, (a, b))| {
            let scale = atol + rtol * a.abs().max(b.abs());
            (e / scale).powi(2)
        })
        .sum();
    (sum / err.len() as f64).sqrt()
}

/// Hairer's starting step estimate. Evaluations are rewound.
fn initial_step(tape: &mut Tape, func: &dyn OdeFunc, layout: &StateLayout, cur: &Cursor, dir: f64,
                control: &StepControl, stats: &mut SolveStats) -> CdeResult<f64> {
    let mark = tape.mark();
    let result = estimate_initial_step(tape, func, layout, cur, dir, control, stats);
    tape.rewind(mark);
    result
}

fn estimate_initial_step(tape: &mut Tape, func: &dyn OdeFunc, layout: &StateLayout, cur: &Cursor,
                         dir: f64, control: &StepControl, stats: &mut SolveStats) -> CdeResult<f64> {
    let y0 = layout.flatten(tape, &cur.y);
    let zeros = vec![0.0; y0.len()];
    let scaled = |v: &[f64]| error_norm(v, &y0, &zeros, control.rtol, control.atol);

    stats.nfev += 1;
    let f0_state = func.rhs(tape, cur.t, &cur.y)?;
    let f0 = layout.flatten(tape, &f0_state);
    let (d0, d1) = (scaled(&y0), scaled(&f0));
    let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };

    let y1: Vec<f64> = y0.iter().zip(f0.iter()).map(|(y, f)| y + dir * h0 * f).collect();
    let y1_state = layout.to_leaves(tape, &y1, false);
    let t1_value = tape.scalar(cur.t) + dir * h0;
    let t1 = tape.constant(t1_value);
    stats.nfev += 1;
    let f1_state = func.rhs(tape, t1, &y1_state)?;
    let f1 = layout.flatten(tape, &f1_state);
    let diff: Vec<f64> = f1.iter().zip(f0.iter()).map(|(a, b)| a - b).collect();
    let d2 = scaled(&diff) / h0;

    let h1 = if d1.max(d2) <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / 5.0)
    };
    Ok((100.0 * h0).min(h1))
}

// ── Tests ────────────────────────────────────────────────────────────
