/// Adjoint-mode solve as one opaque tape block.
///
/// Forward: integrate numerically with the tape rewound after every step, and
/// expose the solution at each requested time as fresh leaves.
///
/// Backward: integrate the augmented system
///
///   d/dt [vjp_t, y, a, a_θ] = [-a·∂f/∂t, f(t, y), -a·∂f/∂y, -a·∂f/∂θ]
///
/// from t[-1] back to t[0], one output interval at a time. At each output
/// time y is reset to its stored forward value and that output's cotangent is
/// added to a. The time cotangent at t_i (i > 0) is f(t_i, y_i) · dL/dy_i;
/// at t_0 it is the integrated vjp_t.
///
/// Only `y0`, `times` and the declared parameters receive gradients.

use std::fmt;
use std::rc::Rc;

use crate::error::CdeResult;
use crate::solver::{run, OdeFunc, Retention, SolveStats, StepControl, Trajectory};
use crate::state::{State, StateLayout, StructuralMode};
use crate::tape::{BufId, OpaqueVjp, Tape};
use crate::tensor;

pub(crate) fn solve(tape: &mut Tape, func: Rc<dyn OdeFunc>, y0: &State, times: BufId,
                    forward: StepControl, backward: StepControl,
                    adjoint_params: &[BufId]) -> CdeResult<Trajectory> {
    let layout = StateLayout::of(tape, y0);
    let t_vals = tape.buf_data(times).to_vec();

    let mark = tape.mark();
    let mut values: Vec<Vec<f64>> = Vec::with_capacity(t_vals.len());
    let result = run(tape, func.as_ref(), y0, times, &forward, Retention::Discard, &mut |tp, y| {
        values.push(layout.flatten(tp, y));
        Ok(())
    });
    tape.rewind(mark);
    let stats = result?;

    let mut params: Vec<BufId> = Vec::with_capacity(adjoint_params.len());
    for &p in adjoint_params {
        if !params.contains(&p) {
            params.push(p);
        }
    }

    let states: Vec<State> = values.iter().map(|v| layout.to_leaves(tape, v, false)).collect();
    let outputs: Vec<BufId> = states.iter().flat_map(|s| s.components().to_vec()).collect();
    let mut inputs: Vec<BufId> = y0.components().to_vec();
    inputs.push(times);
    inputs.extend(params.iter().copied());

    log::debug!("adjoint solve: {} outputs, {} declared parameters, {} accepted steps",
                t_vals.len(), params.len(), stats.accepted);

    let param_shapes = params.iter().map(|&p| tape.buf_shape(p).to_vec()).collect();
    let block = AdjointSolve {
        func,
        layout,
        times: t_vals,
        values,
        params,
        param_shapes,
        control: backward,
    };
    tape.record_opaque(Rc::new(block), inputs, outputs);

    Ok(Trajectory { states, stats })
}

struct AdjointSolve {
    func: Rc<dyn OdeFunc>,
    layout: StateLayout,
    times: Vec<f64>,
    /// Forward solution at each time, flattened.
    values: Vec<Vec<f64>>,
    params: Vec<BufId>,
    param_shapes: Vec<Vec<usize>>,
    control: StepControl,
}

impl fmt::Debug for AdjointSolve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdjointSolve")
            .field("times", &self.times)
            .field("state_shapes", &self.layout.shapes)
            .field("params", &self.params)
            .field("method", &self.control.method)
            .finish()
    }
}

impl AdjointSolve {
    /// f(t, y) for stored values, evaluated off the tape.
    fn eval_rhs(&self, tape: &mut Tape, t: f64, y: &[f64]) -> CdeResult<Vec<f64>> {
        let mark = tape.mark();
        let result = (|| -> CdeResult<Vec<f64>> {
            let t_buf = tape.constant(t);
            let y_state = self.layout.to_leaves(tape, y, false);
            let out = self.func.rhs(tape, t_buf, &y_state)?;
            Ok(self.layout.flatten(tape, &out))
        })();
        tape.rewind(mark);
        result
    }

    fn augmented_layout(&self) -> StateLayout {
        let mut shapes = vec![vec![1]];
        shapes.extend(self.layout.shapes.iter().cloned());
        shapes.extend(self.layout.shapes.iter().cloned());
        shapes.extend(self.param_shapes.iter().cloned());
        StateLayout { mode: StructuralMode::Tuple, shapes }
    }
}

impl OpaqueVjp for AdjointSolve {
    fn name(&self) -> &str {
        "adjoint_solve"
    }

    fn backward(&self, tape: &mut Tape, d_outputs: &[&[f64]], d_inputs: &mut [Vec<f64>]) -> CdeResult<()> {
        let n_comp = self.layout.shapes.len();
        let n_times = self.times.len();
        let ny = self.layout.numel();

        let grad_y: Vec<Vec<f64>> = d_outputs.chunks(n_comp).map(|parts| parts.concat()).collect();
        debug_assert_eq!(grad_y.len(), n_times);

        let aug_layout = self.augmented_layout();
        let (y_at, a_at, p_at) = (1, 1 + ny, 1 + 2 * ny);
        let mut aug = vec![0.0f64; aug_layout.numel()];
        aug[y_at..a_at].copy_from_slice(&self.values[n_times - 1]);
        aug[a_at..p_at].copy_from_slice(&grad_y[n_times - 1]);

        let mut time_vjps = vec![0.0f64; n_times];
        let mut stats = SolveStats::default();
        let dynamics = AugmentedDynamics {
            func: self.func.as_ref(),
            layout: &self.layout,
            params: &self.params,
        };

        for i in (1..n_times).rev() {
            let f_i = self.eval_rhs(tape, self.times[i], &self.values[i])?;
            let d_t = tensor::dot_f64(&f_i, &grad_y[i]);
            aug[0] -= d_t;
            time_vjps[i] = d_t;

            log::debug!("adjoint interval [{}, {}]", self.times[i], self.times[i - 1]);
            let mark = tape.mark();
            let result = (|| -> CdeResult<(Option<Vec<f64>>, SolveStats)> {
                let interval = tape.alloc(vec![self.times[i], self.times[i - 1]], vec![2]);
                let start = aug_layout.to_leaves(tape, &aug, false);
                let mut end = None;
                let s = run(tape, &dynamics, &start, interval, &self.control, Retention::Discard,
                            &mut |tp, z| {
                                end = Some(aug_layout.flatten(tp, z));
                                Ok(())
                            })?;
                Ok((end, s))
            })();
            tape.rewind(mark);
            let (end, s) = result?;
            stats.merge(s);
            if let Some(end) = end {
                aug = end;
            }

            aug[y_at..a_at].copy_from_slice(&self.values[i - 1]);
            tensor::axpy_f64(&mut aug[a_at..p_at], 1.0, &grad_y[i - 1]);
        }
        time_vjps[0] = aug[0];
        log::debug!("adjoint backward: {} evaluations, {} accepted, {} rejected",
                    stats.nfev, stats.accepted, stats.rejected);

        let mut offset = a_at;
        for (slot, n) in d_inputs.iter_mut().zip(self.layout.sizes()) {
            tensor::axpy_f64(slot, 1.0, &aug[offset..offset + n]);
            offset += n;
        }
        tensor::axpy_f64(&mut d_inputs[n_comp], 1.0, &time_vjps);
        let mut offset = p_at;
        for (slot, shape) in d_inputs[n_comp + 1..].iter_mut().zip(self.param_shapes.iter()) {
            let n = tensor::numel(shape);
            tensor::axpy_f64(slot, 1.0, &aug[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }
}

/// Right-hand side of the augmented backward system. State components are
/// [vjp_t, y..., a..., a_θ...].
struct AugmentedDynamics<'a> {
    func: &'a dyn OdeFunc,
    layout: &'a StateLayout,
    params: &'a [BufId],
}

impl OdeFunc for AugmentedDynamics<'_> {
    fn rhs(&self, tape: &mut Tape, t: BufId, z: &State) -> CdeResult<State> {
        let n_comp = self.layout.shapes.len();
        let comps = z.components();
        let t_value = tape.scalar(t);
        let y: Vec<f64> = comps[1..1 + n_comp].iter().flat_map(|&id| tape.buf_data(id).to_vec()).collect();
        let cotangents: Vec<Vec<f64>> = comps[1 + n_comp..1 + 2 * n_comp].iter()
            .map(|&id| tape.buf_data(id).iter().map(|a| -a).collect())
            .collect();

        let mark = tape.mark();
        let t_leaf = tape.leaf(&[t_value], vec![1], true);
        let y_state = self.layout.to_leaves(tape, &y, true);
        let f_eval = match self.func.rhs(tape, t_leaf, &y_state) {
            Ok(f) => f,
            Err(e) => {
                tape.rewind(mark);
                return Err(e);
            }
        };
        let f_values: Vec<Vec<f64>> = f_eval.components().iter().map(|&id| tape.buf_data(id).to_vec()).collect();

        let mut wrt = vec![t_leaf];
        wrt.extend_from_slice(y_state.components());
        wrt.extend_from_slice(self.params);
        let grads = tape.vjp(mark, f_eval.components(), &cotangents, &wrt);
        tape.rewind(mark);
        let mut grads = grads?.into_iter();

        let mut out = Vec::with_capacity(comps.len());
        if let Some(g_t) = grads.next() {
            out.push(tape.alloc(g_t, vec![1]));
        }
        for (f, shape) in f_values.into_iter().zip(self.layout.shapes.iter()) {
            out.push(tape.alloc(f, shape.clone()));
        }
        for (g, &id) in grads.zip(comps[1 + n_comp..].iter()) {
            let shape = tape.buf_shape(id).to_vec();
            out.push(tape.alloc(g, shape));
        }
        Ok(State::Tuple(out))
    }

    fn parameters(&self) -> Vec<BufId> {
        Vec::new()
    }
}
