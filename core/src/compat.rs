/// Compatibility checks run once before integration.
///
/// Validates that the control path, the vector field and the initial state
/// agree on structure (single vs tuple), batch shape and channel counts. The
/// trial evaluation runs X and f once at t[0] and is rewound off the tape, so a
/// failed check leaves no trace and no integration work has been done.
///
/// All failures are collected into precise messages naming both shapes.

use crate::adapter::Coupling;
use crate::error::{CdeError, CdeResult};
use crate::field::VectorField;
use crate::path::ControlPath;
use crate::state::{State, StructuralMode};
use crate::tape::{BufId, Tape};
use crate::tensor::{batch_shape, channels, fmt_shape};
use crate::traced::traced_concat_last;

/// Outcome of a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compatibility {
    pub mode: StructuralMode,
    pub has_prod: bool,
}

/// Time grid must be a non-empty, finite 1-D buffer, strictly monotone in
/// either direction. A decreasing grid integrates backwards.
pub fn check_times(tape: &Tape, t: BufId) -> CdeResult<()> {
    let shape = tape.buf_shape(t);
    if shape.len() != 1 {
        return Err(CdeError::config(format!(
            "t must be one dimensional, got shape {}.", fmt_shape(shape)
        )));
    }
    let times = tape.buf_data(t);
    if times.is_empty() {
        return Err(CdeError::config("t must contain at least one time."));
    }
    if let Some(bad) = times.iter().position(|v| !v.is_finite()) {
        return Err(CdeError::config(format!("t[{bad}] is not finite.")));
    }
    let direction = match times {
        [first, second, ..] => (second - first).signum(),
        _ => return Ok(()),
    };
    if let Some(k) = times.windows(2).position(|w| (w[1] - w[0]) * direction <= 0.0) {
        return Err(CdeError::config(format!(
            "t must be strictly monotone, but t[{}]={} and t[{}]={}.",
            k, times[k], k + 1, times[k + 1]
        )));
    }
    Ok(())
}

/// Capability and coupling checks that need no evaluation.
pub fn check_configuration<X, F>(x: &X, f: &F, coupling: Coupling) -> CdeResult<bool>
where
    X: ControlPath + ?Sized,
    F: VectorField + ?Sized,
{
    let path_caps = x.capabilities();
    if !path_caps.derivative {
        return Err(CdeError::config("X must have a 'derivative' method."));
    }
    let has_prod = f.capabilities().prod;
    if has_prod && coupling != Coupling::Matmul {
        return Err(CdeError::config(format!(
            "func.prod is only supported with the 'matmul' vector_field_type, not '{coupling}'."
        )));
    }
    if coupling == Coupling::Evaluate && !path_caps.evaluate {
        return Err(CdeError::config(
            "X must have an 'evaluate' method to use the 'evaluate' vector_field_type.",
        ));
    }
    Ok(has_prod)
}

/// Full pre-flight check. Returns the structural mode and whether the field's
/// `prod` shortcut will be used.
pub fn check<X, F>(tape: &mut Tape, x: &X, f: &F, z0: &State, t: BufId,
                   coupling: Coupling) -> CdeResult<Compatibility>
where
    X: ControlPath + ?Sized,
    F: VectorField + ?Sized,
{
    let has_prod = check_configuration(x, f, coupling)?;
    check_state(tape, z0)?;

    let mark = tape.mark();
    let result = trial_evaluation(tape, x, f, z0, t, coupling, has_prod);
    tape.rewind(mark);
    result?;

    Ok(Compatibility { mode: z0.mode(), has_prod })
}

fn check_state(tape: &Tape, z0: &State) -> CdeResult<()> {
    if z0.is_empty() {
        return Err(CdeError::config("z0 must either a tensor or a tuple/list of tensors."));
    }
    let first = tape.buf_shape(z0.components()[0]);
    for &id in z0.components() {
        let shape = tape.buf_shape(id);
        if shape.is_empty() {
            return Err(CdeError::shape(
                "z0 must have a channel dimension: expected shape (..., hidden_channels).",
            ));
        }
        if batch_shape(shape) != batch_shape(first) {
            return Err(CdeError::shape(format!(
                "every element of z0 must share the same batch dimensions, got {} and {}.",
                fmt_shape(first), fmt_shape(shape)
            )));
        }
    }
    Ok(())
}

fn trial_evaluation<X, F>(tape: &mut Tape, x: &X, f: &F, z0: &State, t: BufId, coupling: Coupling,
               has_prod: bool) -> CdeResult<()>
where
    X: ControlPath + ?Sized,
    F: VectorField + ?Sized,
{
    let mode = z0.mode();
    let t0_value = tape.buf_data(t)[0];
    let t0 = tape.leaf(&[t0_value], vec![1], false);

    let control_gradient = x.derivative(tape, t0)?;
    require_structure(z0, &control_gradient, "X.derivative", "X.derivative(t)")?;
    for (&cg, &z) in control_gradient.components().iter().zip(z0.components()) {
        check_base(tape, cg, z, "X.derivative")?;
    }

    match coupling {
        Coupling::Matmul if has_prod => {
            let vector_field = f.prod(tape, t0, z0, &control_gradient)?;
            require_structure(z0, &vector_field, "func.prod", "func.prod(t, z, dXdt)")?;
            for (&vf, &z) in vector_field.components().iter().zip(z0.components()) {
                let (vf_shape, z_shape) = (tape.buf_shape(vf), tape.buf_shape(z));
                if vf_shape != z_shape {
                    return Err(CdeError::shape(format!(
                        "func.prod did not return a tensor with the same shape as z0. func.prod returned shape {} \
                         whilst z0 has shape {}.",
                        fmt_shape(vf_shape), fmt_shape(z_shape)
                    )));
                }
            }
        }
        Coupling::Matmul => {
            let system = f.call(tape, t0, z0)?;
            require_structure(z0, &system, "func", "func(t, z)")?;
            for ((&sys, &cg), &z) in system.components().iter()
                .zip(control_gradient.components()).zip(z0.components()) {
                check_forward(tape, cg, sys, z)?;
            }
        }
        Coupling::Evaluate | Coupling::Derivative => {
            let data = if coupling == Coupling::Evaluate {
                let value = x.evaluate(tape, t0)?;
                require_structure(z0, &value, "X.evaluate", "X.evaluate(t)")?;
                for (&v, &z) in value.components().iter().zip(z0.components()) {
                    check_base(tape, v, z, "X.evaluate")?;
                }
                value
            } else {
                control_gradient
            };
            let inputs = z0.zip_map(&data, tape, |tp, z, d| traced_concat_last(tp, &[z, d]));
            let out = f.call(tape, t0, &inputs)?;
            require_structure(z0, &out, "func", "func(t, z)")?;
            for (&o, &z) in out.components().iter().zip(z0.components()) {
                let (o_shape, z_shape) = (tape.buf_shape(o), tape.buf_shape(z));
                if o_shape != z_shape {
                    return Err(CdeError::shape(format!(
                        "func did not return a tensor with the same shape as z0. func returned shape {} \
                         whilst z0 has shape {}.",
                        fmt_shape(o_shape), fmt_shape(z_shape)
                    )));
                }
            }
        }
    }

    debug_assert_eq!(mode, z0.mode());
    Ok(())
}

/// Same structural mode as z0, and the same tuple length.
fn require_structure(z0: &State, other: &State, who: &str, call: &str) -> CdeResult<()> {
    let mode = z0.mode();
    if other.mode() != mode {
        return Err(CdeError::config(format!(
            "z0 is {m} and so {who} must return {m} as well.", m = mode.describe()
        )));
    }
    if mode == StructuralMode::Tuple && other.len() != z0.len() {
        return Err(CdeError::config(format!("z0 and {call} must be tuples of the same length.")));
    }
    Ok(())
}

/// `who` names the path method that produced `control`.
fn check_base(tape: &Tape, control: BufId, z0: BufId, who: &str) -> CdeResult<()> {
    let (cg, z) = (tape.buf_shape(control), tape.buf_shape(z0));
    if cg.is_empty() || batch_shape(cg) != batch_shape(z) {
        return Err(CdeError::shape(format!(
            "{who} did not return a tensor with the same number of batch dimensions as z0. \
             {who} returned shape {} (meaning {} batch dimensions), whilst z0 has shape {} \
             (meaning {} batch dimensions).",
            fmt_shape(cg), fmt_shape(batch_shape(cg)), fmt_shape(z), fmt_shape(batch_shape(z))
        )));
    }
    Ok(())
}

fn check_forward(tape: &Tape, control_gradient: BufId, system: BufId, z0: BufId) -> CdeResult<()> {
    let (cg, sys, z) = (tape.buf_shape(control_gradient), tape.buf_shape(system), tape.buf_shape(z0));
    let sys_batch = &sys[..sys.len().saturating_sub(2)];
    if sys.len() < 2 || sys_batch != batch_shape(z) {
        return Err(CdeError::shape(format!(
            "func did not return a tensor with the same number of batch dimensions as z0. func returned \
             shape {} (meaning {} batch dimensions), whilst z0 has shape {} (meaning {} batch dimensions).",
            fmt_shape(sys), fmt_shape(sys_batch), fmt_shape(z), fmt_shape(batch_shape(z))
        )));
    }
    let hidden = sys[sys.len() - 2];
    if hidden != channels(z) {
        return Err(CdeError::shape(format!(
            "func did not return a tensor with the same number of hidden channels as z0. func returned \
             shape {} (meaning {} channels), whilst z0 has shape {} (meaning {} channels).",
            fmt_shape(sys), hidden, fmt_shape(z), channels(z)
        )));
    }
    if channels(sys) != channels(cg) {
        return Err(CdeError::shape(format!(
            "func did not return a tensor with the same number of input channels as X.derivative \
             returned. func returned shape {} (meaning {} channels), whilst X.derivative returned shape \
             {} (meaning {} channels).",
            fmt_shape(sys), channels(sys), fmt_shape(cg), channels(cg)
        )));
    }
    Ok(())
}
