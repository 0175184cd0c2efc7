/// Traced forward wrappers: tape-aware computation that records ops for backward.
///
/// Each wrapper:
///   1. Reads inputs from the tape arena
///   2. Computes the forward value with the flat kernels in `tensor`
///   3. Allocates the output in the tape arena
///   4. Records the TapeOp
///   5. Returns the output BufId
///
/// Shapes are `(batch..., channels)`; batch axes are flattened to a row count.
/// Shape violations here are programming errors (callers validate user-facing
/// shapes up front) and panic.

use crate::tape::{BufId, Tape, TapeOp};
use crate::tensor;

// ── Linear algebra ───────────────────────────────────────────────────

/// Matrix multiply: out = A @ B, A: [m, k], B: [k, n].
pub fn traced_matmul(tape: &mut Tape, a: BufId, b: BufId, m: usize, k: usize, n: usize) -> BufId {
    let mut out = vec![0.0f64; m * n];
    tensor::matmul_f64(tape.buf_data(a), tape.buf_data(b), &mut out, m, k, n);
    tape.record_with_output(out, vec![m, n], |out_id| {
        TapeOp::Matmul { a, b, out: out_id, m, k, n }
    })
}

/// Batched matrix-vector product: A: (batch..., h, i), x: (batch..., i) → (batch..., h).
pub fn traced_batch_matvec(tape: &mut Tape, a: BufId, x: BufId) -> BufId {
    let a_shape = tape.buf_shape(a).to_vec();
    let x_shape = tape.buf_shape(x).to_vec();
    assert!(a_shape.len() >= 2, "traced_batch_matvec: system must be at least 2-D, got {a_shape:?}");
    let (h, i) = (a_shape[a_shape.len() - 2], a_shape[a_shape.len() - 1]);
    let batch = &a_shape[..a_shape.len() - 2];
    assert_eq!(tensor::batch_shape(&x_shape), batch, "traced_batch_matvec: batch mismatch");
    assert_eq!(tensor::channels(&x_shape), i, "traced_batch_matvec: input channel mismatch");
    let rows = tensor::numel(batch);

    let mut out = vec![0.0f64; rows * h];
    tensor::batch_matvec_f64(tape.buf_data(a), tape.buf_data(x), &mut out, rows, h, i);
    let mut shape = batch.to_vec();
    shape.push(h);
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::BatchMatVec { a, x, out: out_id, rows, h, i }
    })
}

/// Dense layer over the last axis: x (batch..., d_in) @ w [d_in, d_out] + b [d_out].
pub fn traced_linear(tape: &mut Tape, x: BufId, w: BufId, b: BufId) -> BufId {
    let x_shape = tape.buf_shape(x).to_vec();
    let w_shape = tape.buf_shape(w).to_vec();
    let (d_in, d_out) = (w_shape[0], w_shape[1]);
    assert_eq!(tensor::channels(&x_shape), d_in, "traced_linear: input width mismatch");
    let rows = tensor::numel(tensor::batch_shape(&x_shape));

    let x2 = traced_reshape(tape, x, vec![rows, d_in]);
    let y = traced_matmul(tape, x2, w, rows, d_in, d_out);
    let bias = traced_broadcast_to(tape, b, vec![rows, d_out]);
    let y = traced_add(tape, y, bias);
    let mut shape = tensor::batch_shape(&x_shape).to_vec();
    shape.push(d_out);
    traced_reshape(tape, y, shape)
}

// ── Element-wise ─────────────────────────────────────────────────────

fn elementwise(tape: &Tape, a: BufId, b: BufId, f: impl Fn(f64, f64) -> f64) -> (Vec<f64>, Vec<usize>) {
    assert_eq!(tape.buf_shape(a), tape.buf_shape(b),
               "element-wise op on mismatched shapes {:?} vs {:?}", tape.buf_shape(a), tape.buf_shape(b));
    let out = tape.buf_data(a).iter().zip(tape.buf_data(b).iter()).map(|(&x, &y)| f(x, y)).collect();
    (out, tape.buf_shape(a).to_vec())
}

fn unary(tape: &Tape, input: BufId, f: impl Fn(f64) -> f64) -> (Vec<f64>, Vec<usize>) {
    let out = tape.buf_data(input).iter().map(|&x| f(x)).collect();
    (out, tape.buf_shape(input).to_vec())
}

/// Element-wise add: out = a + b.
pub fn traced_add(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let (out, shape) = elementwise(tape, a, b, |x, y| x + y);
    tape.record_with_output(out, shape, |out_id| TapeOp::Add { a, b, out: out_id })
}

/// Element-wise subtract: out = a - b.
pub fn traced_sub(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let (out, shape) = elementwise(tape, a, b, |x, y| x - y);
    tape.record_with_output(out, shape, |out_id| TapeOp::Sub { a, b, out: out_id })
}

/// Element-wise multiply: out = a * b.
pub fn traced_mul(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let (out, shape) = elementwise(tape, a, b, |x, y| x * y);
    tape.record_with_output(out, shape, |out_id| TapeOp::Mul { a, b, out: out_id })
}

/// Scale by a constant: out = scalar * input.
pub fn traced_scale(tape: &mut Tape, input: BufId, scalar: f64) -> BufId {
    let (out, shape) = unary(tape, input, |x| scalar * x);
    tape.record_with_output(out, shape, |out_id| TapeOp::Scale { input, scalar, out: out_id })
}

/// Scale by a one-element tape buffer: out = s * input.
pub fn traced_scale_by(tape: &mut Tape, input: BufId, scalar: BufId) -> BufId {
    assert_eq!(tape.buf_numel(scalar), 1, "traced_scale_by: scalar must have one element");
    let s = tape.scalar(scalar);
    let (out, shape) = unary(tape, input, |x| s * x);
    tape.record_with_output(out, shape, |out_id| TapeOp::ScaleBy { input, scalar, out: out_id })
}

pub fn traced_reciprocal(tape: &mut Tape, input: BufId) -> BufId {
    let (out, shape) = unary(tape, input, |x| 1.0 / x);
    tape.record_with_output(out, shape, |out_id| TapeOp::Reciprocal { input, out: out_id })
}

/// Element-wise sigmoid: out = sigmoid(input).
pub fn traced_sigmoid(tape: &mut Tape, input: BufId) -> BufId {
    let (out, shape) = unary(tape, input, tensor::sigmoid_f64);
    tape.record_with_output(out, shape, |out_id| TapeOp::Sigmoid { input, out: out_id })
}

pub fn traced_tanh(tape: &mut Tape, input: BufId) -> BufId {
    let (out, shape) = unary(tape, input, f64::tanh);
    tape.record_with_output(out, shape, |out_id| TapeOp::Tanh { input, out: out_id })
}

// ── Reductions / reshape ─────────────────────────────────────────────

/// Sum of all elements, shape [1].
pub fn traced_sum(tape: &mut Tape, input: BufId) -> BufId {
    let s: f64 = tape.buf_data(input).iter().sum();
    tape.record_with_output(vec![s], vec![1], |out_id| TapeOp::Sum { input, out: out_id })
}

/// Numpy-style broadcast of `input` to `shape`.
pub fn traced_broadcast_to(tape: &mut Tape, input: BufId, shape: Vec<usize>) -> BufId {
    let map = tensor::broadcast_index_map(tape.buf_shape(input), &shape)
        .unwrap_or_else(|| panic!("cannot broadcast {:?} to {:?}", tape.buf_shape(input), shape));
    let data = tape.buf_data(input);
    let out: Vec<f64> = map.iter().map(|&src| data[src]).collect();
    tape.record_with_output(out, shape, |out_id| TapeOp::BroadcastTo { input, out: out_id })
}

/// Same data under a new shape with equal element count.
pub fn traced_reshape(tape: &mut Tape, input: BufId, shape: Vec<usize>) -> BufId {
    assert_eq!(tensor::numel(&shape), tape.buf_numel(input),
               "traced_reshape: {:?} → {:?} changes element count", tape.buf_shape(input), shape);
    let out = tape.buf_data(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Reshape { input, out: out_id })
}

// ── Concat / slice ───────────────────────────────────────────────────

/// Concatenate along the last axis. All inputs share the batch shape.
pub fn traced_concat_last(tape: &mut Tape, inputs: &[BufId]) -> BufId {
    assert!(!inputs.is_empty(), "traced_concat_last: no inputs");
    let batch = tensor::batch_shape(tape.buf_shape(inputs[0])).to_vec();
    let rows = tensor::numel(&batch);
    let mut sizes = Vec::with_capacity(inputs.len());
    for &id in inputs {
        let shape = tape.buf_shape(id);
        assert_eq!(tensor::batch_shape(shape), &batch[..], "traced_concat_last: batch mismatch");
        sizes.push(tensor::channels(shape));
    }
    let datas: Vec<&[f64]> = inputs.iter().map(|&id| tape.buf_data(id)).collect();
    let out = tensor::concat_last_f64(&datas, &sizes, rows);
    let mut shape = batch;
    shape.push(sizes.iter().sum());
    let inputs = inputs.to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Concat { inputs, out: out_id, rows, sizes })
}

/// Flat slice: out = input[offset..offset+len], shape [len].
pub fn traced_slice(tape: &mut Tape, input: BufId, offset: usize, len: usize) -> BufId {
    let input_len = tape.buf_numel(input);
    assert!(offset + len <= input_len, "traced_slice: {offset}+{len} > {input_len}");
    let out = tape.buf_data(input)[offset..offset + len].to_vec();
    tape.record_with_output(out, vec![len], |out_id| {
        TapeOp::Slice { input, out: out_id, offset, len, input_len }
    })
}

// ── Sequence axis ────────────────────────────────────────────────────

/// Stack same-shaped (batch..., C) buffers into (batch..., T, C).
pub fn traced_stack_seq(tape: &mut Tape, inputs: &[BufId]) -> BufId {
    assert!(!inputs.is_empty(), "traced_stack_seq: no inputs");
    let shape0 = tape.buf_shape(inputs[0]).to_vec();
    let rows = tensor::numel(tensor::batch_shape(&shape0));
    let cols = tensor::channels(&shape0);
    let seq = inputs.len();
    let mut out = vec![0.0f64; rows * seq * cols];
    for (k, &id) in inputs.iter().enumerate() {
        assert_eq!(tape.buf_shape(id), &shape0[..], "traced_stack_seq: shape mismatch at {k}");
        let data = tape.buf_data(id);
        for r in 0..rows {
            let dst = (r * seq + k) * cols;
            out[dst..dst + cols].copy_from_slice(&data[r * cols..(r + 1) * cols]);
        }
    }
    let mut shape = tensor::batch_shape(&shape0).to_vec();
    shape.push(seq);
    shape.push(cols);
    let inputs = inputs.to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::StackSeq { inputs, out: out_id, rows, cols })
}

/// Select one position of the second-to-last axis: (batch..., T, C) → (batch..., C).
pub fn traced_select_seq(tape: &mut Tape, input: BufId, index: usize) -> BufId {
    let shape = tape.buf_shape(input).to_vec();
    assert!(shape.len() >= 2, "traced_select_seq: need (batch..., T, C), got {shape:?}");
    let (seq_len, cols) = (shape[shape.len() - 2], shape[shape.len() - 1]);
    assert!(index < seq_len, "traced_select_seq: index {index} out of range {seq_len}");
    let batch = &shape[..shape.len() - 2];
    let rows = tensor::numel(batch);
    let data = tape.buf_data(input);
    let mut out = vec![0.0f64; rows * cols];
    for r in 0..rows {
        let src = (r * seq_len + index) * cols;
        out[r * cols..(r + 1) * cols].copy_from_slice(&data[src..src + cols]);
    }
    let mut out_shape = batch.to_vec();
    out_shape.push(cols);
    tape.record_with_output(out, out_shape, |out_id| {
        TapeOp::SelectSeq { input, out: out_id, index, rows, seq_len, cols }
    })
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::SimpleRng;

    /// Central finite-difference check of d(scalar)/d(inputs) for a traced graph.
    fn fd_check(inputs: &[(Vec<f64>, Vec<usize>)], build: impl Fn(&mut Tape, &[BufId]) -> BufId,
                tol: f64, msg: &str) {
        let mut tape = Tape::new();
        let ids: Vec<BufId> = inputs.iter()
            .map(|(d, s)| tape.register_param(d, s.clone())).collect();
        let loss = build(&mut tape, &ids);
        tape.backward(loss).unwrap();

        let eps = 1e-6;
        for (m, (data, shape)) in inputs.iter().enumerate() {
            let analytic = tape.get_param_grad(ids[m]);
            for j in 0..data.len() {
                let eval = |delta: f64| {
                    let mut t = Tape::new();
                    let ids: Vec<BufId> = inputs.iter().enumerate().map(|(q, (d, s))| {
                        let mut d = d.clone();
                        if q == m {
                            d[j] += delta;
                        }
                        t.register_param(&d, s.clone())
                    }).collect();
                    let l = build(&mut t, &ids);
                    t.scalar(l)
                };
                let fd = (eval(eps) - eval(-eps)) / (2.0 * eps);
                assert!((analytic[j] - fd).abs() < tol,
                        "{msg}: input {m} ({shape:?}) elem {j}: analytic={} fd={fd}", analytic[j]);
            }
        }
    }

    #[test]
    fn test_batch_matvec_fd() {
        let mut rng = SimpleRng::new(7);
        let a = rng.vec_uniform(2 * 3 * 4, 1.0);
        let x = rng.vec_uniform(2 * 4, 1.0);
        fd_check(&[(a, vec![2, 3, 4]), (x, vec![2, 4])], |t, ids| {
            let y = traced_batch_matvec(t, ids[0], ids[1]);
            let y = traced_tanh(t, y);
            traced_sum(t, y)
        }, 1e-6, "batch_matvec");
    }

    #[test]
    fn test_linear_fd() {
        let mut rng = SimpleRng::new(11);
        let x = rng.vec_uniform(3 * 2, 1.0);
        let w = rng.vec_uniform(2 * 5, 1.0);
        let b = rng.vec_uniform(5, 1.0);
        fd_check(&[(x, vec![3, 2]), (w, vec![2, 5]), (b, vec![5])], |t, ids| {
            let y = traced_linear(t, ids[0], ids[1], ids[2]);
            let y = traced_sigmoid(t, y);
            traced_sum(t, y)
        }, 1e-6, "linear");
    }

    #[test]
    fn test_concat_and_stack_fd() {
        let mut rng = SimpleRng::new(3);
        let a = rng.vec_uniform(2 * 2, 1.0);
        let b = rng.vec_uniform(2 * 3, 1.0);
        fd_check(&[(a, vec![2, 2]), (b, vec![2, 3])], |t, ids| {
            let c = traced_concat_last(t, &[ids[0], ids[1]]);
            let c2 = traced_mul(t, c, c);
            let s = traced_stack_seq(t, &[c, c2]);
            let picked = traced_select_seq(t, s, 1);
            let picked = traced_tanh(t, picked);
            traced_sum(t, picked)
        }, 1e-6, "concat+stack");
    }

    #[test]
    fn test_scale_by_and_reciprocal_fd() {
        fd_check(&[(vec![0.5, -1.5, 2.0], vec![3]), (vec![1.7], vec![1])], |t, ids| {
            let r = traced_reciprocal(t, ids[1]);
            let y = traced_scale_by(t, ids[0], r);
            let y = traced_mul(t, y, y);
            traced_sum(t, y)
        }, 1e-5, "scale_by+reciprocal");
    }

    #[test]
    fn test_broadcast_unsqueeze_fd() {
        // z: [2, 3] → [2, 3, 1] → broadcast [2, 3, 4] + v: [1, 1, 4]
        let mut rng = SimpleRng::new(5);
        let z = rng.vec_uniform(6, 1.0);
        let v = rng.vec_uniform(4, 1.0);
        fd_check(&[(z, vec![2, 3]), (v, vec![1, 1, 4])], |t, ids| {
            let zs = traced_sigmoid(t, ids[0]);
            let zu = traced_reshape(t, zs, vec![2, 3, 1]);
            let zb = traced_broadcast_to(t, zu, vec![2, 3, 4]);
            let vb = traced_broadcast_to(t, ids[1], vec![2, 3, 4]);
            let y = traced_add(t, zb, vb);
            let y = traced_mul(t, y, y);
            traced_sum(t, y)
        }, 1e-6, "broadcast");
    }

    #[test]
    fn test_stack_seq_layout() {
        let mut tape = Tape::new();
        let a = tape.alloc(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = tape.alloc(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]);
        let s = traced_stack_seq(&mut tape, &[a, b]);
        assert_eq!(tape.buf_shape(s), &[2, 2, 2]);
        // batch row 0: [a0, b0], batch row 1: [a1, b1]
        assert_eq!(tape.buf_data(s), &[1.0, 2.0, 5.0, 6.0, 3.0, 4.0, 7.0, 8.0]);
        let first = traced_select_seq(&mut tape, s, 0);
        assert_eq!(tape.buf_data(first), tape.buf_data(a));
    }
}
