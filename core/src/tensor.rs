/// Minimal tensor utilities for the CDE tape.
///
/// All operations are free functions on flat f64 slices with explicit dimensions.
/// Row-major layout throughout. Batch dimensions are flattened into a single
/// `rows` count by the callers; only the trailing channel axes are structured.

// ── Shape helpers ────────────────────────────────────────────────────

/// Number of elements for a shape. The empty shape is a scalar (1 element).
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Everything but the last axis.
pub fn batch_shape(shape: &[usize]) -> &[usize] {
    &shape[..shape.len().saturating_sub(1)]
}

/// Size of the last axis, or 1 for a scalar.
pub fn channels(shape: &[usize]) -> usize {
    shape.last().copied().unwrap_or(1)
}

/// Format a shape the way error messages present it: `(2, 3)`, `(4,)`, `()`.
pub fn fmt_shape(shape: &[usize]) -> String {
    match shape.len() {
        0 => "()".to_string(),
        1 => format!("({},)", shape[0]),
        _ => {
            let parts: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
            format!("({})", parts.join(", "))
        }
    }
}

/// For each flat index of `out_shape`, the flat index in `in_shape` it reads from
/// under numpy broadcasting. Returns None if the shapes are not broadcast-compatible.
pub fn broadcast_index_map(in_shape: &[usize], out_shape: &[usize]) -> Option<Vec<usize>> {
    if in_shape.len() > out_shape.len() {
        return None;
    }
    let pad = out_shape.len() - in_shape.len();
    let mut padded = vec![1usize; pad];
    padded.extend_from_slice(in_shape);
    for (&i, &o) in padded.iter().zip(out_shape.iter()) {
        if i != o && i != 1 {
            return None;
        }
    }

    // Row-major strides of the input; broadcast axes read with stride 0.
    let rank = out_shape.len();
    let mut in_strides = vec![0usize; rank];
    let mut stride = 1;
    for ax in (0..rank).rev() {
        in_strides[ax] = if padded[ax] == 1 { 0 } else { stride };
        stride *= padded[ax];
    }

    let total = numel(out_shape);
    let mut map = Vec::with_capacity(total);
    let mut idx = vec![0usize; rank];
    for _ in 0..total {
        map.push(idx.iter().zip(in_strides.iter()).map(|(i, s)| i * s).sum());
        for ax in (0..rank).rev() {
            idx[ax] += 1;
            if idx[ax] < out_shape[ax] {
                break;
            }
            idx[ax] = 0;
        }
    }
    Some(map)
}

// ── Free-function math ops on flat slices ────────────────────────────

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f64(a: &[f64], b: &[f64], out: &mut [f64], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f64;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Transpose: out[K,M] = A[M,K]^T.
pub fn transpose_f64(a: &[f64], out: &mut [f64], m: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(out.len(), m * k);
    for i in 0..m {
        for j in 0..k {
            out[j * m + i] = a[i * k + j];
        }
    }
}

/// Batched matrix-vector product over flattened batch rows:
/// out[r, j] = sum_p A[r, j, p] * x[r, p], A: [rows, h, i], x: [rows, i].
pub fn batch_matvec_f64(a: &[f64], x: &[f64], out: &mut [f64], rows: usize, h: usize, i: usize) {
    debug_assert_eq!(a.len(), rows * h * i);
    debug_assert_eq!(x.len(), rows * i);
    debug_assert_eq!(out.len(), rows * h);
    for r in 0..rows {
        let xr = &x[r * i..(r + 1) * i];
        for j in 0..h {
            let row = &a[(r * h + j) * i..(r * h + j + 1) * i];
            out[r * h + j] = row.iter().zip(xr.iter()).map(|(a, b)| a * b).sum();
        }
    }
}

/// Concatenate row-blocked inputs along the last axis.
/// Each input is [rows, sizes[m]]; output is [rows, sum(sizes)].
pub fn concat_last_f64(inputs: &[&[f64]], sizes: &[usize], rows: usize) -> Vec<f64> {
    let total: usize = sizes.iter().sum();
    let mut out = vec![0.0f64; rows * total];
    for r in 0..rows {
        let mut offset = 0;
        for (inp, &sz) in inputs.iter().zip(sizes.iter()) {
            out[r * total + offset..r * total + offset + sz]
                .copy_from_slice(&inp[r * sz..(r + 1) * sz]);
            offset += sz;
        }
    }
    out
}

/// Sigmoid: 1 / (1 + exp(-x)).
pub fn sigmoid_f64(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Dot product of two equal-length slices.
pub fn dot_f64(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// out += scale * x
pub fn axpy_f64(out: &mut [f64], scale: f64, x: &[f64]) {
    debug_assert_eq!(out.len(), x.len());
    for (o, v) in out.iter_mut().zip(x.iter()) {
        *o += scale * v;
    }
}

/// Simple xorshift64 PRNG for deterministic test data. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f64) -> f64 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f64], scale: f64) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }

    /// Fresh vector of `n` uniform values in [-scale, scale].
    pub fn vec_uniform(&mut self, n: usize, scale: f64) -> Vec<f64> {
        let mut v = vec![0.0; n];
        self.fill_uniform(&mut v, scale);
        v
    }
}
