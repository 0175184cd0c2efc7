// Wengert tape: reverse-mode AD via operation recording.
//
// Records operations during the forward pass into a linear tape,
// then replays them in reverse to compute gradients via the chain rule.
// Custom VJP blocks (the adjoint CDE solve) compose with the standard ops
// through `TapeOp::Opaque`; their backward may re-enter the tape to record
// and differentiate local sub-computations.
//
// Barrier ops sever a value from its producer: ordinary backward stops there.
// `reattach` / `reattach_all` reconstruct the severed flow exactly once.
//
// Parameters are snapshotted at registration, immune to later mutation.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use crate::error::{CdeError, CdeResult};
use crate::tensor;

// ── Buffer management ────────────────────────────────────────────────

/// Arena index for tensor buffers. Immutable after creation.
pub type BufId = usize;

/// A flat tensor buffer in the tape arena.
#[derive(Clone, Debug)]
pub struct TapeBuf {
    /// Flat storage (row-major).
    pub data: Vec<f64>,
    /// Shape metadata, e.g., [batch, hidden].
    pub shape: Vec<usize>,
    /// True when the value depends on a leaf that asked for gradients.
    pub requires_grad: bool,
}

impl TapeBuf {
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape, requires_grad: false }
    }

    pub fn param(data: Vec<f64>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape, requires_grad: true }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// Position on the tape; `rewind` drops everything recorded after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapeMark {
    ops: usize,
    bufs: usize,
}

// ── Opaque VJP and hook traits ───────────────────────────────────────

/// A block whose forward ran outside the tape and whose backward is custom.
///
/// `backward` receives the upstream gradient for every output (zeros where none
/// flowed) and fills `d_inputs` (caller-allocated, zero-initialised). The tape is
/// passed mutably so the block can record local ops after a `mark`, take a `vjp`
/// over them, and `rewind`.
pub trait OpaqueVjp: fmt::Debug {
    fn name(&self) -> &str;

    fn backward(
        &self,
        tape: &mut Tape,
        d_outputs: &[&[f64]],
        d_inputs: &mut [Vec<f64>],
    ) -> CdeResult<()>;
}

/// Called with the gradient flowing through a `TapeOp::Hook` during backward.
/// Returning an error aborts the sweep.
pub trait BackwardHook: fmt::Debug {
    fn on_backward(&self, grad: &[f64]) -> CdeResult<()>;
}

/// Chain-boundary marker: counts backward visits and rejects a second one.
#[derive(Debug)]
pub struct BoundaryMarker {
    name: String,
    visits: Cell<usize>,
}

impl BoundaryMarker {
    pub fn new(name: impl Into<String>) -> Rc<Self> {
        Rc::new(BoundaryMarker { name: name.into(), visits: Cell::new(0) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visits(&self) -> usize {
        self.visits.get()
    }
}

impl BackwardHook for BoundaryMarker {
    fn on_backward(&self, _grad: &[f64]) -> CdeResult<()> {
        let n = self.visits.get() + 1;
        self.visits.set(n);
        if n > 1 {
            return Err(CdeError::graph(format!(
                "boundary '{}' re-entered during backward (visit {})", self.name, n
            )));
        }
        Ok(())
    }
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation on the tape.
#[derive(Debug, Clone)]
pub enum TapeOp {
    // ── Linear algebra ──────────────────────────────────────────
    /// out = A @ B where A: [m, k], B: [k, n], out: [m, n]
    Matmul { a: BufId, b: BufId, out: BufId, m: usize, k: usize, n: usize },
    /// out[r] = A[r] @ x[r] where A: [rows, h, i], x: [rows, i], out: [rows, h]
    BatchMatVec { a: BufId, x: BufId, out: BufId, rows: usize, h: usize, i: usize },

    // ── Element-wise ────────────────────────────────────────────
    /// out = A + B
    Add { a: BufId, b: BufId, out: BufId },
    /// out = A - B
    Sub { a: BufId, b: BufId, out: BufId },
    /// out = A * B  (element-wise)
    Mul { a: BufId, b: BufId, out: BufId },
    /// out = scalar * A
    Scale { input: BufId, scalar: f64, out: BufId },
    /// out = s * A where s is a one-element buffer on the tape
    ScaleBy { input: BufId, scalar: BufId, out: BufId },
    /// out = 1 / A
    Reciprocal { input: BufId, out: BufId },

    // ── Activations ─────────────────────────────────────────────
    /// out = sigmoid(x); saves output for backward
    Sigmoid { input: BufId, out: BufId },
    /// out = tanh(x); saves output for backward
    Tanh { input: BufId, out: BufId },

    // ── Reductions / reshape ────────────────────────────────────
    /// out = sum(x)  (one element)
    Sum { input: BufId, out: BufId },
    /// out = broadcast(x) to out's shape; sum-reduce backward
    BroadcastTo { input: BufId, out: BufId },
    /// out = x with a new shape, same data
    Reshape { input: BufId, out: BufId },

    // ── Concat / slice ──────────────────────────────────────────
    /// out = concat(inputs) along the last axis; each input is [rows, sizes[m]]
    Concat { inputs: Vec<BufId>, out: BufId, rows: usize, sizes: Vec<usize> },
    /// out = input[offset..offset+len]  (flat)
    Slice { input: BufId, out: BufId, offset: usize, len: usize, input_len: usize },

    // ── Sequence axis ───────────────────────────────────────────
    /// out[r, k, c] = inputs[k][r, c]; out: [rows, len(inputs), cols]
    StackSeq { inputs: Vec<BufId>, out: BufId, rows: usize, cols: usize },
    /// out[r, c] = input[r, index, c]; input: [rows, seq_len, cols]
    SelectSeq { input: BufId, out: BufId, index: usize, rows: usize, seq_len: usize, cols: usize },

    // ── Graph structure ─────────────────────────────────────────
    /// Ownership barrier: out holds a copy of source with no gradient edge back.
    Barrier { source: BufId, out: BufId },
    /// Identity that reports the gradient passing through it.
    Hook { input: BufId, out: BufId, hook: Rc<dyn BackwardHook> },
    /// Custom VJP block (adjoint solve).
    Opaque { block: Rc<dyn OpaqueVjp>, inputs: Vec<BufId>, outputs: Vec<BufId> },
}

impl TapeOp {
    /// Buffers this op reads and propagates gradient into.
    /// A barrier reports no inputs: its source is not a gradient edge.
    pub fn inputs(&self) -> Vec<BufId> {
        match self {
            TapeOp::Matmul { a, b, .. }
            | TapeOp::Add { a, b, .. }
            | TapeOp::Sub { a, b, .. }
            | TapeOp::Mul { a, b, .. } => vec![*a, *b],
            TapeOp::BatchMatVec { a, x, .. } => vec![*a, *x],
            TapeOp::ScaleBy { input, scalar, .. } => vec![*input, *scalar],
            TapeOp::Scale { input, .. }
            | TapeOp::Reciprocal { input, .. }
            | TapeOp::Sigmoid { input, .. }
            | TapeOp::Tanh { input, .. }
            | TapeOp::Sum { input, .. }
            | TapeOp::BroadcastTo { input, .. }
            | TapeOp::Reshape { input, .. }
            | TapeOp::Slice { input, .. }
            | TapeOp::SelectSeq { input, .. }
            | TapeOp::Hook { input, .. } => vec![*input],
            TapeOp::Concat { inputs, .. }
            | TapeOp::StackSeq { inputs, .. }
            | TapeOp::Opaque { inputs, .. } => inputs.clone(),
            TapeOp::Barrier { .. } => Vec::new(),
        }
    }

    pub fn outputs(&self) -> Vec<BufId> {
        match self {
            TapeOp::Opaque { outputs, .. } => outputs.clone(),
            TapeOp::Matmul { out, .. }
            | TapeOp::BatchMatVec { out, .. }
            | TapeOp::Add { out, .. }
            | TapeOp::Sub { out, .. }
            | TapeOp::Mul { out, .. }
            | TapeOp::Scale { out, .. }
            | TapeOp::ScaleBy { out, .. }
            | TapeOp::Reciprocal { out, .. }
            | TapeOp::Sigmoid { out, .. }
            | TapeOp::Tanh { out, .. }
            | TapeOp::Sum { out, .. }
            | TapeOp::BroadcastTo { out, .. }
            | TapeOp::Reshape { out, .. }
            | TapeOp::Concat { out, .. }
            | TapeOp::Slice { out, .. }
            | TapeOp::StackSeq { out, .. }
            | TapeOp::SelectSeq { out, .. }
            | TapeOp::Barrier { out, .. }
            | TapeOp::Hook { out, .. } => vec![*out],
        }
    }
}

// ── Gradient storage ─────────────────────────────────────────────────

/// Sparse gradient accumulators keyed by BufId.
#[derive(Debug, Clone, Default)]
struct GradStore {
    grads: HashMap<BufId, Vec<f64>>,
}

impl GradStore {
    fn get(&self, id: BufId) -> Option<&[f64]> {
        self.grads.get(&id).map(|g| g.as_slice())
    }

    fn accumulate(&mut self, id: BufId, grad: &[f64]) {
        match self.grads.get_mut(&id) {
            Some(existing) => {
                assert_eq!(existing.len(), grad.len(),
                           "accumulate_grad size mismatch: grad={} buf={}", grad.len(), existing.len());
                for (e, g) in existing.iter_mut().zip(grad.iter()) {
                    *e += g;
                }
            }
            None => {
                self.grads.insert(id, grad.to_vec());
            }
        }
    }

    fn merge(&mut self, other: GradStore) {
        for (id, g) in other.grads {
            self.accumulate(id, &g);
        }
    }
}

// ── The Tape ─────────────────────────────────────────────────────────

/// Wengert tape for reverse-mode AD.
///
/// Records operations during forward pass, replays in reverse for gradients.
#[derive(Debug, Default)]
pub struct Tape {
    /// Operations in forward order. Replayed in reverse during backward.
    ops: Vec<TapeOp>,
    /// Arena of tensor buffers. Indexed by BufId.
    bufs: Vec<TapeBuf>,
    /// Gradient accumulators. Empty until backward seeds them.
    grads: GradStore,
    /// Barriers whose gradient has already been pushed into their source.
    reattached: HashSet<BufId>,
}

impl Tape {
    pub fn new() -> Self {
        Tape::default()
    }

    // ── Buffer management ────────────────────────────────────────

    /// Allocate a new buffer in the arena. Returns its BufId.
    pub fn alloc(&mut self, data: Vec<f64>, shape: Vec<usize>) -> BufId {
        debug_assert_eq!(data.len(), tensor::numel(&shape),
                         "alloc: {} elements for shape {:?}", data.len(), shape);
        let id = self.bufs.len();
        self.bufs.push(TapeBuf::new(data, shape));
        id
    }

    /// Register a parameter. CLONES the data; the tape holds its own copy.
    pub fn register_param(&mut self, data: &[f64], shape: Vec<usize>) -> BufId {
        let id = self.bufs.len();
        self.bufs.push(TapeBuf::param(data.to_vec(), shape));
        id
    }

    /// Register a leaf with an explicit gradient requirement.
    pub fn leaf(&mut self, data: &[f64], shape: Vec<usize>, requires_grad: bool) -> BufId {
        let id = self.alloc(data.to_vec(), shape);
        self.bufs[id].requires_grad = requires_grad;
        id
    }

    /// One-element constant that does not require gradients.
    pub fn constant(&mut self, value: f64) -> BufId {
        self.alloc(vec![value], vec![1])
    }

    /// Get the data for a buffer.
    pub fn buf_data(&self, id: BufId) -> &[f64] {
        &self.bufs[id].data
    }

    /// Get the shape for a buffer.
    pub fn buf_shape(&self, id: BufId) -> &[usize] {
        &self.bufs[id].shape
    }

    /// Get the number of elements in a buffer.
    pub fn buf_numel(&self, id: BufId) -> usize {
        self.bufs[id].numel()
    }

    /// First element of a buffer; used for scalar times.
    pub fn scalar(&self, id: BufId) -> f64 {
        self.bufs[id].data[0]
    }

    pub fn requires_grad(&self, id: BufId) -> bool {
        self.bufs[id].requires_grad
    }

    /// Number of buffers in the arena.
    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    /// Number of ops recorded.
    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    // ── Recording ────────────────────────────────────────────────

    /// Record an operation whose outputs are already allocated.
    /// Output buffers inherit `requires_grad` from the op's inputs.
    pub fn record(&mut self, op: TapeOp) {
        let requires_grad = match &op {
            TapeOp::Barrier { source, .. } => self.bufs[*source].requires_grad,
            _ => op.inputs().iter().any(|&i| self.bufs[i].requires_grad),
        };
        for out in op.outputs() {
            self.bufs[out].requires_grad = requires_grad;
        }
        self.ops.push(op);
    }

    /// Record an operation and allocate its output buffer in one step.
    /// Returns the output BufId.
    pub fn record_with_output(&mut self, data: Vec<f64>, shape: Vec<usize>,
                              op_fn: impl FnOnce(BufId) -> TapeOp) -> BufId {
        let out_id = self.alloc(data, shape);
        let op = op_fn(out_id);
        self.record(op);
        out_id
    }

    /// Record an opaque block. Inputs and outputs must already be allocated.
    pub fn record_opaque(&mut self, block: Rc<dyn OpaqueVjp>, inputs: Vec<BufId>,
                         outputs: Vec<BufId>) {
        self.record(TapeOp::Opaque { block, inputs, outputs });
    }

    /// Install an ownership barrier over `source`: same data, fresh storage,
    /// no gradient edge back to `source`.
    pub fn barrier(&mut self, source: BufId) -> BufId {
        let data = self.bufs[source].data.clone();
        let shape = self.bufs[source].shape.clone();
        self.record_with_output(data, shape, |out| TapeOp::Barrier { source, out })
    }

    /// Lookup-only link from a barrier to the value it was installed over.
    pub fn barrier_source(&self, barrier: BufId) -> Option<BufId> {
        self.ops.iter().find_map(|op| match op {
            TapeOp::Barrier { source, out } if *out == barrier => Some(*source),
            _ => None,
        })
    }

    /// Identity op that calls `hook` with the gradient flowing through it.
    pub fn hook(&mut self, input: BufId, hook: Rc<dyn BackwardHook>) -> BufId {
        let data = self.bufs[input].data.clone();
        let shape = self.bufs[input].shape.clone();
        self.record_with_output(data, shape, |out| TapeOp::Hook { input, out, hook })
    }

    /// Current end of the tape.
    pub fn mark(&self) -> TapeMark {
        TapeMark { ops: self.ops.len(), bufs: self.bufs.len() }
    }

    /// Drop every op and buffer recorded after `mark`.
    pub fn rewind(&mut self, mark: TapeMark) {
        self.ops.truncate(mark.ops);
        self.bufs.truncate(mark.bufs);
        self.grads.grads.retain(|&id, _| id < mark.bufs);
        self.reattached.retain(|&id| id < mark.bufs);
    }

    // ── Gradient seeding and access ──────────────────────────────

    /// Seed the gradient for a buffer (typically the scalar loss).
    pub fn seed_grad(&mut self, id: BufId, grad: Vec<f64>) {
        assert_eq!(grad.len(), self.bufs[id].numel(),
                   "Gradient size mismatch: grad={} buf={}", grad.len(), self.bufs[id].numel());
        self.grads.grads.insert(id, grad);
    }

    /// Get the accumulated gradient for a buffer. Returns None if no gradient flowed to it.
    pub fn get_grad(&self, id: BufId) -> Option<&[f64]> {
        self.grads.get(id)
    }

    /// Get gradient for a parameter buffer, returning zeros if no gradient flowed.
    pub fn get_param_grad(&self, id: BufId) -> Vec<f64> {
        match self.grads.get(id) {
            Some(g) => g.to_vec(),
            None => vec![0.0; self.bufs[id].numel()],
        }
    }

    /// Clear all accumulated gradients and reattachment bookkeeping.
    pub fn zero_grad(&mut self) {
        self.grads = GradStore::default();
        self.reattached.clear();
    }

    // ── Backward pass ────────────────────────────────────────────

    /// Run the backward pass: replay ops in reverse, computing VJPs.
    /// A one-element loss is seeded with 1.0 unless `seed_grad` was called.
    /// Barriers are not crossed; see `reattach_all`.
    pub fn backward(&mut self, loss_id: BufId) -> CdeResult<()> {
        if self.grads.get(loss_id).is_none() {
            if self.bufs[loss_id].numel() != 1 {
                return Err(CdeError::graph(format!(
                    "auto-seeding only works for a one-element loss (got {} elements)",
                    self.bufs[loss_id].numel()
                )));
            }
            self.grads.grads.insert(loss_id, vec![1.0]);
        }

        let ops = std::mem::take(&mut self.ops);
        let mut store = std::mem::take(&mut self.grads);
        let result = self.sweep(&ops, &mut store, None);
        self.ops = ops;
        self.grads = store;
        result
    }

    /// `backward` followed by `reattach_all`.
    pub fn backward_through_barriers(&mut self, loss_id: BufId) -> CdeResult<()> {
        self.backward(loss_id)?;
        self.reattach_all()?;
        Ok(())
    }

    /// Push the gradient accumulated on `barrier` into its source and continue
    /// the reverse sweep through the producing graph. Allowed once per barrier.
    pub fn reattach(&mut self, barrier: BufId) -> CdeResult<()> {
        if self.barrier_source(barrier).is_none() {
            return Err(CdeError::graph(format!("buffer {barrier} is not a barrier")));
        }
        if self.reattached.contains(&barrier) {
            return Err(CdeError::graph(format!("barrier {barrier} was already reattached")));
        }
        let selected: HashSet<BufId> = std::iter::once(barrier).collect();
        self.reattach_sweep(&selected)
    }

    /// Reattach every pending barrier in one reverse sweep, latest first, so
    /// each upstream op runs once. Returns how many barriers were reattached.
    pub fn reattach_all(&mut self) -> CdeResult<usize> {
        let selected: HashSet<BufId> = self.ops.iter().filter_map(|op| match op {
            TapeOp::Barrier { out, .. } if !self.reattached.contains(out) => Some(*out),
            _ => None,
        }).collect();
        if selected.is_empty() {
            return Ok(0);
        }
        let n = selected.len();
        self.reattach_sweep(&selected)?;
        Ok(n)
    }

    fn reattach_sweep(&mut self, selected: &HashSet<BufId>) -> CdeResult<()> {
        let ops = std::mem::take(&mut self.ops);
        let main = std::mem::take(&mut self.grads);
        let mut delta = GradStore::default();
        let result = self.sweep(&ops, &mut delta, Some((&main, selected)));
        self.ops = ops;
        self.grads = main;
        self.grads.merge(delta);
        result
    }

    /// Vector-Jacobian product over the ops recorded after `mark`.
    ///
    /// Seeds `outputs` with `cotangents`, sweeps the local ops in reverse with a
    /// private accumulator, and returns the gradient at each `wrt` buffer (zeros
    /// where nothing flowed). The tape's own gradients are untouched.
    pub fn vjp(&mut self, mark: TapeMark, outputs: &[BufId], cotangents: &[Vec<f64>],
               wrt: &[BufId]) -> CdeResult<Vec<Vec<f64>>> {
        let local = self.ops.split_off(mark.ops);
        let mut store = GradStore::default();
        for (&o, c) in outputs.iter().zip(cotangents.iter()) {
            store.accumulate(o, c);
        }
        let result = self.sweep(&local, &mut store, None);
        self.ops.extend(local);
        result?;
        Ok(wrt.iter().map(|&id| match store.grads.remove(&id) {
            Some(g) => g,
            None => vec![0.0; self.bufs[id].numel()],
        }).collect())
    }

    /// Whether `out` structurally depends on `input`. Barriers are severed.
    pub fn depends_on(&self, out: BufId, input: BufId) -> bool {
        if out == input {
            return true;
        }
        let mut reachable: HashSet<BufId> = std::iter::once(out).collect();
        for op in self.ops.iter().rev() {
            if op.outputs().iter().any(|o| reachable.contains(o)) {
                reachable.extend(op.inputs());
            }
        }
        reachable.contains(&input)
    }

    /// Reverse sweep over `ops`. With `reattach = Some((main, selected))`, the
    /// selected barriers forward their total gradient into their source.
    fn sweep(&mut self, ops: &[TapeOp], store: &mut GradStore,
             reattach: Option<(&GradStore, &HashSet<BufId>)>) -> CdeResult<()> {
        for op in ops.iter().rev() {
            match op {
                TapeOp::Barrier { source, out } => {
                    let Some((main, selected)) = reattach else { continue };
                    if !selected.contains(out) {
                        continue;
                    }
                    let n = self.bufs[*out].numel();
                    let mut total = vec![0.0f64; n];
                    let mut any = false;
                    for g in [main.get(*out), store.get(*out)].into_iter().flatten() {
                        tensor::axpy_f64(&mut total, 1.0, g);
                        any = true;
                    }
                    if any {
                        store.accumulate(*source, &total);
                    }
                    self.reattached.insert(*out);
                }
                _ => self.backward_op(op, store)?,
            }
        }
        Ok(())
    }

    /// Compute VJP for a single operation.
    fn backward_op(&mut self, op: &TapeOp, store: &mut GradStore) -> CdeResult<()> {
        match op {
            // ── Matmul: out = A @ B ──────────────────────────────
            TapeOp::Matmul { a, b, out, m, k, n } => {
                let (m, k, n) = (*m, *k, *n);
                if let Some(d_out) = store.get(*out).map(|g| g.to_vec()) {
                    // d_A = d_out @ B^T
                    let mut d_a = vec![0.0f64; m * k];
                    let mut b_t = vec![0.0f64; n * k];
                    tensor::transpose_f64(&self.bufs[*b].data, &mut b_t, k, n);
                    tensor::matmul_f64(&d_out, &b_t, &mut d_a, m, n, k);
                    store.accumulate(*a, &d_a);

                    // d_B = A^T @ d_out
                    let mut d_b = vec![0.0f64; k * n];
                    let mut a_t = vec![0.0f64; k * m];
                    tensor::transpose_f64(&self.bufs[*a].data, &mut a_t, m, k);
                    tensor::matmul_f64(&a_t, &d_out, &mut d_b, k, m, n);
                    store.accumulate(*b, &d_b);
                }
            }

            // ── BatchMatVec: out[r] = A[r] @ x[r] ────────────────
            TapeOp::BatchMatVec { a, x, out, rows, h, i } => {
                let (rows, h, i) = (*rows, *h, *i);
                if let Some(d_out) = store.get(*out).map(|g| g.to_vec()) {
                    let a_data = &self.bufs[*a].data;
                    let x_data = &self.bufs[*x].data;
                    // d_A[r,j,p] = d_out[r,j] * x[r,p];  d_x[r,p] = sum_j d_out[r,j] * A[r,j,p]
                    let mut d_a = vec![0.0f64; rows * h * i];
                    let mut d_x = vec![0.0f64; rows * i];
                    for r in 0..rows {
                        for j in 0..h {
                            let g = d_out[r * h + j];
                            let base = (r * h + j) * i;
                            for p in 0..i {
                                d_a[base + p] = g * x_data[r * i + p];
                                d_x[r * i + p] += g * a_data[base + p];
                            }
                        }
                    }
                    store.accumulate(*a, &d_a);
                    store.accumulate(*x, &d_x);
                }
            }

            // ── Add: out = A + B ─────────────────────────────────
            TapeOp::Add { a, b, out } => {
                if let Some(d_out) = store.get(*out).map(|g| g.to_vec()) {
                    store.accumulate(*a, &d_out);
                    store.accumulate(*b, &d_out);
                }
            }

            // ── Sub: out = A - B ─────────────────────────────────
            TapeOp::Sub { a, b, out } => {
                if let Some(d_out) = store.get(*out).map(|g| g.to_vec()) {
                    store.accumulate(*a, &d_out);
                    let neg: Vec<f64> = d_out.iter().map(|x| -x).collect();
                    store.accumulate(*b, &neg);
                }
            }

            // ── Mul: out = A * B (element-wise) ──────────────────
            TapeOp::Mul { a, b, out } => {
                if let Some(d_out) = store.get(*out).map(|g| g.to_vec()) {
                    let d_a: Vec<f64> = d_out.iter().zip(self.bufs[*b].data.iter())
                        .map(|(d, b)| d * b).collect();
                    let d_b: Vec<f64> = d_out.iter().zip(self.bufs[*a].data.iter())
                        .map(|(d, a)| d * a).collect();
                    store.accumulate(*a, &d_a);
                    store.accumulate(*b, &d_b);
                }
            }

            // ── Scale: out = scalar * A ──────────────────────────
            TapeOp::Scale { input, scalar, out } => {
                if let Some(d_out) = store.get(*out) {
                    let d_input: Vec<f64> = d_out.iter().map(|d| *scalar * d).collect();
                    store.accumulate(*input, &d_input);
                }
            }

            // ── ScaleBy: out = s * A, s on the tape ──────────────
            TapeOp::ScaleBy { input, scalar, out } => {
                if let Some(d_out) = store.get(*out).map(|g| g.to_vec()) {
                    let s = self.bufs[*scalar].data[0];
                    let d_input: Vec<f64> = d_out.iter().map(|d| s * d).collect();
                    let d_s = tensor::dot_f64(&d_out, &self.bufs[*input].data);
                    store.accumulate(*input, &d_input);
                    store.accumulate(*scalar, &[d_s]);
                }
            }

            // ── Reciprocal: out = 1 / A ──────────────────────────
            TapeOp::Reciprocal { input, out } => {
                if let Some(d_out) = store.get(*out) {
                    // d_x = -d_out * out^2
                    let d_input: Vec<f64> = d_out.iter().zip(self.bufs[*out].data.iter())
                        .map(|(d, o)| -d * o * o).collect();
                    store.accumulate(*input, &d_input);
                }
            }

            // ── Sigmoid: out = σ(x) ──────────────────────────────
            TapeOp::Sigmoid { input, out } => {
                if let Some(d_out) = store.get(*out) {
                    // d_x = d_out * out * (1 - out)
                    let d_input: Vec<f64> = d_out.iter().zip(self.bufs[*out].data.iter())
                        .map(|(d, o)| d * o * (1.0 - o)).collect();
                    store.accumulate(*input, &d_input);
                }
            }

            // ── Tanh: out = tanh(x) ──────────────────────────────
            TapeOp::Tanh { input, out } => {
                if let Some(d_out) = store.get(*out) {
                    let d_input: Vec<f64> = d_out.iter().zip(self.bufs[*out].data.iter())
                        .map(|(d, o)| d * (1.0 - o * o)).collect();
                    store.accumulate(*input, &d_input);
                }
            }

            // ── Sum: out = Σ x ───────────────────────────────────
            TapeOp::Sum { input, out } => {
                if let Some(d_out) = store.get(*out) {
                    let d_input = vec![d_out[0]; self.bufs[*input].numel()];
                    store.accumulate(*input, &d_input);
                }
            }

            // ── BroadcastTo ─────────────────────────────────────
            TapeOp::BroadcastTo { input, out } => {
                if let Some(d_out) = store.get(*out).map(|g| g.to_vec()) {
                    let map = tensor::broadcast_index_map(&self.bufs[*input].shape,
                                                          &self.bufs[*out].shape)
                        .ok_or_else(|| CdeError::graph("broadcast shapes changed after recording"))?;
                    let mut d_input = vec![0.0f64; self.bufs[*input].numel()];
                    for (j, &src) in map.iter().enumerate() {
                        d_input[src] += d_out[j];
                    }
                    store.accumulate(*input, &d_input);
                }
            }

            // ── Reshape / Hook: identity on data ─────────────────
            TapeOp::Reshape { input, out } => {
                if let Some(d_out) = store.get(*out).map(|g| g.to_vec()) {
                    store.accumulate(*input, &d_out);
                }
            }

            TapeOp::Hook { input, out, hook } => {
                if let Some(d_out) = store.get(*out).map(|g| g.to_vec()) {
                    hook.on_backward(&d_out)?;
                    store.accumulate(*input, &d_out);
                }
            }

            // ── Concat (last axis) ──────────────────────────────
            TapeOp::Concat { inputs, out, rows, sizes } => {
                if let Some(d_out) = store.get(*out).map(|g| g.to_vec()) {
                    let total: usize = sizes.iter().sum();
                    let mut offset = 0;
                    for (inp, &sz) in inputs.iter().zip(sizes.iter()) {
                        let mut d_inp = vec![0.0f64; rows * sz];
                        for r in 0..*rows {
                            d_inp[r * sz..(r + 1) * sz].copy_from_slice(
                                &d_out[r * total + offset..r * total + offset + sz]);
                        }
                        store.accumulate(*inp, &d_inp);
                        offset += sz;
                    }
                }
            }

            // ── Slice ───────────────────────────────────────────
            TapeOp::Slice { input, out, offset, len, input_len } => {
                if let Some(d_out) = store.get(*out) {
                    let mut d_input = vec![0.0f64; *input_len];
                    d_input[*offset..*offset + *len].copy_from_slice(d_out);
                    store.accumulate(*input, &d_input);
                }
            }

            // ── StackSeq ────────────────────────────────────────
            TapeOp::StackSeq { inputs, out, rows, cols } => {
                if let Some(d_out) = store.get(*out).map(|g| g.to_vec()) {
                    let seq = inputs.len();
                    for (k, inp) in inputs.iter().enumerate() {
                        let mut d_inp = vec![0.0f64; rows * cols];
                        for r in 0..*rows {
                            let src = (r * seq + k) * cols;
                            d_inp[r * cols..(r + 1) * cols].copy_from_slice(&d_out[src..src + cols]);
                        }
                        store.accumulate(*inp, &d_inp);
                    }
                }
            }

            // ── SelectSeq ───────────────────────────────────────
            TapeOp::SelectSeq { input, out, index, rows, seq_len, cols } => {
                if let Some(d_out) = store.get(*out) {
                    let mut d_input = vec![0.0f64; rows * seq_len * cols];
                    for r in 0..*rows {
                        let dst = (r * seq_len + index) * cols;
                        d_input[dst..dst + cols].copy_from_slice(&d_out[r * cols..(r + 1) * cols]);
                    }
                    store.accumulate(*input, &d_input);
                }
            }

            // Severed; handled by `sweep`.
            TapeOp::Barrier { .. } => {}

            // ── Opaque: custom VJP block ─────────────────────────
            TapeOp::Opaque { block, inputs, outputs } => {
                if outputs.iter().all(|&o| store.get(o).is_none()) {
                    return Ok(());
                }
                let d_outputs: Vec<Vec<f64>> = outputs.iter().map(|&oid| {
                    store.get(oid).map(|g| g.to_vec())
                        .unwrap_or_else(|| vec![0.0; self.bufs[oid].numel()])
                }).collect();
                let d_out_refs: Vec<&[f64]> = d_outputs.iter().map(|v| v.as_slice()).collect();
                let mut d_inputs: Vec<Vec<f64>> = inputs.iter().map(|&iid| {
                    vec![0.0f64; self.bufs[iid].numel()]
                }).collect();

                block.backward(self, &d_out_refs, &mut d_inputs)?;

                for (iid, d_inp) in inputs.iter().zip(d_inputs.iter()) {
                    store.accumulate(*iid, d_inp);
                }
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
