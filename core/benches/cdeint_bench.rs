/// Criterion benchmarks for CDE solves.
///
/// Measures forward solve and forward + backward cost for direct and adjoint
/// gradients across path lengths L=16, L=64, L=256.
///
/// Run: cargo bench --bench cdeint_bench
/// Reports saved to: target/criterion/

#[path = "../tests/common/mod.rs"]
mod common;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use cdeint_core::cdeint::{cdeint, CdeOptions};
use cdeint_core::field::VectorField;
use cdeint_core::path::ControlPath;
use cdeint_core::solver::Method;
use cdeint_core::state::State;
use cdeint_core::tape::Tape;
use cdeint_core::tensor::SimpleRng;
use cdeint_core::traced::traced_sum;

use common::{linspace, rand, random_path, SigmoidField};

const CHANNELS: usize = 4;
const HIDDEN: usize = 8;

/// One solve over a length-`len` path, optionally followed by backward.
fn solve(len: usize, adjoint: bool, backward: bool) {
    let mut tape = Tape::new();
    let mut rng = SimpleRng::new(42);
    let (path, _, _) = random_path(&mut tape, &mut rng, &[4], len, CHANNELS, true);
    let func = SigmoidField::new(&mut tape, &mut rng, CHANNELS);
    let z0 = tape.leaf(&rand(&mut rng, 4 * HIDDEN), vec![4, HIDDEN], true);
    let t = tape.leaf(&linspace(0.0, (len - 1) as f64, 4), vec![4], false);

    let mut opts = CdeOptions::default().method(Method::Rk4).step_size(0.5)
        .adjoint_params([func.parameters(), path.buffers()].concat());
    opts.adjoint = adjoint;
    let sol = cdeint(&mut tape, &path, &func, &State::Single(z0), t, &opts).unwrap();
    if backward {
        let loss = traced_sum(&mut tape, sol.trajectory.components()[0]);
        tape.backward_through_barriers(loss).unwrap();
    }
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    for len in [16, 64, 256] {
        for (name, adjoint) in [("direct", false), ("adjoint", true)] {
            group.bench_with_input(BenchmarkId::new(name, format!("L={len}")), &len, |b, &len| {
                b.iter(|| solve(len, adjoint, false));
            });
        }
    }
    group.finish();
}

/// Forward + backward: the adjoint re-solves backward in time but keeps no tape.
fn bench_gradient(c: &mut Criterion) {
    let mut group = c.benchmark_group("gradient");
    group.sample_size(20);
    for len in [16, 64, 256] {
        for (name, adjoint) in [("direct", false), ("adjoint", true)] {
            group.bench_with_input(BenchmarkId::new(name, format!("L={len}")), &len, |b, &len| {
                b.iter(|| solve(len, adjoint, true));
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_forward, bench_gradient);
criterion_main!(benches);
