//! Global-index computation and scatter benchmarks: the hot path exercised
//! on every `Group::setup` and every nonlinear/linear solve.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use mdao_core::transfer::{compute_global_idxs, ConnectionEndpoints, DataTransfer, ScatterMode, SizesTable};
use mdao_core::variable::UnitConv;

fn single_rank(size: usize) -> SizesTable {
    SizesTable::new(vec![vec![size]])
}

fn bench_compute_global_idxs(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_global_idxs");
    for &size in &[8usize, 512, 8192] {
        let u = single_rank(size);
        let p = single_rank(size);
        let ep = ConnectionEndpoints {
            src_var_idx: 0,
            tgt_var_idx: 0,
            src_total_size: size,
            tgt_src_indices: None,
            src_is_distributed: false,
            owning_rank_of_src: 0,
            owning_rank_of_tgt: 0,
            src_remote_on_this_rank: false,
            tgt_remote_on_this_rank: false,
        };
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| compute_global_idxs(&u, &p, &ep, ScatterMode::Forward, 0));
        });
    }
    group.finish();
}

fn bench_compute_global_idxs_with_src_indices(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_global_idxs_src_indices");
    for &size in &[8usize, 512, 8192] {
        let u = single_rank(size);
        let p = single_rank(size / 2);
        let sel: Vec<usize> = (0..size).step_by(2).collect();
        let ep = ConnectionEndpoints {
            src_var_idx: 0,
            tgt_var_idx: 0,
            src_total_size: size,
            tgt_src_indices: Some(&sel),
            src_is_distributed: false,
            owning_rank_of_src: 0,
            owning_rank_of_tgt: 0,
            src_remote_on_this_rank: false,
            tgt_remote_on_this_rank: false,
        };
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| compute_global_idxs(&u, &p, &ep, ScatterMode::Forward, 0));
        });
    }
    group.finish();
}

fn bench_transfer_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer_forward");
    for &size in &[8usize, 512, 8192] {
        let mut xfer = DataTransfer::new(ScatterMode::Forward);
        let idx: Vec<usize> = (0..size).collect();
        xfer.push(idx.clone(), idx, UnitConv::identity());
        let mut src = vec![1.0; size];
        let mut tgt = vec![0.0; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| xfer.transfer(&mut src, &mut tgt, false));
        });
    }
    group.finish();
}

fn bench_transfer_reverse(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer_reverse");
    for &size in &[8usize, 512, 8192] {
        let mut xfer = DataTransfer::new(ScatterMode::Reverse);
        let idx: Vec<usize> = (0..size).collect();
        xfer.push(idx.clone(), idx, UnitConv::identity());
        let mut src = vec![0.0; size];
        let mut tgt = vec![1.0; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| xfer.transfer(&mut src, &mut tgt, true));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_compute_global_idxs,
    bench_compute_global_idxs_with_src_indices,
    bench_transfer_forward,
    bench_transfer_reverse,
);
criterion_main!(benches);
