use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use scopegraph::descriptor::{derive, provide};
use scopegraph::scope::Scope;

// ===== Micro Benchmarks =====

fn bench_resolve_cached(c: &mut Criterion) {
    let answer = provide(|_ctl| 42u64);
    let scope = Scope::builder().build();

    // Prime the cache.
    let _ = scope.resolve(&answer).unwrap();

    c.bench_function("resolve_cached_u64", |b| {
        b.iter(|| {
            let v = scope.resolve(&answer).unwrap();
            black_box(v);
        })
    });
}

fn bench_resolve_cold(c: &mut Criterion) {
    struct Expensive {
        data: Vec<u64>,
    }

    c.bench_function("resolve_cold_expensive", |b| {
        b.iter_batched(
            || {
                let expensive = provide(|_ctl| Expensive {
                    data: (0..1000).collect(),
                });
                let scope = Scope::builder().build();
                (expensive, scope)
            },
            |(expensive, scope)| {
                let v = scope.resolve(&expensive).unwrap();
                black_box(v);
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_reactive_update_propagation(c: &mut Criterion) {
    let base = provide(|_ctl| 1i32);
    let doubled = derive(base.reactive(), |n, _ctl| *n * 2);
    let scope = Scope::builder().build();
    let _ = scope.resolve(&doubled).unwrap();

    c.bench_function("reactive_update_propagation", |b| {
        b.iter(|| {
            scope.update(&base, black_box(7)).unwrap();
            let v = scope.resolve(&doubled).unwrap();
            black_box(v);
        })
    });
}

fn bench_derive_chain_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("derive_chain_depth");

    for depth in [1usize, 4, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter_batched(
                || {
                    let mut exec = provide(|_ctl| 0i32);
                    for _ in 0..depth {
                        exec = derive(exec, |n, _ctl| *n + 1);
                    }
                    (exec, Scope::builder().build())
                },
                |(exec, scope)| {
                    let v = scope.resolve(&exec).unwrap();
                    black_box(v);
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_pod_overlay_resolve(c: &mut Criterion) {
    let greeting = provide(|_ctl| "hello".to_string());
    let scope = Scope::builder().build();

    c.bench_function("pod_overlay_preset_resolve", |b| {
        b.iter_batched(
            || scope.pod().preset(&greeting, "overridden".to_string()).build(),
            |pod| {
                let v = pod.resolve(&greeting).unwrap();
                black_box(v);
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_resolve_cached,
    bench_resolve_cold,
    bench_reactive_update_propagation,
    bench_derive_chain_depth,
    bench_pod_overlay_resolve,
);
criterion_main!(benches);
