// Lookup hot-path benchmarks.
// Exercises the new-entry, warm, and disk-hit paths of the volatile
// PKFile lookup engine (spec.md §4.2), plus `add_entry` through a full
// `Coordinator` so the lease table, used-CI log, and graph-log are on
// the critical path the way a real evaluator round-trip would see.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fncached::{CacheConfig, Coordinator, Fingerprint};
use tempfile::TempDir;

fn make_coordinator() -> (std::sync::Arc<Coordinator>, TempDir) {
    let tmp = TempDir::new().unwrap();
    let mut config = CacheConfig::default();
    config.stable_cache_root = tmp.path().join("cache");
    config.log_root = tmp.path().join("logs");
    config.free_pause = std::time::Duration::from_secs(3600);
    let coordinator = Coordinator::open(config).unwrap();
    (coordinator, tmp)
}

fn names_and_fps(n: usize, seed: u8) -> (Vec<String>, Vec<Fingerprint>) {
    let names = (0..n).map(|i| format!("v{i}")).collect();
    let fps = (0..n).map(|i| Fingerprint::of_bytes(&[seed, i as u8])).collect();
    (names, fps)
}

fn bench_add_entry(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_entry");
    for &arity in &[1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::new("fv_count", arity), &arity, |b, &arity| {
            let (coordinator, _tmp) = make_coordinator();
            let instance_fp = coordinator.get_cache_instance();
            let mut counter = 0u64;
            b.iter(|| {
                counter += 1;
                let pk = Fingerprint::of_bytes(&counter.to_le_bytes());
                let (names, fps) = names_and_fps(arity, counter as u8);
                let outcome = coordinator
                    .add_entry(instance_fp, pk, names, fps, b"value".to_vec(), 1, vec![], None)
                    .unwrap();
                black_box(outcome);
            });
        });
    }
    group.finish();
}

fn bench_lookup_new_common_hit(c: &mut Criterion) {
    let (coordinator, _tmp) = make_coordinator();
    let instance_fp = coordinator.get_cache_instance();
    let pk = Fingerprint::of_bytes(b"bench-pk");
    let (names, fps) = names_and_fps(8, 1);
    coordinator
        .add_entry(instance_fp, pk, names, fps.clone(), b"value".to_vec(), 1, vec![], None)
        .unwrap();

    c.bench_function("lookup_new_common_hit", |b| {
        b.iter(|| {
            let result = coordinator.lookup(instance_fp, pk, 1, &fps).unwrap();
            black_box(result);
        });
    });
}

fn bench_lookup_warm_hit_after_flush(c: &mut Criterion) {
    let (coordinator, _tmp) = make_coordinator();
    let instance_fp = coordinator.get_cache_instance();
    let pk = Fingerprint::of_bytes(b"bench-disk-pk");
    let (names, fps) = names_and_fps(8, 2);
    coordinator
        .add_entry(instance_fp, pk, names, fps.clone(), b"value".to_vec(), 1, vec![], None)
        .unwrap();
    coordinator.flush_all().unwrap();

    c.bench_function("lookup_warm_hit_after_flush", |b| {
        b.iter(|| {
            let result = coordinator.lookup(instance_fp, pk, 1, &fps).unwrap();
            black_box(result);
        });
    });
}

criterion_group!(benches, bench_add_entry, bench_lookup_new_common_hit, bench_lookup_warm_hit_after_flush);
criterion_main!(benches);
