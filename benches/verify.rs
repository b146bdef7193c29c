//! Inventory and verification benchmarks
//!
//! Benchmarks for the hot paths behind every status query and progress tick:
//! - Scanning a model directory
//! - Verifying an inventory against a repository index
//! - Resolving names through the layered registry

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use diffuser_manager::models::{
    LocalInventory, ModelDescriptor, ModelRegistry, RegistryTier, RepoIndex, scan_directory,
    verify,
};
use std::collections::BTreeMap;
use std::hint::black_box;
use tempfile::TempDir;

/// Lay out `count` small files across a diffusers-style tree
fn create_model_dir(count: usize) -> TempDir {
    let dir = TempDir::new().unwrap();
    for i in 0..count {
        let sub = ["transformer", "vae", "text_encoder", "tokenizer"][i % 4];
        let path = dir.path().join(sub).join(format!("shard-{i:05}.safetensors"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![0u8; 64]).unwrap();
    }
    std::fs::write(dir.path().join("model_index.json"), b"{}").unwrap();
    dir
}

fn index_and_inventory(count: usize) -> (RepoIndex, LocalInventory) {
    let mut index = RepoIndex::new("org/bench");
    let mut files = BTreeMap::new();
    for i in 0..count {
        let path = format!("transformer/shard-{i:05}.safetensors");
        index = index.with_file(path.clone(), 5_000_000_000);
        files.insert(path, 5_000_000_000);
    }
    let total_bytes = files.values().sum();
    (
        index,
        LocalInventory {
            files,
            partial: BTreeMap::new(),
            total_bytes,
        },
    )
}

fn bench_scan_directory(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_directory");

    for file_count in [10, 100, 1000] {
        let dir = create_model_dir(file_count);
        group.bench_with_input(BenchmarkId::new("files", file_count), &dir, |b, dir| {
            b.iter(|| black_box(scan_directory(dir.path()).unwrap()));
        });
    }
    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify");

    for file_count in [10, 100, 1000, 10000] {
        let (index, inventory) = index_and_inventory(file_count);
        group.bench_with_input(
            BenchmarkId::new("sized", file_count),
            &(index, inventory),
            |b, (index, inventory)| {
                b.iter(|| black_box(verify(Some(index), inventory, &[])));
            },
        );
    }

    let (_, inventory) = index_and_inventory(1000);
    group.bench_function("structural", |b| {
        b.iter(|| {
            black_box(verify(
                None,
                &inventory,
                &["model_index.json", "transformer", "vae"],
            ))
        });
    });
    group.finish();
}

fn bench_registry_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_resolve");

    for entry_count in [10, 100, 1000] {
        let mut registry = ModelRegistry::new();
        for i in 0..entry_count {
            let name = format!("model-{i}");
            let tier = if i % 2 == 0 {
                RegistryTier::FileConfigured
            } else {
                RegistryTier::Runtime
            };
            let descriptor = ModelDescriptor::new(&name, format!("org/model-{i}"), "flux").unwrap();
            registry.add(&name, descriptor, tier).unwrap();
        }

        group.bench_with_input(
            BenchmarkId::new("entries", entry_count),
            &registry,
            |b, registry| {
                b.iter(|| {
                    // Builtin names fall through both upper tiers
                    black_box(registry.resolve("flux.1-dev"));
                    black_box(registry.resolve(&format!("model-{}", entry_count / 2)));
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_scan_directory,
    bench_verify,
    bench_registry_resolve
);
criterion_main!(benches);
