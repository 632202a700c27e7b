use criterion::{black_box, criterion_group, criterion_main, Criterion};

use keyfleet::vault::{InMemoryVault, VaultBackend};
use keyfleet::{Algorithm, EnvelopeKey, HostType, KeyStore, SearchPattern, StoreState, VaultConfig};

fn backend() -> VaultBackend {
    let config = VaultConfig {
        vault_id: "ocid1.vault.bench".to_string(),
        key_id: "ocid1.key.bench".to_string(),
        compartment_id: "ocid1.compartment.bench".to_string(),
        backup_vault_id: None,
        backup_key_id: None,
    };
    VaultBackend::new(
        Box::new(InMemoryVault::new()),
        config,
        EnvelopeKey::generate("ocid1.key.bench").unwrap(),
        StoreState::new(Algorithm::Ecdsa),
    )
    .unwrap()
}

fn benchmark_seal_and_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    let mut store = backend();
    // Key generation dominates real inserts; reuse one key pair to measure
    // the store path itself.
    let pem = Algorithm::Ecdsa.generate_private_key().unwrap();

    group.bench_function("vault_upsert", |b| {
        b.iter(|| {
            let entry = store
                .build_entry(
                    black_box("db1.example.com"),
                    black_box("oracle"),
                    black_box(&pem),
                    HostType::DomU,
                    None,
                )
                .unwrap();
            store.insert(entry, false).unwrap();
        });
    });
    group.finish();
}

fn benchmark_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");

    let mut store = backend();
    let pem = Algorithm::Ecdsa.generate_private_key().unwrap();
    for index in 0..50 {
        let entry = store
            .build_entry(
                &format!("db{index}.example.com"),
                "oracle",
                &pem,
                HostType::DomU,
                None,
            )
            .unwrap();
        store.insert(entry, false).unwrap();
    }

    group.bench_function("full_scan", |b| {
        b.iter(|| {
            let entries = store.search(black_box(&SearchPattern::new()), true).unwrap();
            assert_eq!(entries.len(), 50);
        });
    });

    group.bench_function("cached", |b| {
        store.search(&SearchPattern::new(), true).unwrap();
        b.iter(|| {
            let entries = store
                .search(black_box(&SearchPattern::new()), false)
                .unwrap();
            assert_eq!(entries.len(), 50);
        });
    });

    group.bench_function("targeted_host", |b| {
        b.iter(|| {
            let entries = store
                .search(
                    black_box(&SearchPattern::new().with_fqdn("db25.example.com")),
                    true,
                )
                .unwrap();
            assert_eq!(entries.len(), 1);
        });
    });
    group.finish();
}

fn benchmark_reveal(c: &mut Criterion) {
    let mut group = c.benchmark_group("reveal");

    let mut store = backend();
    let pem = Algorithm::Ecdsa.generate_private_key().unwrap();
    let entry = store
        .build_entry("db1.example.com", "oracle", &pem, HostType::DomU, None)
        .unwrap();
    store.insert(entry.clone(), false).unwrap();

    group.bench_function("open_envelope", |b| {
        b.iter(|| {
            let plaintext = store.reveal(black_box(&entry)).unwrap();
            black_box(plaintext.len());
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_seal_and_insert,
    benchmark_search,
    benchmark_reveal
);
criterion_main!(benches);
