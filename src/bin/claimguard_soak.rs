//! Randomized soak run against the in-memory host.
//!
//! Scanner threads tick every partition while a mutator flips owners, adds
//! and removes claims, and unloads/reloads partitions. Every round ends at a
//! quiescent point where the guard invariants are checked.
//!
//! Usage:
//! ```bash
//! RUST_LOG=claimguard_rs=info cargo run --release --bin claimguard_soak -- claimguard.toml
//! ```
//!
//! Tunables: `CLAIMGUARD_SOAK_ROUNDS`, `CLAIMGUARD_SOAK_CLAIMS`,
//! `CLAIMGUARD_SOAK_SCANNERS`, `CLAIMGUARD_SOAK_SEED`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::bounded;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use claimguard_rs::test_support::{bindings, populate, MemoryWorld};
use claimguard_rs::{
    BlockPos, ClaimStore, GuardMarker, GuardReconciler, OwnerId, OwningContext, ReconcilerConfig,
    RecordKey, WorkerContext,
};

const SIDE: i32 = 4;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn drain(context: &WorkerContext) -> Result<()> {
    let (tx, rx) = bounded(1);
    if context
        .submit(Box::new(move || {
            let _ = tx.send(());
        }))
        .is_err()
    {
        bail!("owning context stopped");
    }
    rx.recv_timeout(Duration::from_secs(30))
        .context("owning context stalled")
}

fn settle(
    world: &MemoryWorld,
    context: &WorkerContext,
    reconciler: &GuardReconciler,
) -> Result<()> {
    for _ in 0..3 {
        for partition in world.loaded_partitions() {
            reconciler.tick(partition);
        }
        drain(context)?;
    }
    reconciler.sweep_loaded();
    drain(context)?;
    for partition in world.loaded_partitions() {
        reconciler.tick(partition);
    }
    drain(context)
}

fn mutate(
    world: &MemoryWorld,
    reconciler: &GuardReconciler,
    records: &mut Vec<RecordKey>,
    owners: &[OwnerId],
    rng: &mut StdRng,
) -> Result<()> {
    for _ in 0..records.len().max(1) / 8 {
        match rng.random_range(0..100) {
            0..=79 if !records.is_empty() => {
                let record = records[rng.random_range(0..records.len())];
                let owner = rng
                    .random_bool(0.6)
                    .then(|| owners[rng.random_range(0..owners.len())]);
                world.set_owner(record, owner);
            }
            80..=89 if !records.is_empty() => {
                let index = rng.random_range(0..records.len());
                world.remove_claim(records.swap_remove(index));
            }
            90..=96 => {
                let position = BlockPos::new(
                    rng.random_range(0..SIDE * 32),
                    rng.random_range(0..128),
                    rng.random_range(0..SIDE * 32),
                );
                if world.claim_at(position).is_none() {
                    let owner = rng
                        .random_bool(0.5)
                        .then(|| owners[rng.random_range(0..owners.len())]);
                    records.push(world.add_claim(position, owner));
                }
            }
            _ => {
                let loaded = world.loaded_partitions();
                if loaded.is_empty() {
                    continue;
                }
                let partition = loaded[rng.random_range(0..loaded.len())];
                world.unload_partition(partition);
                reconciler.partition_unloaded(partition);
                world.load_partition(partition);
                reconciler.partition_loaded(partition)?;
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ReconcilerConfig::load(config_path.as_deref())?;
    let rounds = env_u64("CLAIMGUARD_SOAK_ROUNDS", 50);
    let claims = env_u64("CLAIMGUARD_SOAK_CLAIMS", 2_000) as usize;
    let scanners = env_u64("CLAIMGUARD_SOAK_SCANNERS", 4).max(1) as usize;
    let seed = env_u64("CLAIMGUARD_SOAK_SEED", 42);

    let world = Arc::new(MemoryWorld::new());
    let context = Arc::new(WorkerContext::spawn("claimguard-owner")?);
    world.bind_owning_thread(Some(context.thread_id()));
    let marker = GuardMarker::new(config.marker_prefix.clone());
    let reconciler = GuardReconciler::new(config, bindings(&world, context.clone()));

    let owners: Vec<_> = (0..8).map(|_| OwnerId::random()).collect();
    let mut records = populate(&world, SIDE, claims, &owners, 0.5, seed);
    let mut rng = StdRng::seed_from_u64(seed);

    reconciler.sweep_loaded();
    drain(&context)?;

    let started = Instant::now();
    for round in 0..rounds {
        let running = Arc::new(AtomicBool::new(true));
        let handles: Vec<_> = (0..scanners)
            .map(|index| {
                let world = Arc::clone(&world);
                let reconciler = reconciler.clone();
                let running = Arc::clone(&running);
                thread::spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        for partition in world.loaded_partitions() {
                            if partition.0 as usize % scanners == index {
                                reconciler.tick(partition);
                            }
                        }
                    }
                })
            })
            .collect();

        mutate(&world, &reconciler, &mut records, &owners, &mut rng)?;
        thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::Relaxed);
        for handle in handles {
            if handle.join().is_err() {
                bail!("scanner thread panicked");
            }
        }

        settle(&world, &context, &reconciler)?;
        let violations = world.quiescence_violations(&marker);
        if !violations.is_empty() {
            for violation in &violations {
                warn!(round, %violation, "invariant violated");
            }
            bail!("{} invariant violations in round {round}", violations.len());
        }
        if world.off_context_calls() > 0 {
            bail!("guard store touched off the owning context");
        }
        info!(round, records = records.len(), "round settled");
    }

    let metrics = reconciler.metrics();
    println!(
        "claimguard_soak: {} rounds in {:.2}s, {} claims, {} guards created, {} removed",
        rounds,
        started.elapsed().as_secs_f64(),
        records.len(),
        metrics.guards_created,
        metrics.guards_removed
    );
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    context.shutdown();
    Ok(())
}
