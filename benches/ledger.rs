//! Benchmarks for the commit ledger and the sync commit path
//!
//! Run with: cargo bench --bench ledger

use criterion::{
  black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use std::sync::Arc;

extern crate walrelay;

use walrelay::replication::{
  BufferPool, BuiltinCallback, CommitCallback, CommitLedger, LogBuffer, MessageMetadata,
  Messenger, PrimaryReplicationManager, PrimaryReplicationOptions, ReplicaId, ReplicationMessage,
  ReplicationPolicy, ReplyHandler,
};

const REPLICAS: [&str; 3] = ["replica-a", "replica-b", "replica-c"];

struct DiscardMessenger;

impl Messenger for DiscardMessenger {
  fn send(
    &self,
    _destination: &ReplicaId,
    envelope: &[u8],
    _reply: ReplyHandler,
    _remote_callback: BuiltinCallback,
    _one_way: bool,
  ) -> walrelay::Result<()> {
    black_box(envelope);
    Ok(())
  }
}

fn callbacks(first_txn: u64, count: u64) -> Vec<CommitCallback> {
  (first_txn..first_txn + count)
    .map(|txn_id| CommitCallback::new(txn_id, || {}))
    .collect()
}

fn bench_ledger_release(c: &mut Criterion) {
  let mut group = c.benchmark_group("ledger_release");
  let replicas: Vec<ReplicaId> = REPLICAS.iter().copied().map(ReplicaId::new).collect();

  for batches in [16u64, 256u64].iter() {
    let txns_per_batch = 8u64;
    group.throughput(Throughput::Elements(batches * txns_per_batch));
    group.bench_with_input(
      BenchmarkId::new("batches", batches),
      batches,
      |bencher, &batches| {
        bencher.iter_batched(
          || {
            let mut ledger = CommitLedger::new(replicas.len());
            for batch in 0..batches {
              ledger.enqueue(
                Some(batch + 1),
                callbacks(batch * txns_per_batch, txns_per_batch),
                true,
              );
            }
            ledger
          },
          |mut ledger| {
            let mut released = 0usize;
            // Apply in reverse so every release happens on the final notification.
            for txn_id in (0..batches * txns_per_batch).rev() {
              for replica in &replicas {
                if ledger.record_applied(txn_id, replica) {
                  released += ledger.drain_ready().len();
                }
              }
            }
            black_box(released)
          },
          BatchSize::SmallInput,
        );
      },
    );
  }

  group.finish();
}

fn bench_sync_commit_round_trip(c: &mut Criterion) {
  let mut group = c.benchmark_group("sync_commit_round_trip");
  let manager = PrimaryReplicationManager::new(
    PrimaryReplicationOptions::new().replicas(REPLICAS),
    Arc::new(DiscardMessenger),
    BufferPool::new(64),
  )
  .expect("expected value");
  let replicas: Vec<ReplicaId> = REPLICAS.iter().copied().map(ReplicaId::new).collect();
  let records = vec![0u8; 4096];
  let mut next_txn = 0u64;

  group.throughput(Throughput::Bytes(records.len() as u64));
  group.bench_function("batch_4k", |bencher| {
    bencher.iter(|| {
      let txn_id = next_txn;
      next_txn += 1;
      manager.replicate_batch(
        Some(Arc::new(LogBuffer::from_bytes(records.clone(), 1))),
        callbacks(txn_id, 1),
        ReplicationPolicy::Sync,
      );
      for replica in &replicas {
        manager
          .handle_message(
            replica,
            ReplicationMessage::txn_applied(MessageMetadata::new(txn_id), txn_id),
          )
          .expect("expected value");
      }
    });
  });

  group.finish();
}

fn bench_envelope_codec(c: &mut Criterion) {
  let mut group = c.benchmark_group("envelope_codec");

  for size in [256usize, 65_536usize].iter() {
    let payload = vec![7u8; *size];
    let envelope = ReplicationMessage::records_batch(MessageMetadata::new(1), 1, &payload[..])
      .encode()
      .expect("expected value");
    group.throughput(Throughput::Bytes(*size as u64));
    group.bench_with_input(BenchmarkId::new("decode", size), &envelope, |bencher, envelope| {
      bencher.iter(|| ReplicationMessage::decode(black_box(envelope)).expect("expected value"));
    });
  }

  group.finish();
}

criterion_group!(
  benches,
  bench_ledger_release,
  bench_sync_commit_round_trip,
  bench_envelope_codec
);
criterion_main!(benches);
