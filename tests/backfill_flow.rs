mod common;

use async_trait::async_trait;
use chain_backfill::{
    progress, Backfill, BackfillError, Backoff, DatasetKind, DatasetPlan, DatasetRecord,
    DrainState, FetchClient, FetchError, FetchKey, Fetched, HashRecord, HeaderStrategy,
    HeightRange, Outcome, ProgressEvent, RecordSource, RecordStore, RetryPolicy, RpcMethod,
    SqliteStore,
};
use common::{hash_at, FakeChain, MemStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Engine = Backfill<Arc<MemStore>, FetchClient<Arc<FakeChain>>>;

fn engine(chain: &Arc<FakeChain>, store: &Arc<MemStore>, policy: RetryPolicy) -> Engine {
    let client = FetchClient::new(Arc::clone(chain)).with_retry_policy(policy);
    Backfill::new(Arc::clone(store), client)
}

fn seed_hash(store: &MemStore, height: u64) {
    store.seed(DatasetRecord::Hash(HashRecord {
        height,
        hash: hash_at(height),
    }));
}

async fn drain_events(rx: tokio::sync::mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut rx = rx;
    let mut events = Vec::new();
    while let Some(e) = rx.recv().await {
        events.push(e);
    }
    events
}

#[tokio::test]
async fn empty_store_is_filled_up_to_the_tip() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(2)));
    let store = Arc::new(MemStore::new());
    let (tx, rx) = progress::channel(16);
    let engine = engine(&chain, &store, RetryPolicy::immediate(1)).with_progress(tx);

    let report = engine
        .backfill(DatasetPlan::to_chain_tip(DatasetKind::Hashes))
        .await?;
    drop(engine);

    assert_eq!(report.state, DrainState::Done);
    assert_eq!(report.range, HeightRange::up_to(Some(2)));
    assert_eq!((report.missing, report.stored, report.skipped), (3, 3, 0));
    assert_eq!(store.heights(DatasetKind::Hashes), vec![0, 1, 2]);
    assert_eq!(store.max_height(DatasetKind::Hashes).await?, Some(2));
    assert_eq!(
        store.get(DatasetKind::Hashes, 1).map(|r| r.block_hash()),
        Some(hash_at(1))
    );

    let events = drain_events(rx).await;
    let heights: Vec<_> = events.iter().map(|e| e.height).collect();
    assert_eq!(heights, vec![0, 1, 2]);
    assert!(events
        .iter()
        .all(|e| e.outcome == Outcome::Stored { attempts: 1 }));
    Ok(())
}

#[tokio::test]
async fn interior_gaps_are_filled_and_present_rows_untouched() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(3)));
    let store = Arc::new(MemStore::new());
    seed_hash(&store, 0);
    seed_hash(&store, 2);
    let engine = engine(&chain, &store, RetryPolicy::immediate(1));

    let report = engine
        .backfill(DatasetPlan::to_chain_tip(DatasetKind::Hashes))
        .await?;

    assert_eq!(report.missing, 2);
    assert_eq!(
        store.writes(),
        vec![(DatasetKind::Hashes, 1), (DatasetKind::Hashes, 3)]
    );
    let asked: Vec<_> = chain
        .calls()
        .into_iter()
        .filter(|(m, _)| *m == RpcMethod::GetBlockHash)
        .map(|(_, p)| p)
        .collect();
    assert_eq!(asked, vec![vec![json!(1)], vec![json!(3)]]);
    Ok(())
}

#[tokio::test]
async fn rerunning_a_complete_range_writes_nothing() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(4)));
    let store = Arc::new(MemStore::new());
    let engine = engine(&chain, &store, RetryPolicy::immediate(1));
    let plans = [
        DatasetPlan::to_chain_tip(DatasetKind::Hashes),
        DatasetPlan::to_chain_tip(DatasetKind::Stats),
    ];

    engine.run(&plans).await?;
    let writes = store.writes().len();
    assert_eq!(writes, 10);

    let again = engine.run(&plans).await?;
    assert_eq!(store.writes().len(), writes);
    assert!(again.datasets.iter().all(|d| d.missing == 0 && d.stored == 0));
    Ok(())
}

#[tokio::test]
async fn headers_resolve_their_hash_first() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(2)));
    let store = Arc::new(MemStore::new());
    let engine = engine(&chain, &store, RetryPolicy::immediate(1));

    let report = engine
        .backfill(DatasetPlan::to_chain_tip(DatasetKind::Headers))
        .await?;

    assert_eq!(report.stored, 3);
    assert_eq!(report.dependencies_stored, 3);
    // the hash record lands before the header that needed it
    assert_eq!(
        store.writes(),
        vec![
            (DatasetKind::Hashes, 0),
            (DatasetKind::Headers, 0),
            (DatasetKind::Hashes, 1),
            (DatasetKind::Headers, 1),
            (DatasetKind::Hashes, 2),
            (DatasetKind::Headers, 2),
        ]
    );
    let methods: Vec<_> = chain
        .calls()
        .into_iter()
        .map(|(m, _)| m)
        .filter(|m| *m != RpcMethod::GetBlockCount)
        .collect();
    assert_eq!(
        methods,
        [RpcMethod::GetBlockHash, RpcMethod::GetBlockHeader].repeat(3)
    );
    match store.get(DatasetKind::Headers, 2) {
        Some(DatasetRecord::Header(h)) => {
            assert_eq!(h.hash, hash_at(2));
            assert_eq!(h.prev_hash, Some(hash_at(1)));
            assert_eq!(h.next_hash, None);
        }
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn hash_written_for_a_header_gets_its_own_event() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(0)).fail_next(RpcMethod::GetBlockHash, 2));
    let store = Arc::new(MemStore::new());
    let (tx, rx) = progress::channel(16);
    let policy = RetryPolicy::unbounded(Backoff::Fixed(Duration::ZERO));
    let engine = engine(&chain, &store, policy).with_progress(tx);

    let report = engine
        .backfill(DatasetPlan::to_chain_tip(DatasetKind::Headers))
        .await?;
    drop(engine);

    assert_eq!((report.stored, report.dependencies_stored), (1, 1));
    assert_eq!(chain.calls_of(RpcMethod::GetBlockHash), 3);
    let events: Vec<_> = drain_events(rx)
        .await
        .into_iter()
        .map(|e| (e.dataset, e.height, e.outcome))
        .collect();
    assert_eq!(
        events,
        vec![
            (DatasetKind::Hashes, 0, Outcome::Stored { attempts: 3 }),
            (DatasetKind::Headers, 0, Outcome::Stored { attempts: 1 }),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn header_with_a_foreign_hash_is_skipped() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(2)).forge_header(1));
    let store = Arc::new(MemStore::new());
    let (tx, rx) = progress::channel(16);
    let engine = engine(&chain, &store, RetryPolicy::immediate(1)).with_progress(tx);

    let report = engine
        .backfill(DatasetPlan::to_chain_tip(DatasetKind::Headers))
        .await?;
    drop(engine);

    assert_eq!((report.stored, report.skipped), (2, 1));
    assert_eq!(store.heights(DatasetKind::Headers), vec![0, 2]);
    // the hash fetched for the rejected header is not kept either
    assert_eq!(store.heights(DatasetKind::Hashes), vec![0, 2]);
    let skipped: Vec<_> = drain_events(rx)
        .await
        .into_iter()
        .filter(|e| matches!(e.outcome, Outcome::Skipped { .. }))
        .map(|e| (e.dataset, e.height))
        .collect();
    assert_eq!(skipped, vec![(DatasetKind::Headers, 1)]);
    Ok(())
}

/// Source whose hash records claim the next height.
struct MisnumberedHashes<F>(F);

#[async_trait]
impl<F: RecordSource> RecordSource for MisnumberedHashes<F> {
    async fn chain_tip(&self) -> Result<HeightRange, FetchError> {
        self.0.chain_tip().await
    }

    async fn fetch(
        &self,
        kind: DatasetKind,
        key: FetchKey,
    ) -> Result<Fetched<DatasetRecord>, FetchError> {
        let mut fetched = self.0.fetch(kind, key).await?;
        if let DatasetRecord::Hash(record) = &mut fetched.value {
            record.height += 1;
        }
        Ok(fetched)
    }
}

#[tokio::test]
async fn misnumbered_hash_dependency_skips_the_header() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(1)));
    let store = Arc::new(MemStore::new());
    let client = FetchClient::new(Arc::clone(&chain)).with_retry_policy(RetryPolicy::immediate(1));
    let engine = Backfill::new(Arc::clone(&store), MisnumberedHashes(client));

    let report = engine
        .backfill(DatasetPlan::to_chain_tip(DatasetKind::Headers))
        .await?;

    assert_eq!((report.stored, report.skipped), (0, 2));
    assert_eq!(report.state, DrainState::Done);
    assert!(store.writes().is_empty());
    assert_eq!(chain.calls_of(RpcMethod::GetBlockHeader), 0);
    Ok(())
}

#[tokio::test]
async fn sqlite_store_backfills_gaps_once() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(3)));
    let store = Arc::new(SqliteStore::new_in_memory()?);
    for height in [0, 2] {
        store
            .upsert(&DatasetRecord::Hash(HashRecord {
                height,
                hash: hash_at(height),
            }))
            .await?;
    }
    let client = FetchClient::new(Arc::clone(&chain)).with_retry_policy(RetryPolicy::immediate(1));
    let engine = Backfill::new(Arc::clone(&store), client);
    let plan = DatasetPlan::to_chain_tip(DatasetKind::Hashes);

    let first = engine.backfill(plan).await?;
    assert_eq!((first.missing, first.stored, first.already_present), (2, 2, 0));
    let asked: Vec<_> = chain
        .calls()
        .into_iter()
        .filter(|(m, _)| *m == RpcMethod::GetBlockHash)
        .map(|(_, p)| p)
        .collect();
    assert_eq!(asked, vec![vec![json!(1)], vec![json!(3)]]);
    assert_eq!(store.count(DatasetKind::Hashes).await?, 4);
    assert_eq!(store.block_hash(3).await?, Some(hash_at(3)));

    let second = engine.backfill(plan).await?;
    assert_eq!((second.missing, second.stored), (0, 0));
    assert_eq!(chain.calls_of(RpcMethod::GetBlockHash), 2);
    assert_eq!(store.count(DatasetKind::Hashes).await?, 4);
    Ok(())
}

#[tokio::test]
async fn stored_hashes_are_reused_for_headers() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(2)));
    let store = Arc::new(MemStore::new());
    for h in 0..=2 {
        seed_hash(&store, h);
    }
    let engine = engine(&chain, &store, RetryPolicy::immediate(1));

    let report = engine
        .backfill(DatasetPlan::to_chain_tip(DatasetKind::Headers))
        .await?;

    assert_eq!((report.stored, report.dependencies_stored), (3, 0));
    assert_eq!(chain.calls_of(RpcMethod::GetBlockHash), 0);
    assert_eq!(chain.calls_of(RpcMethod::GetBlockHeader), 3);
    Ok(())
}

#[tokio::test]
async fn by_height_headers_leave_the_hash_dataset_alone() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(1)));
    let store = Arc::new(MemStore::new());
    let engine = engine(&chain, &store, RetryPolicy::immediate(1))
        .with_header_strategy(HeaderStrategy::ByHeight);

    let report = engine
        .backfill(DatasetPlan::to_chain_tip(DatasetKind::Headers))
        .await?;

    assert_eq!(report.stored, 2);
    assert!(store.heights(DatasetKind::Hashes).is_empty());
    assert_eq!(chain.calls_of(RpcMethod::GetBlockHash), 2);
    Ok(())
}

#[tokio::test]
async fn transient_failures_are_retried_and_counted() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(1)).fail_next(RpcMethod::GetBlockStats, 2));
    let store = Arc::new(MemStore::new());
    let (tx, rx) = progress::channel(16);
    let policy = RetryPolicy::unbounded(Backoff::Fixed(Duration::ZERO));
    let engine = engine(&chain, &store, policy).with_progress(tx);

    let report = engine
        .backfill(DatasetPlan::to_chain_tip(DatasetKind::Stats))
        .await?;
    drop(engine);

    assert_eq!((report.stored, report.skipped), (2, 0));
    let events = drain_events(rx).await;
    assert_eq!(events[0].outcome, Outcome::Stored { attempts: 3 });
    assert_eq!(events[1].outcome, Outcome::Stored { attempts: 1 });
    assert_eq!(chain.calls_of(RpcMethod::GetBlockStats), 4);
    Ok(())
}

#[tokio::test]
async fn exhausted_heights_are_skipped_then_healed() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(2)).fail_next(RpcMethod::GetBlockStats, 4));
    let store = Arc::new(MemStore::new());
    let engine = engine(&chain, &store, RetryPolicy::immediate(2));
    let plan = DatasetPlan::to_chain_tip(DatasetKind::Stats);

    let first = engine.backfill(plan).await?;
    assert_eq!((first.stored, first.skipped), (1, 2));
    assert_eq!(store.heights(DatasetKind::Stats), vec![2]);

    let second = engine.backfill(plan).await?;
    assert_eq!((second.missing, second.stored), (2, 2));
    assert_eq!(store.heights(DatasetKind::Stats), vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn malformed_record_is_skipped_and_the_drain_continues() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(2)).lie_about(1));
    let store = Arc::new(MemStore::new());
    let (tx, rx) = progress::channel(16);
    let engine = engine(&chain, &store, RetryPolicy::immediate(1)).with_progress(tx);

    let report = engine
        .backfill(DatasetPlan::to_chain_tip(DatasetKind::Stats))
        .await?;
    drop(engine);

    assert_eq!((report.stored, report.skipped), (2, 1));
    assert_eq!(store.heights(DatasetKind::Stats), vec![0, 2]);
    let events = drain_events(rx).await;
    assert!(matches!(events[1].outcome, Outcome::Skipped { .. }));
    assert_eq!(events[1].height, 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_fetches_still_store_in_height_order() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(40)));
    let store = Arc::new(MemStore::new());
    seed_hash(&store, 7);
    seed_hash(&store, 19);
    let engine = engine(&chain, &store, RetryPolicy::immediate(1)).with_concurrency(8);

    let report = engine
        .backfill(DatasetPlan::to_chain_tip(DatasetKind::Hashes))
        .await?;

    assert_eq!(report.stored, 39);
    let written: Vec<_> = store.writes().into_iter().map(|(_, h)| h).collect();
    let mut sorted = written.clone();
    sorted.sort_unstable();
    assert_eq!(written, sorted);
    assert_eq!(store.heights(DatasetKind::Hashes), (0..=40).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn catch_up_follows_the_hash_dataset() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(10)));
    let store = Arc::new(MemStore::new());
    for h in 0..=3 {
        seed_hash(&store, h);
    }
    let engine = engine(&chain, &store, RetryPolicy::immediate(1));

    let report = engine
        .backfill(DatasetPlan::following(DatasetKind::Headers, DatasetKind::Hashes))
        .await?;

    assert_eq!(report.range, HeightRange::up_to(Some(3)));
    assert_eq!(store.heights(DatasetKind::Headers), vec![0, 1, 2, 3]);
    assert_eq!(chain.calls_of(RpcMethod::GetBlockCount), 0);
    Ok(())
}

#[tokio::test]
async fn fixed_range_beyond_the_chain_skips_unknown_heights() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(1)));
    let store = Arc::new(MemStore::new());
    let engine = engine(&chain, &store, RetryPolicy::immediate(1));

    let report = engine
        .backfill(DatasetPlan::fixed(
            DatasetKind::Hashes,
            HeightRange::up_to(Some(3)),
        ))
        .await?;

    assert_eq!((report.stored, report.skipped), (2, 2));
    assert_eq!(store.heights(DatasetKind::Hashes), vec![0, 1]);
    Ok(())
}

#[tokio::test]
async fn unreachable_tip_fails_the_run() {
    let chain = Arc::new(FakeChain::new(Some(5)).fail_next(RpcMethod::GetBlockCount, 1));
    let store = Arc::new(MemStore::new());
    let engine = engine(&chain, &store, RetryPolicy::immediate(1));

    let err = engine
        .run(&[DatasetPlan::to_chain_tip(DatasetKind::Hashes)])
        .await
        .unwrap_err();
    assert!(matches!(err, BackfillError::Tip(_)), "got {err:?}");
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn store_failure_aborts_the_run() {
    let chain = Arc::new(FakeChain::new(Some(3)));
    let store = Arc::new(MemStore::failing_from(1));
    let engine = engine(&chain, &store, RetryPolicy::immediate(1));

    let err = engine
        .run(&[
            DatasetPlan::to_chain_tip(DatasetKind::Hashes),
            DatasetPlan::to_chain_tip(DatasetKind::Stats),
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, BackfillError::Store(_)), "got {err:?}");
    assert_eq!(store.writes(), vec![(DatasetKind::Hashes, 0)]);
    assert_eq!(chain.calls_of(RpcMethod::GetBlockStats), 0);
}

#[tokio::test]
async fn cancelled_before_start_does_nothing() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(3)));
    let store = Arc::new(MemStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let engine = engine(&chain, &store, RetryPolicy::immediate(1)).with_cancellation(cancel);

    let summary = engine
        .run(&[
            DatasetPlan::to_chain_tip(DatasetKind::Hashes),
            DatasetPlan::to_chain_tip(DatasetKind::Stats),
        ])
        .await?;

    assert!(summary.cancelled());
    assert_eq!(summary.datasets.len(), 1);
    assert!(chain.calls().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_an_endless_retry() -> anyhow::Result<()> {
    let chain = Arc::new(FakeChain::new(Some(3)).fail_next(RpcMethod::GetBlockHash, u32::MAX));
    let store = Arc::new(MemStore::new());
    let cancel = CancellationToken::new();
    let client = FetchClient::new(Arc::clone(&chain))
        .with_retry_policy(RetryPolicy::default())
        .with_cancellation(cancel.clone());
    let engine = Backfill::new(Arc::clone(&store), client).with_cancellation(cancel.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(150)).await;
        cancel.cancel();
    });

    let summary = engine
        .run(&[
            DatasetPlan::to_chain_tip(DatasetKind::Hashes),
            DatasetPlan::to_chain_tip(DatasetKind::Stats),
        ])
        .await?;

    assert!(summary.cancelled());
    assert_eq!(summary.datasets.len(), 1);
    assert!(store.writes().is_empty());
    // attempts at t=0, 60s and 120s
    assert_eq!(chain.calls_of(RpcMethod::GetBlockHash), 3);
    Ok(())
}
