//! Drift store: live-state cache fed by watch deltas (coalescing queue + snapshot swap).

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use drift_core::{Delta, DeltaKind, LiveResource, ResourceKey};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Queue capacity from `DRIFT_QUEUE_CAP` (default 2048).
pub fn queue_cap() -> usize {
    std::env::var("DRIFT_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(2048)
}

/// Immutable view of the live objects seen so far.
#[derive(Debug, Clone, Default)]
pub struct LiveSnapshot {
    pub epoch: u64,
    pub items: BTreeMap<ResourceKey, LiveResource>,
}

impl LiveSnapshot {
    pub fn get(&self, key: &ResourceKey) -> Option<&LiveResource> { self.items.get(key) }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Objects in `namespace`; cluster-scoped objects are included.
    pub fn in_namespace(&self, namespace: &str) -> Vec<LiveResource> {
        self.items.values().filter(|l| l.key.namespace.is_empty() || l.key.namespace == namespace).cloned().collect()
    }
}

/// Coalescing queue keyed by resource identity with FIFO order and fixed capacity.
/// A newer delta for a queued key replaces the older one in place.
pub struct Coalescer {
    map: FxHashMap<ResourceKey, Delta>,
    order: VecDeque<ResourceKey>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self { Self { map: FxHashMap::default(), order: VecDeque::new(), cap, dropped: 0 } }

    pub fn len(&self) -> usize { self.map.len() }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, d: Delta) {
        if !self.map.contains_key(&d.key) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                    counter!("store_deltas_dropped_total", 1);
                }
            }
            self.order.push_back(d.key.clone());
        }
        self.map.insert(d.key.clone(), d);
    }

    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

/// Folds delta batches into the next snapshot.
#[derive(Default)]
pub struct WorldBuilder {
    epoch: u64,
    items: BTreeMap<ResourceKey, LiveResource>,
}

impl WorldBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn apply(&mut self, batch: Vec<Delta>) {
        for d in batch {
            match d.kind {
                DeltaKind::Applied => {
                    self.items.insert(d.key.clone(), LiveResource { key: d.key, object: d.raw });
                }
                DeltaKind::Deleted => {
                    self.items.remove(&d.key);
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<LiveSnapshot> { Arc::new(LiveSnapshot { epoch: self.epoch, items: self.items.clone() }) }
}

/// Readers' handle: the current snapshot and a channel that ticks on every swap.
#[derive(Clone)]
pub struct BackendHandle {
    snap: Arc<ArcSwap<LiveSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl BackendHandle {
    pub fn current(&self) -> Arc<LiveSnapshot> { self.snap.load_full() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

/// Spawn the ingest loop. Deltas sent on the returned sender are coalesced and published
/// as snapshots every few milliseconds; the loop drains and exits when all senders drop.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<Delta>, BackendHandle) {
    let (tx, mut rx) = mpsc::channel::<Delta>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(LiveSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = WorldBuilder::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        let flush = |coalescer: &mut Coalescer, builder: &mut WorldBuilder| {
            let batch = coalescer.drain_ready();
            if batch.is_empty() {
                return;
            }
            debug!(batch = batch.len(), "snapshot swap");
            builder.apply(batch);
            let next = builder.freeze();
            let epoch = next.epoch;
            snap_clone.store(next);
            let _ = epoch_tx.send(epoch);
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => coalescer.push(d),
                        None => {
                            debug!("delta channel closed; draining and exiting ingest loop");
                            flush(&mut coalescer, &mut builder);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => flush(&mut coalescer, &mut builder),
            }
        }
        info!(dropped = coalescer.dropped(), "ingest loop stopped");
    });

    (tx, BackendHandle { snap, epoch_rx })
}
