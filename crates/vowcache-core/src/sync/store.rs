use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::slice::{OptimisticSlice, SyncPhase};
use crate::error::{Error, Result};
use crate::store::RecordStore;

/// One mutable slice of app state and how it maps onto the record store.
///
/// `apply` is the optimistic prediction; `persist` performs the same action
/// against the store and reports what actually happened. Differing outcomes
/// mean the store changed underneath us and trigger a reload.
#[async_trait]
pub trait SyncDomain: Send + Sync + 'static {
    type Value: Clone + PartialEq + Debug + Send + Sync + 'static;
    type Action: Debug + Send + Sync + 'static;
    type Outcome: PartialEq + Debug + Send + Sync + 'static;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Value shown before the first load completes.
    fn initial(&self) -> Self::Value;

    fn apply(&self, value: &mut Self::Value, action: &Self::Action) -> Self::Outcome;

    async fn persist(&self, records: &RecordStore, action: &Self::Action) -> Result<Self::Outcome>;

    /// Authoritative value, as the record store has it.
    async fn load(&self, records: &RecordStore) -> Result<Self::Value>;
}

enum Command<D: SyncDomain> {
    Persist {
        action: D::Action,
        predicted: D::Outcome,
    },
    Reload {
        done: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug)]
struct Bookkeeping {
    /// Mutations applied in memory but not yet persisted.
    pending: usize,
    /// In-memory value may disagree with the store.
    stale: bool,
}

struct Shared<D: SyncDomain> {
    domain: D,
    records: Arc<RecordStore>,
    slice: watch::Sender<OptimisticSlice<D::Value>>,
    /// Held while changing `slice`, so mutations and reloads never interleave.
    book: Mutex<Bookkeeping>,
}

fn lock(book: &Mutex<Bookkeeping>) -> MutexGuard<'_, Bookkeeping> {
    book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Optimistic state container for one domain.
///
/// Mutations update the in-memory value on the caller's stack and are then
/// persisted, in order, by a single background worker. Failed or diverging
/// writes are never retried: the slice reloads from the record store and
/// keeps the error for the UI.
pub struct OptimisticSyncStore<D: SyncDomain> {
    shared: Arc<Shared<D>>,
    commands: mpsc::UnboundedSender<Command<D>>,
    worker: JoinHandle<()>,
}

impl<D: SyncDomain> OptimisticSyncStore<D> {
    /// Create the store and spawn its worker. Must be called from within a
    /// Tokio runtime. The slice starts out loading; call [`load`](Self::load)
    /// to populate it.
    pub fn new(domain: D, records: Arc<RecordStore>) -> Self {
        let initial = domain.initial();
        let (slice, _) = watch::channel(OptimisticSlice::loading(initial));
        let shared = Arc::new(Shared {
            domain,
            records,
            slice,
            book: Mutex::new(Bookkeeping {
                pending: 0,
                stale: true,
            }),
        });

        let (commands, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(Arc::clone(&shared), rx));

        Self {
            shared,
            commands,
            worker,
        }
    }

    /// Apply `action` to the in-memory value now and persist it in the
    /// background. A mutation issued while earlier ones are still pending
    /// applies on top of their optimistic result.
    pub fn mutate(&self, action: D::Action) {
        let shared = &self.shared;
        let mut book = lock(&shared.book);

        let mut slice = shared.slice.borrow().clone();
        let predicted = shared.domain.apply(&mut slice.value, &action);
        slice.phase = SyncPhase::Pending;
        slice.is_loading = true;
        slice.error = None;
        shared.slice.send_replace(slice);

        trace!(domain = shared.domain.name(), ?action, ?predicted, "Optimistic mutation applied");
        book.pending += 1;
        if let Err(e) = self.commands.send(Command::Persist { action, predicted }) {
            book.pending -= 1;
            error!(domain = shared.domain.name(), action = ?e.0.action_debug(), "Sync worker stopped, mutation not persisted");
        }
    }

    /// Replace the in-memory value with the record store's. Runs after any
    /// mutation already issued.
    pub async fn load(&self) -> Result<()> {
        {
            let _book = lock(&self.shared.book);
            self.shared.slice.send_modify(|slice| slice.is_loading = true);
        }

        let (done, rx) = oneshot::channel();
        let stopped = || Error::ReadFailed {
            table: self.shared.domain.name().to_string(),
            reason: "sync worker stopped".to_string(),
        };
        self.commands
            .send(Command::Reload { done })
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    pub fn snapshot(&self) -> OptimisticSlice<D::Value> {
        self.shared.slice.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OptimisticSlice<D::Value>> {
        self.shared.slice.subscribe()
    }

    /// Wait until nothing is pending or reconciling and return that state.
    pub async fn settled(&self) -> OptimisticSlice<D::Value> {
        let mut rx = self.shared.slice.subscribe();
        let settled = rx.wait_for(|slice| slice.is_settled()).await.map(|s| s.clone());
        settled.unwrap_or_else(|_| self.snapshot())
    }

    pub fn clear_error(&self) {
        let _book = lock(&self.shared.book);
        self.shared.slice.send_if_modified(|slice| slice.error.take().is_some());
    }

    /// Stop accepting mutations and wait for queued ones to finish.
    pub async fn shutdown(self) {
        let Self {
            shared,
            commands,
            worker,
        } = self;
        drop(commands);
        if let Err(e) = worker.await {
            error!(domain = shared.domain.name(), error = %e, "Sync worker panicked");
        }
    }

    async fn run(shared: Arc<Shared<D>>, mut rx: mpsc::UnboundedReceiver<Command<D>>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Persist { action, predicted } => {
                    let result = shared.domain.persist(&shared.records, &action).await;
                    shared.finish_persist(&action, predicted, result);
                    // Reload failures are already recorded on the slice
                    let _ = shared.settle().await;
                }
                Command::Reload { done } => {
                    lock(&shared.book).stale = true;
                    let _ = done.send(shared.settle().await);
                }
            }
        }
        debug!(domain = shared.domain.name(), "Sync worker stopped");
    }
}

impl<D: SyncDomain> Command<D> {
    fn action_debug(&self) -> String {
        match self {
            Command::Persist { action, .. } => format!("{:?}", action),
            Command::Reload { .. } => "reload".to_string(),
        }
    }
}

impl<D: SyncDomain> Shared<D> {
    fn finish_persist(&self, action: &D::Action, predicted: D::Outcome, result: Result<D::Outcome>) {
        let mut book = lock(&self.book);
        book.pending = book.pending.saturating_sub(1);

        match result {
            Ok(outcome) if outcome == predicted => {
                trace!(domain = self.domain.name(), ?action, "Mutation confirmed");
            }
            Ok(outcome) => {
                debug!(
                    domain = self.domain.name(),
                    ?action,
                    ?predicted,
                    ?outcome,
                    "Persisted outcome diverged from prediction, reconciling"
                );
                book.stale = true;
            }
            Err(e) => {
                warn!(domain = self.domain.name(), ?action, error = %e, "Mutation failed, reconciling");
                book.stale = true;
                self.slice.send_modify(|slice| slice.error = Some(e));
            }
        }
    }

    /// Bring the slice back to Idle once no mutation is outstanding,
    /// reloading from the store first if it may have diverged.
    async fn settle(&self) -> Result<()> {
        {
            let book = lock(&self.book);
            if book.pending > 0 {
                // The last outstanding mutation settles the slice.
                return Ok(());
            }
            if !book.stale {
                self.slice.send_modify(|slice| {
                    slice.phase = SyncPhase::Idle;
                    slice.is_loading = false;
                });
                return Ok(());
            }
            self.slice.send_modify(|slice| {
                slice.phase = SyncPhase::Reconciling;
                slice.is_loading = true;
            });
        }

        let loaded = self.domain.load(&self.records).await;

        let mut book = lock(&self.book);
        match loaded {
            Ok(_) if book.pending > 0 => {
                debug!(domain = self.domain.name(), "Mutation arrived during reload, deferring");
                Ok(())
            }
            Ok(value) => {
                book.stale = false;
                self.slice.send_modify(|slice| {
                    slice.value = value;
                    slice.phase = SyncPhase::Idle;
                    slice.is_loading = false;
                });
                debug!(domain = self.domain.name(), "Slice reconciled");
                Ok(())
            }
            Err(e) => {
                warn!(domain = self.domain.name(), error = %e, "Reload failed");
                let idle = book.pending == 0;
                self.slice.send_modify(|slice| {
                    slice.error = Some(e.clone());
                    if idle {
                        slice.phase = SyncPhase::Idle;
                        slice.is_loading = false;
                    }
                });
                Err(e)
            }
        }
    }
}
