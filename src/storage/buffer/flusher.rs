//! Background flush threads.
//!
//! `flush_all` drops the identities of dirty pages into an ordered set;
//! flush threads claim runs of physically adjacent pages from it, write
//! them, and report back. Checkpoint requests are answered once both the
//! pending set and the in-flight set are empty.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use crate::common::types::{PageId, TxnId};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::manager::BufferCache;

type CheckpointResult = Result<u64, String>;

/// Handle on an outstanding `flush_all` request
pub struct CheckpointWaiter {
    token: u64,
    receiver: Receiver<CheckpointResult>,
}

impl CheckpointWaiter {
    pub(crate) fn completed(token: u64, result: CheckpointResult) -> Self {
        let (sender, receiver) = channel::bounded(1);
        let _ = sender.send(result);
        Self { token, receiver }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Block until every page scheduled by the request has been written
    pub fn wait(self, timeout: Duration) -> Result<u64, BufferPoolError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(message)) => Err(BufferPoolError::FlushFailed(message)),
            Err(_) => Err(BufferPoolError::FlushFailed(format!(
                "checkpoint {} did not complete within {:?}",
                self.token, timeout
            ))),
        }
    }
}

/// Outcome of asking the queue for work
pub(crate) enum Claim {
    Run(Vec<PageId>),
    Idle,
    Shutdown,
}

#[derive(Default)]
struct FlushState {
    pending: BTreeSet<PageId>,
    in_flight: usize,
    /// Transactions waiting on each queued or in-flight page
    page_txns: HashMap<PageId, Vec<TxnId>>,
    txn_pages: HashMap<TxnId, usize>,
    checkpoints: Vec<(u64, Sender<CheckpointResult>)>,
    failure: Option<String>,
    shutdown: bool,
}

impl FlushState {
    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight == 0
    }

    fn track(&mut self, page: PageId, txn: TxnId) {
        let owners = self.page_txns.entry(page).or_default();
        if !owners.contains(&txn) {
            owners.push(txn);
            *self.txn_pages.entry(txn).or_insert(0) += 1;
        }
    }

    fn forget_page(&mut self, page: PageId) {
        for txn in self.page_txns.remove(&page).unwrap_or_default() {
            if let Some(count) = self.txn_pages.get_mut(&txn) {
                *count -= 1;
                if *count == 0 {
                    self.txn_pages.remove(&txn);
                }
            }
        }
    }

    fn answer_checkpoints(&mut self) {
        let result = match self.failure.take() {
            Some(message) => Err(message),
            None => Ok(()),
        };
        for (token, sender) in self.checkpoints.drain(..) {
            let _ = sender.send(result.clone().map(|_| token));
        }
    }
}

pub(crate) struct FlushQueue {
    state: Mutex<FlushState>,
    work_ready: Condvar,
    progress: Condvar,
}

impl FlushQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlushState::default()),
            work_ready: Condvar::new(),
            progress: Condvar::new(),
        }
    }

    /// Queue pages (with the transaction that last dirtied each) and
    /// optionally attach a checkpoint request.
    pub fn schedule(&self, pages: &[(PageId, TxnId)], checkpoint: Option<u64>) -> Option<CheckpointWaiter> {
        let mut state = self.state.lock();
        for &(page, txn) in pages {
            // A page re-queued while in flight keeps its earlier owners
            // until the write that follows completes
            state.pending.insert(page);
            state.track(page, txn);
        }

        let waiter = checkpoint.map(|token| {
            let (sender, receiver) = channel::bounded(1);
            state.checkpoints.push((token, sender));
            CheckpointWaiter { token, receiver }
        });

        if state.is_drained() {
            state.answer_checkpoints();
        }
        drop(state);
        self.work_ready.notify_all();
        waiter
    }

    /// Wait for work and claim up to `limit` adjacent pages
    pub fn claim_run(&self, limit: usize, idle_after: Option<Duration>) -> Claim {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Claim::Shutdown;
            }
            if let Some(&first) = state.pending.iter().next() {
                let mut run = vec![first];
                state.pending.remove(&first);
                while run.len() < limit {
                    let last = run[run.len() - 1];
                    let next = PageId::new(last.tablespace, last.page_number.wrapping_add(1));
                    if next.page_number == 0 || !state.pending.remove(&next) {
                        break;
                    }
                    run.push(next);
                }
                state.in_flight += run.len();
                return Claim::Run(run);
            }
            match idle_after {
                Some(timeout) => {
                    if self.work_ready.wait_for(&mut state, timeout).timed_out() && state.pending.is_empty() {
                        return if state.shutdown { Claim::Shutdown } else { Claim::Idle };
                    }
                }
                None => self.work_ready.wait(&mut state),
            }
        }
    }

    /// Report a claimed run as finished. `requeue` pages go back into the
    /// pending set; `failure` is reported to waiting checkpoints.
    pub fn complete(&self, run: &[PageId], requeue: &[PageId], failure: Option<String>) {
        let mut state = self.state.lock();
        state.in_flight -= run.len();
        for &page in run {
            if requeue.contains(&page) {
                state.pending.insert(page);
            } else if !state.pending.contains(&page) {
                state.forget_page(page);
            }
        }
        if failure.is_some() {
            state.failure = failure;
        }
        if state.is_drained() {
            state.answer_checkpoints();
        }
        drop(state);
        self.progress.notify_all();
        if !requeue.is_empty() {
            self.work_ready.notify_one();
        }
    }

    /// Block until no page dirtied by `txn` is queued or being written
    pub fn wait_for_txn(&self, txn: TxnId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.txn_pages.contains_key(&txn) {
            if self.progress.wait_until(&mut state, deadline).timed_out() {
                return !state.txn_pages.contains_key(&txn);
            }
        }
        true
    }

    pub fn has_pending_writes(&self, txn: TxnId) -> bool {
        self.state.lock().txn_pages.contains_key(&txn)
    }

    pub fn pending_len(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.in_flight
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.answer_checkpoints();
        drop(state);
        self.work_ready.notify_all();
        self.progress.notify_all();
    }
}

pub(crate) fn spawn_flusher(
    cache: Weak<BufferCache>,
    queue: Arc<FlushQueue>,
    index: usize,
    run_limit: usize,
    idle_after: Option<Duration>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("tundra-flush-{}", index))
        .spawn(move || {
            info!("Flush thread {} started", index);
            loop {
                match queue.claim_run(run_limit, idle_after) {
                    Claim::Shutdown => break,
                    Claim::Idle => {
                        let Some(cache) = cache.upgrade() else { break };
                        cache.schedule_stale_pages();
                    }
                    Claim::Run(run) => {
                        let Some(cache) = cache.upgrade() else {
                            queue.complete(&run, &[], None);
                            break;
                        };
                        debug!("Flush thread {} writing {} page(s) from {}", index, run.len(), run[0]);
                        let outcome = cache.flush_run(&run);
                        if let Some(message) = &outcome.failure {
                            error!("Flush thread {}: {}", index, message);
                        }
                        queue.complete(&run, &outcome.requeue, outcome.failure);
                    }
                }
            }
            info!("Flush thread {} stopped", index);
        })
}

/// What a flush thread learned while writing one run
#[derive(Debug, Default)]
pub(crate) struct RunOutcome {
    pub requeue: Vec<PageId>,
    pub failure: Option<String>,
}
