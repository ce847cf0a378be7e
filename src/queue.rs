// src/queue.rs
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::H256;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::BundlerError;
use crate::types::UserOperation;

/// A user operation admitted for submission.
#[derive(Debug, Clone)]
pub struct SubmissionJob {
    pub op: UserOperation,
    pub hash: H256,
    /// Milliseconds since the unix epoch.
    pub enqueued_at: u64,
    pub caller: String,
    pub request_id: String,
}

/// Runs a dequeued job to completion. Errors stay inside the processor.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, job: SubmissionJob);
}

pub type DepthCallback = Box<dyn Fn(usize) + Send + Sync>;

struct State {
    queued: Vec<SubmissionJob>,
    active: usize,
}

struct Inner<P> {
    processor: Arc<P>,
    max_size: usize,
    concurrency: usize,
    state: Mutex<State>,
    on_depth: Option<DepthCallback>,
}

/// Bounded queue feeding at most `concurrency` jobs to the processor at once.
///
/// Depth counts queued plus in-flight jobs. The next job is the one enqueued
/// earliest; equal timestamps go to the higher `maxPriorityFeePerGas`.
pub struct WorkQueue<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for WorkQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: JobProcessor> WorkQueue<P> {
    pub fn new(processor: Arc<P>, max_size: usize, concurrency: usize) -> Self {
        Self::with_depth_callback(processor, max_size, concurrency, None)
    }

    pub fn with_depth_callback(
        processor: Arc<P>,
        max_size: usize,
        concurrency: usize,
        on_depth: Option<DepthCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                processor,
                max_size,
                concurrency: concurrency.max(1),
                state: Mutex::new(State {
                    queued: Vec::new(),
                    active: 0,
                }),
                on_depth,
            }),
        }
    }

    pub fn enqueue(&self, job: SubmissionJob) -> Result<(), BundlerError> {
        let depth = {
            let mut state = self.inner.state.lock();
            if state.queued.len() + state.active >= self.inner.max_size {
                return Err(BundlerError::QueueFull);
            }
            debug!(hash = ?job.hash, request_id = %job.request_id, "enqueued user operation");
            state.queued.push(job);
            state.queued.len() + state.active
        };
        self.inner.report_depth(depth);
        self.inner.pump();
        Ok(())
    }

    pub fn depth(&self) -> usize {
        let state = self.inner.state.lock();
        state.queued.len() + state.active
    }
}

impl<P> Inner<P> {
    fn report_depth(&self, depth: usize) {
        if let Some(cb) = &self.on_depth {
            cb(depth);
        }
    }
}

fn select_next(queued: &[SubmissionJob]) -> Option<usize> {
    queued
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.enqueued_at.cmp(&b.enqueued_at).then(
                b.op.max_priority_fee_per_gas
                    .cmp(&a.op.max_priority_fee_per_gas),
            )
        })
        .map(|(i, _)| i)
}

impl<P: JobProcessor> Inner<P> {
    fn pump(self: &Arc<Self>) {
        loop {
            let (job, depth) = {
                let mut state = self.state.lock();
                if state.active >= self.concurrency {
                    return;
                }
                let Some(index) = select_next(&state.queued) else {
                    return;
                };
                let job = state.queued.remove(index);
                state.active += 1;
                (job, state.queued.len() + state.active)
            };
            self.report_depth(depth);

            let inner = self.clone();
            tokio::spawn(async move {
                let hash = job.hash;
                let processor = inner.processor.clone();
                // a panicking job must not leak its worker slot
                if let Err(e) = tokio::spawn(async move { processor.process(job).await }).await {
                    error!(?hash, error = %e, "job processing aborted");
                }
                let depth = {
                    let mut state = inner.state.lock();
                    state.active -= 1;
                    state.queued.len() + state.active
                };
                inner.report_depth(depth);
                inner.pump();
            });
        }
    }
}
