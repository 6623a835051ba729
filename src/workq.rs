//! Single-consumer work queue for write batching.
//!
//! Producers enqueue a registration and block until the consumer has applied
//! a batch containing it. The consumer takes the whole queue in one motion,
//! applies it as a single epoch, and wakes every producer in the batch.
//! Fairness is FIFO within a dequeued batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::server::{PutReply, PutReq, Server, ServerError};

/// One queued registration and its completion slot.
pub struct Work {
    uid: u64,
    pk: Vec<u8>,
    resp: Mutex<Option<Result<PutReply, ServerError>>>,
    done: AtomicBool,
}

/// The queue. One consumer, any number of producers.
pub struct WorkQ {
    queue: Mutex<Vec<Arc<Work>>>,
    cond_cli: Condvar,
    cond_worker: Condvar,
}

impl Default for WorkQ {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQ {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            cond_cli: Condvar::new(),
            cond_worker: Condvar::new(),
        }
    }

    /// Enqueue a registration and block until the consumer finishes the
    /// batch containing it.
    pub fn do_put(&self, uid: u64, pk: Vec<u8>) -> Result<PutReply, ServerError> {
        let work = Arc::new(Work {
            uid,
            pk,
            resp: Mutex::new(None),
            done: AtomicBool::new(false),
        });
        let mut queue = self.queue.lock();
        queue.push(Arc::clone(&work));
        self.cond_worker.notify_one();
        while !work.done.load(Ordering::Acquire) {
            self.cond_cli.wait(&mut queue);
        }
        drop(queue);
        let resp = work.resp.lock().take();
        // the consumer writes a response before marking the work done.
        resp.unwrap_or(Err(ServerError::Corrupt))
    }

    /// Take every queued item, blocking while the queue is empty.
    pub fn get(&self) -> Vec<Arc<Work>> {
        let mut queue = self.queue.lock();
        while queue.is_empty() {
            self.cond_worker.wait(&mut queue);
        }
        std::mem::take(&mut *queue)
    }

    /// Mark a served batch complete and wake its producers.
    pub fn finish(&self, batch: Vec<Arc<Work>>) {
        let queue = self.queue.lock();
        for work in &batch {
            work.done.store(true, Ordering::Release);
        }
        drop(queue);
        self.cond_cli.notify_all();
    }
}

/// Serve exactly one dequeued batch as one epoch.
pub fn serve_one_batch(server: &Server, wq: &WorkQ) {
    let batch = wq.get();
    let reqs = batch
        .iter()
        .map(|w| PutReq {
            uid: w.uid,
            pk: w.pk.clone(),
        })
        .collect();
    let replies = server.put_batch(reqs);
    for (work, reply) in batch.iter().zip(replies) {
        *work.resp.lock() = Some(reply);
    }
    wq.finish(batch);
}

/// Drain `wq` into `server` forever; each dequeued batch becomes one epoch.
pub fn run_batcher(server: &Server, wq: &WorkQ) -> ! {
    loop {
        serve_one_batch(server, wq);
    }
}
