use std::any::Any;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::ripper::post::Post;
use crate::ripper::MediaKind;

/// One post to download into a site's directory.
#[derive(Debug)]
pub(crate) struct WorkItem {
    pub(crate) kind: MediaKind,
    pub(crate) post: Post,
    pub(crate) site: String,
    pub(crate) destination: PathBuf,
}

/// Count of enqueued items that have not finished processing yet.
#[derive(Default)]
struct Outstanding {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Outstanding {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }
}

/// Marks an item finished however its handler exits.
struct CompletionGuard<'a>(&'a Outstanding);

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

/// Fixed set of long-lived worker threads fed from one shared queue. Every
/// item is delivered to exactly one worker.
pub(crate) struct WorkerPool {
    sender: Option<Sender<WorkItem>>,
    outstanding: Arc<Outstanding>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers that pass every dequeued item to `handler`.
    pub(crate) fn new<H>(threads: usize, handler: H) -> io::Result<Self>
    where
        H: Fn(WorkItem) + Send + Sync + 'static,
    {
        let threads = threads.max(1);
        let (sender, receiver) = flume::unbounded();
        let outstanding = Arc::new(Outstanding::default());
        let handler = Arc::new(handler);

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let outstanding = outstanding.clone();
            let handler = handler.clone();
            let worker = thread::Builder::new()
                .name(format!("download-worker-{}", index))
                .spawn(move || run_worker(index, receiver, outstanding, handler))?;
            workers.push(worker);
        }

        trace!("Started {} download workers", threads);
        Ok(WorkerPool {
            sender: Some(sender),
            outstanding,
            workers,
        })
    }

    /// Queues an item. Never blocks.
    pub(crate) fn enqueue(&self, item: WorkItem) {
        let Some(sender) = &self.sender else {
            warn!("Worker pool is shut down, dropping item for {}", item.site);
            return;
        };

        self.outstanding.increment();
        if let Err(e) = sender.send(item) {
            self.outstanding.decrement();
            warn!("Worker pool is shut down, dropping item for {}", e.into_inner().site);
        }
    }

    /// Items enqueued but not yet processed.
    pub(crate) fn outstanding(&self) -> usize {
        *self.outstanding.count.lock()
    }

    /// Blocks until every enqueued item has been processed.
    pub(crate) fn wait_until_drained(&self) {
        let mut count = self.outstanding.count.lock();
        while *count > 0 {
            self.outstanding.drained.wait(&mut count);
        }
    }

    /// Blocks until the queue drains or `timeout` elapses and returns the
    /// number of items still outstanding.
    pub(crate) fn wait_for(&self, timeout: Duration) -> usize {
        let mut count = self.outstanding.count.lock();
        if *count > 0 {
            self.outstanding.drained.wait_for(&mut count, timeout);
        }
        *count
    }

    /// Closes the queue and joins every worker once the remaining items are done.
    pub(crate) fn shutdown(&mut self) {
        if self.sender.take().is_none() {
            return;
        }

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("A download worker exited abnormally");
            }
        }
        trace!("Download workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<H>(index: usize, receiver: Receiver<WorkItem>, outstanding: Arc<Outstanding>, handler: Arc<H>)
where
    H: Fn(WorkItem) + Send + Sync + 'static,
{
    while let Ok(item) = receiver.recv() {
        let _guard = CompletionGuard(&outstanding);
        let site = item.site.clone();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(item))) {
            error!(
                "Worker {} panicked while processing an item for {}: {}",
                index,
                site,
                panic_message(panic.as_ref())
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
