use super::queue::FetchQueues;
use log::{debug, error};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Fixed set of worker threads draining a [`FetchQueues`].
pub struct FetcherPool<T: Send + 'static> {
    queues: Arc<FetchQueues<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> FetcherPool<T> {
    /// Starts `num_threads` workers. `run` returns whether the task published new data,
    /// in which case the worker pings `repaint`.
    pub fn start<F>(num_threads: usize, queues: Arc<FetchQueues<T>>, run: F, repaint: Option<Sender<()>>) -> Self
    where
        F: Fn(T) -> bool + Send + Sync + 'static,
    {
        let run = Arc::new(run);
        let workers = (0..num_threads.max(1))
            .filter_map(|i| {
                let queues = queues.clone();
                let run = run.clone();
                let repaint = repaint.clone();
                let spawned = thread::Builder::new()
                    .name(format!("cell-fetcher-{}", i))
                    .spawn(move || {
                        while let Some(task) = queues.take() {
                            match catch_unwind(AssertUnwindSafe(|| run(task))) {
                                Ok(true) => {
                                    if let Some(repaint) = &repaint {
                                        let _ = repaint.send(());
                                    }
                                }
                                Ok(false) => {}
                                Err(_) => error!("Fetch task panicked"),
                            }
                        }
                        debug!("Fetcher {} stopped", i);
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        error!("Failed to start fetcher thread {}: {}", i, e);
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        debug!("Started {} fetcher threads", workers.len());
        Self { queues, workers }
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Lets every worker finish its current task, then joins them. Queued tasks are not run.
    pub fn shutdown(&mut self) {
        self.queues.shutdown();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Fetcher thread panicked");
            }
        }
    }
}

impl<T: Send + 'static> Drop for FetcherPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
