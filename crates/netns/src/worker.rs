// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use slog::{debug, error, Logger};

use crate::{
    ensure_namespace, EnsureOutcome, NamespaceOps, NamespaceRequest,
    NetnsError,
};

type Job = Box<dyn FnOnce(&dyn NamespaceOps) + Send>;

/// Runs namespace operations on one dedicated OS thread.
///
/// Jobs are executed strictly in submission order, and nothing but namespace
/// jobs ever runs on the worker thread, so a namespace switch in progress is
/// never visible to unrelated work.
pub struct NamespaceWorker {
    tx: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
    log: Logger,
}

impl NamespaceWorker {
    pub fn spawn(
        ops: Box<dyn NamespaceOps>,
        log: Logger,
    ) -> Result<Self, NetnsError> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let thread_log = log.clone();
        let thread = std::thread::Builder::new()
            .name("netns-worker".to_owned())
            .spawn(move || worker_loop(ops, rx, thread_log))
            .map_err(|source| NetnsError::Os {
                op: "spawn namespace worker",
                source,
            })?;

        Ok(Self { tx: Some(tx), thread: Some(thread), log })
    }

    /// Ensures the requested namespace exists, waiting for the worker to
    /// finish the job.
    pub fn ensure(
        &self,
        req: NamespaceRequest,
    ) -> Result<EnsureOutcome, NetnsError> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let log = self.log.clone();
        let job: Job = Box::new(move |ops| {
            let _ = done_tx.send(ensure_namespace(ops, &log, &req));
        });

        self.tx
            .as_ref()
            .ok_or(NetnsError::WorkerGone)?
            .send(job)
            .map_err(|_| NetnsError::WorkerGone)?;
        done_rx.recv().map_err(|_| NetnsError::WorkerGone)?
    }
}

fn worker_loop(ops: Box<dyn NamespaceOps>, rx: Receiver<Job>, log: Logger) {
    debug!(log, "namespace worker started");
    while let Ok(job) = rx.recv() {
        job(ops.as_ref());
    }
    debug!(log, "namespace worker exiting");
}

impl Drop for NamespaceWorker {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(self.log, "namespace worker panicked");
            }
        }
    }
}
