//! Dedicated worker thread for one participant transaction
//!
//! Resource and executor calls of a transaction run on its own named thread, so a local
//! resource transaction that is bound to a thread (e.g. a database connection) always
//! sees the same one. The thread is started on first use and torn down by [`TransactionWorker::close`].

use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{Result, TransactionError};
use crate::types::TransactionId;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum WorkerState {
    Idle,
    Running {
        sender: mpsc::Sender<Job>,
        handle: JoinHandle<()>,
    },
    Closed,
}

/// Handle to the single worker thread of a transaction
pub struct TransactionWorker {
    transaction_id: TransactionId,
    state: Mutex<WorkerState>,
}

impl TransactionWorker {
    pub fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            state: Mutex::new(WorkerState::Idle),
        }
    }

    /// Name of the worker thread
    pub fn thread_name(&self) -> String {
        format!("transaction-{}", self.transaction_id)
    }

    /// Run `action` on the worker thread and wait for its result
    pub fn run<R, F>(&self, action: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        let sender = self.sender()?;

        let (tx, rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            // The caller may have gone away; nothing to report then
            let _ = tx.send(action());
        });

        sender.send(job).map_err(|e| {
            TransactionError::Worker(format!(
                "Worker of transaction '{}' is not accepting work: {}",
                self.transaction_id, e
            ))
        })?;

        rx.recv().map_err(|e| {
            TransactionError::Worker(format!(
                "Worker of transaction '{}' stopped before answering: {}",
                self.transaction_id, e
            ))
        })?
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            WorkerState::Running { sender, .. } => return Ok(sender.clone()),
            WorkerState::Closed => {
                return Err(TransactionError::Worker(format!(
                    "Cannot execute a new action on transaction '{}' as it has been already closed",
                    self.transaction_id
                )));
            }
            WorkerState::Idle => {}
        }

        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(self.thread_name())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })?;

        *state = WorkerState::Running {
            sender: sender.clone(),
            handle,
        };
        Ok(sender)
    }

    /// Stop accepting work and wait for the thread to finish its queue
    pub fn close(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, WorkerState::Closed)
        };

        if let WorkerState::Running { sender, handle } = previous {
            drop(sender);
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::warn!(
                    "Worker of transaction '{}' panicked before shutdown",
                    self.transaction_id
                );
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            WorkerState::Closed
        )
    }
}

impl Drop for TransactionWorker {
    fn drop(&mut self) {
        // Dropping the sender lets the thread exit on its own
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        *state = WorkerState::Closed;
    }
}
