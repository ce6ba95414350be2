//! # Owning Execution Context
//!
//! A dedicated thread that drains a task channel, standing in for the host's
//! world thread when the host doesn't provide one.

use crate::host::{OwningContext, Task};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error};

/// Single-threaded executor implementing [`OwningContext`].
pub struct WorkerContext {
    sender: Mutex<Option<Sender<Task>>>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerContext {
    /// Start the worker thread.
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<Task>();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_tasks(receiver))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread_id: join.thread().id(),
            join: Mutex::new(Some(join)),
        })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Stop accepting work, let queued tasks finish, and join the thread.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(join) = self.join.lock().take() {
            if join.thread().id() == thread::current().id() {
                return;
            }
            if join.join().is_err() {
                error!("owning context thread terminated by panic");
            }
        }
    }
}

fn run_tasks(receiver: Receiver<Task>) {
    for task in receiver {
        // A panicking task must not take the owning thread down with it.
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
            let err = crate::error::ReconcileError::from_panic(payload);
            error!(error = %err, "task on owning context panicked");
        }
    }
    debug!("owning context drained and stopped");
}

impl OwningContext for WorkerContext {
    fn submit(&self, task: Task) -> Result<(), Task> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(task).map_err(|rejected| rejected.0),
            None => Err(task),
        }
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
