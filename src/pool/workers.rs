//! Fixed pool of worker threads consuming boxed tasks from a shared
//! channel. The reactor binds connection work into the tasks; dropping
//! the pool closes the channel, which is the shutdown signal, and
//! workers finish whatever is still queued before exiting.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use log::warn;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads sharing one task queue.
#[derive(Debug)]
pub struct ThreadPool {
    tasks: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `size` workers (at least one).
    pub fn new(size: usize) -> ThreadPool {
        let (tasks, queue) = unbounded::<Task>();
        let workers = (0..size.max(1))
            .map(|i| {
                let queue = queue.clone();
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || {
                        // recv fails only once the channel is closed and drained
                        while let Ok(task) = queue.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        ThreadPool {
            tasks: Some(tasks),
            workers,
        }
    }

    /// Enqueues a task; one idle worker wakes to run it.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(tasks) = &self.tasks {
            if tasks.send(Box::new(task)).is_err() {
                warn!("task dropped: worker pool is shut down");
            }
        }
    }

    /// Closes the queue and waits for every worker to drain and exit.
    pub fn join(&mut self) {
        self.tasks.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.join();
    }
}
