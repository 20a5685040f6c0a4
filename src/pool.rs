// Copyright 2023 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Worker pool construction, scheduling, and shutdown

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use mio::event::Source;
use mio::net::TcpStream;
use tracing::debug;

use crate::config::Config;
use crate::request::Processor;
use crate::worker::{Worker, WorkerHandle};

/// A fixed pool of worker event loops.
///
/// [`new`](Reactor::new) spawns every worker and returns once they are all
/// ready to take hand-offs; [`shutdown`](Reactor::shutdown) is the only
/// graceful exit and destroys whatever connections are still live. Dropping
/// a reactor without shutting it down detaches the worker threads.
#[derive(Debug)]
pub struct Reactor<S = TcpStream> {
    workers: Vec<WorkerHandle<S>>,
    barrier: Arc<Barrier>,
    next_worker: AtomicUsize,
}

impl<S> Reactor<S>
where
    S: Read + Write + Source + Send + 'static,
{
    /// Creates the pool and blocks until every worker's event loop is ready
    /// to accept hand-offs.
    ///
    /// # Panics
    ///
    /// Panics if an OS thread cannot be spawned; every other setup failure
    /// surfaces as an [`io::Error`].
    pub fn new<P>(config: Config, processor: P) -> io::Result<Self>
    where
        P: Processor<S>,
    {
        let thread_count = config.thread_count.max(1);
        let processor = Arc::new(processor);
        let barrier = Arc::new(Barrier::new(thread_count + 1));
        let mut workers = Vec::with_capacity(thread_count);

        for index in 0..thread_count {
            let (worker, mut handle) =
                Worker::new(config.clone(), processor.clone(), barrier.clone())?;
            let thread = thread::Builder::new()
                .name(format!("ember-worker-{index}"))
                .spawn(move || worker.run())
                .expect("failed to spawn worker thread");
            handle.thread = Some(thread);
            workers.push(handle);
        }

        barrier.wait();
        debug!(thread_count, "reactor ready");

        Ok(Self {
            workers,
            barrier,
            next_worker: AtomicUsize::new(0),
        })
    }

    /// Handles to the individual workers, for acceptors that schedule
    /// themselves.
    pub fn workers(&self) -> &[WorkerHandle<S>] {
        &self.workers
    }

    /// Hands an accepted stream to the next worker, round robin, and nudges
    /// it. Returns `false` if that worker's queue was full; the stream has
    /// been closed in that case.
    pub fn assign(&self, stream: S) -> bool {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[index];
        if worker.add_client(stream) {
            worker.nudge();
            true
        } else {
            false
        }
    }

    /// Stops every worker: each exits its loop, rendezvous on the barrier,
    /// destroys its remaining connections, and is joined.
    pub fn shutdown(mut self) {
        for worker in &self.workers {
            worker.begin_shutdown();
        }
        self.barrier.wait();
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    debug!("worker thread panicked during shutdown");
                }
            }
        }
    }
}
