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

//! Worker threads and their event loops.
//!
//! Each worker owns a poller, a connection table, and an expiry queue, and
//! multiplexes every connection assigned to it on a single thread. The loop
//! waits with the expiry queue's deadline: readiness events resume the
//! affected coroutines and refresh their queue position, while a quiescent
//! interval advances the reaper instead. Acceptors never touch a worker's
//! state directly; they push accepted streams onto the worker's lock-free
//! inbox and nudge its waker, and the worker installs them from its own
//! thread.
//!
//! Interest management follows the coroutine's yields. Connections normally
//! sit in read interest; only while a coroutine is blocked mid-write does
//! the worker flip the registration to write interest, flipping back as soon
//! as reads are wanted again. No registration change is issued when the
//! desired interest already matches the installed one.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

use crossbeam_queue::ArrayQueue;
use mio::event::Source;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::connection::{ConnFlags, Connection};
use crate::coro::ConnCoro;
use crate::date::DateCache;
use crate::death_queue::DeathQueue;
use crate::request::{Processor, Yield};

/// Token reserved for the cross-thread waker; connection tokens are table
/// keys.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Hard cap on events drained per poll, regardless of `max_fd`.
const MAX_EVENTS: usize = 1024;

/// Acceptor-facing handle to one worker thread.
///
/// Hand-off is a push onto the worker's bounded queue followed by a nudge;
/// pushes may be batched under a single nudge. A nudge with an empty queue
/// is benign.
#[derive(Debug)]
pub struct WorkerHandle<S = TcpStream> {
    inbox: Arc<ArrayQueue<S>>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    pub(crate) thread: Option<JoinHandle<()>>,
}

impl<S> WorkerHandle<S> {
    /// Queues an accepted stream for this worker; pair with
    /// [`nudge`](WorkerHandle::nudge).
    ///
    /// Returns `false` if the worker's queue is full, in which case the
    /// stream has been dropped (closing it) and the acceptor should shed
    /// load.
    pub fn add_client(&self, stream: S) -> bool {
        if self.inbox.push(stream).is_err() {
            warn!("worker inbox full; dropping accepted connection");
            return false;
        }
        true
    }

    /// Wakes the worker's event loop.
    pub fn nudge(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(error = %err, "failed to nudge worker");
        }
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.nudge();
    }
}

/// One worker: a poller, the connections it owns, and their expiry queue.
pub(crate) struct Worker<S, P> {
    poll: Poll,
    table: Slab<Connection<S>>,
    death_queue: DeathQueue,
    date_cache: DateCache,
    inbox: Arc<ArrayQueue<S>>,
    shutdown: Arc<AtomicBool>,
    barrier: Arc<Barrier>,
    processor: Arc<P>,
    config: Config,
}

impl<S, P> Worker<S, P>
where
    S: Read + Write + Source + Send + 'static,
    P: Processor<S>,
{
    pub(crate) fn new(
        config: Config,
        processor: Arc<P>,
        barrier: Arc<Barrier>,
    ) -> io::Result<(Self, WorkerHandle<S>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let inbox = Arc::new(ArrayQueue::new(config.max_fd.max(1)));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = Self {
            poll,
            table: Slab::new(),
            death_queue: DeathQueue::new(config.keep_alive_timeout),
            date_cache: DateCache::new(config.expires),
            inbox: inbox.clone(),
            shutdown: shutdown.clone(),
            barrier,
            processor,
            config,
        };
        let handle = WorkerHandle {
            inbox,
            waker,
            shutdown,
            thread: None,
        };

        Ok((worker, handle))
    }

    /// The worker's event loop. Runs until shutdown, then destroys whatever
    /// connections remain.
    pub(crate) fn run(mut self) {
        self.barrier.wait();

        let mut events = Events::with_capacity(self.config.max_fd.clamp(1, MAX_EVENTS));
        loop {
            match self.poll.poll(&mut events, self.death_queue.poll_timeout()) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => match err.raw_os_error() {
                    Some(libc::EBADF) | Some(libc::EINVAL) => break,
                    _ => {
                        warn!(error = %err, "poll failed");
                        continue;
                    }
                },
            }

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            if events.is_empty() {
                self.reap();
                continue;
            }

            self.date_cache.refresh();
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    self.drain_inbox();
                    continue;
                }

                let key = event.token().0;
                if !self.table.contains(key) {
                    // Destroyed earlier in this batch.
                    continue;
                }
                if event.is_error() || event.is_read_closed() {
                    trace!(key, "peer hung up");
                    self.destroy(key);
                    continue;
                }

                self.resume_if_needed(key);
                if self.table.contains(key) {
                    self.death_queue.move_to_tail(&mut self.table, key);
                }
            }
        }

        self.barrier.wait();
        let keys: Vec<usize> = self.table.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.destroy(key);
        }
    }

    /// Installs every stream the acceptor queued since the last nudge.
    fn drain_inbox(&mut self) {
        while let Some(stream) = self.inbox.pop() {
            self.install(stream);
        }
    }

    /// Activates an accepted stream: registers read interest, spawns the
    /// coroutine, queues the connection for expiry, and resumes immediately
    /// so parsing can start without waiting for another readiness event.
    fn install(&mut self, mut stream: S) {
        let coro = match ConnCoro::new(&self.config) {
            Ok(coro) => coro,
            Err(err) => {
                error!(error = %err, "response buffer allocation failed; dropping connection");
                return;
            }
        };

        let entry = self.table.vacant_entry();
        let token = Token(entry.key());
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            warn!(error = %err, "failed to register accepted connection");
            return;
        }

        let mut conn = Connection::new(stream);
        conn.coro = Some(coro);
        conn.flags = ConnFlags::IS_ALIVE | ConnFlags::KEEP_ALIVE | ConnFlags::SHOULD_RESUME_CORO;
        let key = token.0;
        entry.insert(conn);

        self.death_queue.insert(&mut self.table, key);
        trace!(key, "connection installed");
        self.resume_if_needed(key);
    }

    /// Resumes a connection's coroutine if it expects resumption, then
    /// reconciles poller interest with what the coroutine asked for.
    ///
    /// `MayResume` without a forced read means the coroutine can make
    /// progress right away (the next pipelined request, or a retried write);
    /// edge-triggered polling will never wake us for that, so the loop
    /// resumes again in place until the coroutine actually blocks. At that
    /// point the resume flag is reconciled: a mid-cycle wait or a keep-alive
    /// lull expects an event, while a connection whose keep-alive was
    /// withdrawn only awaits the reaper.
    fn resume_if_needed(&mut self, key: usize) {
        loop {
            let conn = &mut self.table[key];
            if !conn.flags.contains(ConnFlags::SHOULD_RESUME_CORO) {
                return;
            }
            let Connection {
                stream,
                coro,
                flags,
                ..
            } = conn;
            let Some(coro) = coro.as_mut() else { return };

            let outcome = coro.resume(self.processor.as_ref(), stream, flags, &self.date_cache);
            if outcome < Yield::MayResume {
                trace!(key, "coroutine aborted");
                self.destroy(key);
                return;
            }
            if outcome == Yield::MayResume && !flags.contains(ConnFlags::MUST_READ) {
                continue;
            }

            if coro.in_flight() || flags.contains(ConnFlags::KEEP_ALIVE) {
                flags.insert(ConnFlags::SHOULD_RESUME_CORO);
            } else {
                flags.remove(ConnFlags::SHOULD_RESUME_CORO);
            }

            let desired_write =
                !flags.contains(ConnFlags::MUST_READ) && outcome == Yield::WantWrite;
            if desired_write == flags.contains(ConnFlags::WRITE_EVENTS) {
                return;
            }

            let interest = if desired_write {
                Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            match self.poll.registry().reregister(stream, Token(key), interest) {
                Ok(()) => flags.toggle(ConnFlags::WRITE_EVENTS),
                Err(err) => {
                    // Interest stays stale; the expiry queue will recycle the
                    // connection if no matching event ever arrives.
                    warn!(key, error = %err, "failed to update poller interest");
                }
            }
            return;
        }
    }

    /// Reaper pass, run only after a quiescent interval: advance the clock,
    /// collect everything past its deadline, and restart the clock once the
    /// queue drains.
    fn reap(&mut self) {
        self.death_queue.advance();
        while let Some(key) = self.death_queue.expired(&self.table) {
            trace!(key, "idle timeout");
            self.destroy(key);
        }
        if self.death_queue.is_empty() {
            self.death_queue.reset();
        }
    }

    /// Tears a connection down: unlink, deregister, and drop the slot.
    /// Dropping runs the coroutine's remaining deferred cleanups and closes
    /// the socket.
    fn destroy(&mut self, key: usize) {
        if !self.table.contains(key) {
            return;
        }
        self.death_queue.remove(&mut self.table, key);

        let mut conn = self.table.remove(key);
        conn.flags.remove(ConnFlags::IS_ALIVE);
        if let Err(err) = self.poll.registry().deregister(&mut conn.stream) {
            debug!(key, error = %err, "failed to deregister connection");
        }
        trace!(key, "connection destroyed");
    }
}
