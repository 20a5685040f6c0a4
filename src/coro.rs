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

//! Cooperative per-connection coroutine driver.
//!
//! Each active connection owns a [`ConnCoro`]: the linear request loop of
//! the connection, expressed as a resumable state machine. A resume either
//! starts a fresh request cycle or continues the in-flight one; the cycle's
//! [`Job`] runs until it suspends on I/O or completes. Completion runs the
//! cleanups registered during the cycle, records the pipelining cursor, and
//! yields [`Yield::MayResume`] back to the worker.
//!
//! Buffers live in the coroutine rather than the cycle: the response buffer
//! is allocated once per connection and reset between cycles, and the read
//! buffer persists so a pipelined cursor from one cycle still points at
//! valid bytes in the next.

use std::collections::TryReserveError;
use std::fmt;
use std::mem;

use crate::config::Config;
use crate::connection::ConnFlags;
use crate::date::DateCache;
use crate::request::{Flow, Job, Processor, Request, RequestFlags, Yield};

/// Response buffers start at this size and only grow when a handler outruns
/// it.
const RESPONSE_BUFFER_SIZE: usize = 4 * 1024;

/// Cleanup closures registered by request handlers, run newest-first.
///
/// The current length doubles as a generation marker: snapshotting it before
/// a request cycle and running [`run_from`](Deferred::run_from) afterwards
/// releases the cycle's resources without touching registrations from
/// enclosing scopes. Dropping the registry runs whatever remains.
pub(crate) struct Deferred {
    cleanups: Vec<Box<dyn FnOnce() + Send>>,
}

impl Deferred {
    pub(crate) fn new() -> Self {
        Self {
            cleanups: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, cleanup: Box<dyn FnOnce() + Send>) {
        self.cleanups.push(cleanup);
    }

    #[inline]
    pub(crate) fn generation(&self) -> usize {
        self.cleanups.len()
    }

    /// Runs every cleanup registered at or after `generation`, newest first.
    pub(crate) fn run_from(&mut self, generation: usize) {
        if generation >= self.cleanups.len() {
            return;
        }
        for cleanup in self.cleanups.split_off(generation).into_iter().rev() {
            cleanup();
        }
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        for cleanup in self.cleanups.drain(..).rev() {
            cleanup();
        }
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("pending", &self.cleanups.len())
            .finish()
    }
}

enum State<S> {
    /// Waiting for the next request cycle to start.
    Between,
    /// A request cycle is in flight; `checkpoint` is the deferred-cleanup
    /// generation snapshotted when it began.
    InFlight {
        job: Box<dyn Job<S>>,
        checkpoint: usize,
    },
}

/// The request loop of one connection.
pub(crate) struct ConnCoro<S> {
    state: State<S>,
    cursor: Option<usize>,
    read_buf: Vec<u8>,
    response: Vec<u8>,
    base_flags: RequestFlags,
    req_flags: RequestFlags,
    deferred: Deferred,
}

impl<S: 'static> ConnCoro<S> {
    /// Builds the coroutine and its response buffer. Failure to allocate the
    /// buffer is reported rather than aborting the process; the caller drops
    /// the connection.
    pub(crate) fn new(config: &Config) -> Result<Self, TryReserveError> {
        let mut response = Vec::new();
        response.try_reserve_exact(RESPONSE_BUFFER_SIZE)?;

        let mut base_flags = RequestFlags::empty();
        if config.proxy_protocol {
            base_flags |= RequestFlags::ALLOW_PROXY_REQS;
        }
        if config.allow_cors {
            base_flags |= RequestFlags::ALLOW_CORS;
        }

        Ok(Self {
            state: State::Between,
            cursor: None,
            read_buf: Vec::new(),
            response,
            base_flags,
            req_flags: base_flags,
            deferred: Deferred::new(),
        })
    }

    /// Whether a request cycle is suspended mid-flight, as opposed to the
    /// loop sitting between cycles.
    #[inline]
    pub(crate) fn in_flight(&self) -> bool {
        matches!(self.state, State::InFlight { .. })
    }

    /// Resumes the request loop: continues the in-flight cycle, or begins a
    /// new one with the response buffer reset and only the carried flags
    /// surviving from the previous cycle.
    ///
    /// A connection whose keep-alive was withdrawn gets no further cycles;
    /// once the current one ends, resuming yields [`Yield::Abort`] so the
    /// worker tears the connection down instead of waiting for a request
    /// that will never come.
    pub(crate) fn resume(
        &mut self,
        processor: &dyn Processor<S>,
        stream: &mut S,
        conn_flags: &mut ConnFlags,
        date: &DateCache,
    ) -> Yield {
        if matches!(self.state, State::Between) {
            if !conn_flags.contains(ConnFlags::KEEP_ALIVE) {
                return Yield::Abort;
            }
            self.response.clear();
            self.req_flags = self.base_flags | (self.req_flags & RequestFlags::CARRIED);
            self.state = State::InFlight {
                job: processor.begin(),
                checkpoint: self.deferred.generation(),
            };
        }

        let (mut job, checkpoint) = match mem::replace(&mut self.state, State::Between) {
            State::InFlight { job, checkpoint } => (job, checkpoint),
            State::Between => return Yield::Abort,
        };

        let flow = job.poll(&mut Request {
            stream,
            read_buf: &mut self.read_buf,
            response: &mut self.response,
            conn_flags,
            req_flags: &mut self.req_flags,
            cursor: self.cursor,
            date,
            deferred: &mut self.deferred,
        });

        match flow {
            Flow::Yield(outcome) => {
                if outcome > Yield::Abort {
                    self.state = State::InFlight { job, checkpoint };
                }
                outcome
            }
            Flow::Done(next) => {
                self.deferred.run_from(checkpoint);
                self.cursor = next;
                Yield::MayResume
            }
        }
    }
}
