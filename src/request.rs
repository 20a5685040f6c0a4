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

//! The seam between the reactor and protocol logic.
//!
//! The reactor knows nothing about HTTP. A [`Processor`] supplies one
//! [`Job`] per request cycle, and every time a connection's coroutine is
//! resumed the worker polls the in-flight job with a [`Request`] context.
//! Jobs read and write the socket without blocking, yielding a [`Yield`]
//! outcome whenever the kernel pushes back.

use std::fmt;
use std::io::{self, Read, Write};

use mio::net::TcpStream;

use crate::connection::ConnFlags;
use crate::coro::Deferred;
use crate::date::DateCache;

bitflags::bitflags! {
    /// Flags describing one request cycle.
    ///
    /// All bits reset between cycles except [`PROXIED`] and [`ALLOW_CORS`],
    /// which carry over to subsequent requests on the same connection.
    ///
    /// [`PROXIED`]: RequestFlags::PROXIED
    /// [`ALLOW_CORS`]: RequestFlags::ALLOW_CORS
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u8 {
        /// PROXY protocol preambles are trusted for this request.
        const ALLOW_PROXY_REQS = 1 << 0;
        /// Cross-origin requests are permitted.
        const ALLOW_CORS = 1 << 1;
        /// The connection arrived through a proxy preamble.
        const PROXIED = 1 << 2;
    }
}

impl RequestFlags {
    /// Bits that survive across request cycles on one connection.
    pub(crate) const CARRIED: RequestFlags =
        RequestFlags::PROXIED.union(RequestFlags::ALLOW_CORS);
}

/// Outcome of resuming a connection's coroutine.
///
/// Outcomes are ordered: anything below [`Yield::MayResume`] tears the
/// connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i8)]
pub enum Yield {
    /// Unrecoverable; the worker destroys the connection.
    Abort = -1,
    /// May be resumed as soon as the worker is able.
    MayResume = 0,
    /// Resumable once the socket reports readable.
    WantRead = 1,
    /// Resumable once the socket reports writable.
    WantWrite = 2,
}

/// Result of one [`Job::poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The request cycle is complete. Carries the offset of a pipelined
    /// follow-up request already sitting in the read buffer, if any; the
    /// next cycle receives it through [`Request::cursor`] and parses without
    /// another read.
    Done(Option<usize>),
    /// Suspend the coroutine with the given outcome.
    Yield(Yield),
}

/// Factory for per-request state machines.
///
/// One instance is shared by every worker, so implementations hold only
/// immutable or synchronized state.
pub trait Processor<S>: Send + Sync + 'static {
    /// Starts a request cycle on a connection.
    fn begin(&self) -> Box<dyn Job<S>>;
}

/// A single request cycle.
///
/// [`poll`](Job::poll) is called once per coroutine resumption until it
/// reports [`Flow::Done`]. Implementations must never block: socket I/O goes
/// through the non-blocking stream in the [`Request`] context, yielding
/// [`Yield::WantRead`] or [`Yield::WantWrite`] on `WouldBlock`.
pub trait Job<S>: Send {
    /// Drives the request as far as the socket allows.
    fn poll(&mut self, req: &mut Request<'_, S>) -> Flow;
}

/// Everything a [`Job`] may touch while handling one request.
pub struct Request<'a, S = TcpStream> {
    pub(crate) stream: &'a mut S,
    pub(crate) read_buf: &'a mut Vec<u8>,
    pub(crate) response: &'a mut Vec<u8>,
    pub(crate) conn_flags: &'a mut ConnFlags,
    pub(crate) req_flags: &'a mut RequestFlags,
    pub(crate) cursor: Option<usize>,
    pub(crate) date: &'a DateCache,
    pub(crate) deferred: &'a mut Deferred,
}

impl<'a, S> Request<'a, S> {
    /// The connection's non-blocking stream.
    #[inline]
    pub fn stream(&mut self) -> &mut S {
        &mut *self.stream
    }

    /// Bytes read from the socket so far. Contents persist across request
    /// cycles so a pipelined cursor stays valid.
    #[inline]
    pub fn read_buf(&self) -> &[u8] {
        self.read_buf.as_slice()
    }

    /// Mutable access to the read buffer, e.g. to drain consumed requests.
    #[inline]
    pub fn read_buf_mut(&mut self) -> &mut Vec<u8> {
        &mut *self.read_buf
    }

    /// The response buffer. Cleared at the start of every cycle; its storage
    /// lives as long as the connection.
    #[inline]
    pub fn response(&mut self) -> &mut Vec<u8> {
        &mut *self.response
    }

    /// Offset into the read buffer where a pipelined request begins, as
    /// reported by the previous cycle's [`Flow::Done`].
    #[inline]
    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Flags for the current cycle.
    #[inline]
    pub fn flags(&self) -> RequestFlags {
        *self.req_flags
    }

    /// Mutable access to the cycle's flags. Only [`RequestFlags::PROXIED`]
    /// and [`RequestFlags::ALLOW_CORS`] outlive the cycle.
    #[inline]
    pub fn flags_mut(&mut self) -> &mut RequestFlags {
        &mut *self.req_flags
    }

    /// Whether the connection outlives the current request.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.conn_flags.contains(ConnFlags::KEEP_ALIVE)
    }

    /// Marks whether the connection outlives the current request. Once
    /// keep-alive is withdrawn no further request cycle begins: the
    /// connection is torn down as soon as the current cycle ends, or by the
    /// reaper's next pass if the cycle finished under a forced read wait.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.conn_flags.set(ConnFlags::KEEP_ALIVE, keep_alive);
    }

    /// Whether a forced read wait is pending.
    #[inline]
    pub fn must_read(&self) -> bool {
        self.conn_flags.contains(ConnFlags::MUST_READ)
    }

    /// Forces the connection's next wait to be for readability, whatever the
    /// coroutine yields. [`fill`](Request::fill) clears it again once bytes
    /// arrive. Set this before finishing a cycle that awaits another
    /// request.
    pub fn set_must_read(&mut self, must_read: bool) {
        self.conn_flags.set(ConnFlags::MUST_READ, must_read);
    }

    /// Current IMF-fixdate timestamp for the `Date` header.
    #[inline]
    pub fn date(&self) -> &str {
        self.date.date()
    }

    /// `Date` plus the configured expiry, for the `Expires` header.
    #[inline]
    pub fn expires(&self) -> &str {
        self.date.expires()
    }

    /// Registers a cleanup scoped to this request cycle. Cleanups run
    /// newest-first when the cycle completes, or when the connection is
    /// destroyed mid-cycle.
    pub fn defer(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(cleanup));
    }
}

impl<'a, S: Read> Request<'a, S> {
    /// Reads from the socket into the read buffer until the kernel has
    /// nothing more.
    ///
    /// Returns `Ok(0)` only when the peer has closed the stream. A
    /// `WouldBlock` error means no bytes were available at all; partial
    /// reads before `WouldBlock` report `Ok(n)`. Any successful read clears
    /// the forced-read state set by [`set_must_read`](Request::set_must_read).
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut read = 0;
        let mut chunk = [0; 4096];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(read),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    read += n;
                    self.conn_flags.remove(ConnFlags::MUST_READ);
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => {
                        return if read == 0 { Err(err) } else { Ok(read) };
                    }
                    io::ErrorKind::Interrupted => {}
                    _ => return Err(err),
                },
            }
        }
    }
}

impl<'a, S: Write> Request<'a, S> {
    /// Writes the response buffer to the socket starting at `from`, until
    /// everything is out or the kernel pushes back.
    ///
    /// A `WouldBlock` error means nothing could be written; partial writes
    /// report `Ok(n)` and the caller retries from `from + n` after yielding
    /// [`Yield::WantWrite`].
    pub fn flush_response(&mut self, from: usize) -> io::Result<usize> {
        let mut flushed = 0;

        while from + flushed < self.response.len() {
            match self.stream.write(&self.response[from + flushed..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => flushed += n,
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => {
                        if flushed == 0 {
                            return Err(err);
                        }
                        break;
                    }
                    io::ErrorKind::Interrupted => {}
                    _ => return Err(err),
                },
            }
        }

        Ok(flushed)
    }
}

impl<'a, S> fmt::Debug for Request<'a, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("cursor", &self.cursor)
            .field("read_buf_len", &self.read_buf.len())
            .field("response_len", &self.response.len())
            .field("flags", &self.req_flags)
            .finish_non_exhaustive()
    }
}
