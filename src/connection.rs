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

//! Per-connection state held in a worker's connection table

use crate::coro::ConnCoro;

/// Sentinel link value: the out-of-band list head, or "not linked".
pub(crate) const NO_LINK: usize = usize::MAX;

bitflags::bitflags! {
    /// Lifecycle and readiness bookkeeping bits for one connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ConnFlags: u8 {
        /// The slot holds a live connection.
        const IS_ALIVE = 1 << 0;
        /// The connection survives the current request cycle.
        const KEEP_ALIVE = 1 << 1;
        /// The coroutine expects to be resumed on the next readiness event.
        const SHOULD_RESUME_CORO = 1 << 2;
        /// The next wait must be for readability, whatever the coroutine
        /// yielded.
        const MUST_READ = 1 << 3;
        /// Write interest is currently installed with the poller.
        const WRITE_EVENTS = 1 << 4;
    }
}

/// One slot of a worker's connection table.
///
/// The expiry-queue links are table keys rather than references so a removed
/// slot can be marked detached with [`NO_LINK`].
pub(crate) struct Connection<S> {
    pub(crate) stream: S,
    /// Present iff the connection is active.
    pub(crate) coro: Option<ConnCoro<S>>,
    pub(crate) flags: ConnFlags,
    /// Tick at which the reaper recycles this connection unless refreshed.
    pub(crate) time_to_die: u64,
    pub(crate) prev: usize,
    pub(crate) next: usize,
}

impl<S> Connection<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            coro: None,
            flags: ConnFlags::empty(),
            time_to_die: 0,
            prev: NO_LINK,
            next: NO_LINK,
        }
    }
}
