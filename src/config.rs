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

//! Reactor configuration

use std::thread::available_parallelism;

/// Tunables shared by every worker of a [`Reactor`](crate::pool::Reactor).
#[derive(Debug, Clone)]
pub struct Config {
    /// Seconds a keep-alive connection may sit idle before the reaper
    /// recycles it.
    pub keep_alive_timeout: u32,
    /// Seconds added to the current time for the cached `Expires` header.
    pub expires: u32,
    /// Trust PROXY protocol preambles on accepted connections.
    pub proxy_protocol: bool,
    /// Permit cross-origin requests.
    pub allow_cors: bool,
    /// Upper bound of connections tracked per worker; also sizes each
    /// worker's hand-off queue.
    pub max_fd: usize,
    /// Number of worker threads.
    pub thread_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keep_alive_timeout: 15,
            expires: 60 * 60 * 24 * 7,
            proxy_protocol: false,
            allow_cors: false,
            max_fd: 1024,
            thread_count: available_parallelism().map(usize::from).unwrap_or(2),
        }
    }
}
