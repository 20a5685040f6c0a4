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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! ember is the I/O core of a low-level HTTP server: a fixed pool of worker
//! threads, each running an independent event loop that multiplexes
//! thousands of connections on one poller.
//!
//! Every connection is driven by a cooperative coroutine that processes
//! request cycles back to back, suspending whenever its socket would block.
//! An idle-timeout reaper runs in band with each event loop and recycles
//! connections whose keep-alive window expires, and acceptors hand freshly
//! accepted sockets across threads through a lock-free queue paired with a
//! wake-up.
//!
//! Protocol logic is pluggable: implement
//! [`Processor`](request::Processor) and [`Job`](request::Job), build a
//! [`Reactor`](pool::Reactor), and feed it accepted streams. The `demos`
//! directory contains a runnable server.

mod connection;
mod coro;
mod death_queue;
#[cfg(test)]
mod testing;

pub mod config;
pub mod date;
pub mod pool;
pub mod request;
pub mod worker;
