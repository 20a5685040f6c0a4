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

//! In-memory doubles for unit tests.
//!
//! The reactor is generic over its stream type, so tests swap the real
//! socket for [`PipeStream`]: reads drain a scripted byte buffer, writes
//! land in memory, and poller (re)registrations are recorded instead of
//! touching the OS.

use std::io::{self, Read, Write};

use mio::event::Source;
use mio::{Interest, Registry, Token};

use crate::request::{Flow, Job, Processor, Request};

/// Fake connection stream with recorded poller interest changes.
#[derive(Debug, Default)]
pub(crate) struct PipeStream {
    pub(crate) input: Vec<u8>,
    pub(crate) eof: bool,
    pub(crate) output: Vec<u8>,
    pub(crate) interests: Vec<Interest>,
    pub(crate) fail_reregister: bool,
}

impl PipeStream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_input(input: &[u8]) -> Self {
        Self {
            input: input.to_vec(),
            ..Self::default()
        }
    }
}

impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return if self.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(self.input.len());
        buf[..n].copy_from_slice(&self.input[..n]);
        self.input.drain(..n);
        Ok(n)
    }
}

impl Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Source for PipeStream {
    fn register(
        &mut self,
        _registry: &Registry,
        _token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.interests.push(interests);
        Ok(())
    }

    fn reregister(
        &mut self,
        _registry: &Registry,
        _token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        if self.fail_reregister {
            return Err(io::Error::new(io::ErrorKind::Other, "reregister refused"));
        }
        self.interests.push(interests);
        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }
}

/// Processor whose jobs come from a closure factory.
pub(crate) struct FnProcessor<F>(pub(crate) F);

impl<S, F, J> Processor<S> for FnProcessor<F>
where
    F: Fn() -> J + Send + Sync + 'static,
    J: Job<S> + 'static,
{
    fn begin(&self) -> Box<dyn Job<S>> {
        Box::new((self.0)())
    }
}

/// Job that delegates every poll to a closure.
pub(crate) struct FnJob<F>(pub(crate) F);

impl<S, F> Job<S> for FnJob<F>
where
    F: FnMut(&mut Request<'_, S>) -> Flow + Send,
{
    fn poll(&mut self, req: &mut Request<'_, S>) -> Flow {
        (self.0)(req)
    }
}
