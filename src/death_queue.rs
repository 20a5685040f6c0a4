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

//! Idle-expiry queue: an intrusive doubly-linked list threaded through the
//! connection table, ordered by expiry tick.
//!
//! The head lives out of band in the queue itself; `prev`/`next` on each
//! connection are table keys, with [`NO_LINK`] standing in for "the head".
//! Keep-alive refreshes always stamp `current tick + timeout`, so appending
//! at the tail keeps the list sorted and the reaper only ever inspects the
//! front. Ticks are one second of quiescence each and restart from zero
//! whenever the queue drains, which bounds their growth.

use std::time::Duration;

use slab::Slab;

use crate::connection::{ConnFlags, Connection, NO_LINK};

/// Reaper granularity; also the poll deadline while connections are queued.
const TICK: Duration = Duration::from_millis(1000);

/// Per-worker expiry queue over that worker's connection table.
#[derive(Debug)]
pub(crate) struct DeathQueue {
    head_next: usize,
    head_prev: usize,
    tick: u64,
    timeout: u64,
}

impl DeathQueue {
    pub(crate) fn new(keep_alive_timeout: u32) -> Self {
        Self {
            head_next: NO_LINK,
            head_prev: NO_LINK,
            tick: 0,
            timeout: u64::from(keep_alive_timeout),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head_next == NO_LINK
    }

    #[cfg(test)]
    pub(crate) fn tick(&self) -> u64 {
        self.tick
    }

    /// Poll deadline: finite only while connections are waiting to expire.
    #[inline]
    pub(crate) fn poll_timeout(&self) -> Option<Duration> {
        if self.is_empty() {
            None
        } else {
            Some(TICK)
        }
    }

    /// Appends a freshly activated connection with a full keep-alive window.
    pub(crate) fn insert<S>(&mut self, table: &mut Slab<Connection<S>>, key: usize) {
        table[key].time_to_die = self.tick + self.timeout;
        self.link_last(table, key);
    }

    /// Unlinks a connection, leaving its links detached.
    pub(crate) fn remove<S>(&mut self, table: &mut Slab<Connection<S>>, key: usize) {
        let (prev, next) = {
            let conn = &table[key];
            (conn.prev, conn.next)
        };

        if prev == NO_LINK {
            self.head_next = next;
        } else {
            table[prev].next = next;
        }
        if next == NO_LINK {
            self.head_prev = prev;
        } else {
            table[next].prev = prev;
        }

        // Stale links on unlinked slots have caused bad traversals at very
        // high request counts; a removed connection must always read as
        // detached.
        let conn = &mut table[key];
        conn.prev = NO_LINK;
        conn.next = NO_LINK;
    }

    /// Refreshes a connection's deadline and requeues it at the tail.
    /// Keep-alive connections (and those with a pending resume) get a fresh
    /// window; anything else becomes due on the next reaper pass.
    pub(crate) fn move_to_tail<S>(&mut self, table: &mut Slab<Connection<S>>, key: usize) {
        let window = if table[key]
            .flags
            .intersects(ConnFlags::KEEP_ALIVE | ConnFlags::SHOULD_RESUME_CORO)
        {
            self.timeout
        } else {
            0
        };
        table[key].time_to_die = self.tick + window;

        self.remove(table, key);
        self.link_last(table, key);
    }

    /// Front of the queue, if its deadline has passed.
    pub(crate) fn expired<S>(&self, table: &Slab<Connection<S>>) -> Option<usize> {
        let first = self.head_next;
        if first == NO_LINK || table[first].time_to_die > self.tick {
            return None;
        }
        Some(first)
    }

    /// Advances the reaper clock by one quiescent interval.
    #[inline]
    pub(crate) fn advance(&mut self) {
        self.tick += 1;
    }

    /// Restarts the clock. Deadlines are relative to the current tick, so
    /// this is sound only once the queue has drained.
    pub(crate) fn reset(&mut self) {
        debug_assert!(self.is_empty());
        self.tick = 0;
    }

    fn link_last<S>(&mut self, table: &mut Slab<Connection<S>>, key: usize) {
        let last = self.head_prev;
        {
            let conn = &mut table[key];
            conn.prev = last;
            conn.next = NO_LINK;
        }
        if last == NO_LINK {
            self.head_next = key;
        } else {
            table[last].next = key;
        }
        self.head_prev = key;
    }
}

#[cfg(test)]
mod test {
    use slab::Slab;

    use super::DeathQueue;
    use crate::connection::{ConnFlags, Connection, NO_LINK};
    use crate::testing::PipeStream;

    fn table_with(queue: &mut DeathQueue, count: usize) -> (Slab<Connection<PipeStream>>, Vec<usize>) {
        let mut table = Slab::new();
        let mut keys = Vec::new();
        for _ in 0..count {
            let mut conn = Connection::new(PipeStream::new());
            conn.flags = ConnFlags::IS_ALIVE | ConnFlags::KEEP_ALIVE;
            let key = table.insert(conn);
            queue.insert(&mut table, key);
            keys.push(key);
        }
        (table, keys)
    }

    fn order(queue: &DeathQueue, table: &Slab<Connection<PipeStream>>) -> Vec<usize> {
        let mut keys = Vec::new();
        let mut key = queue.head_next;
        while key != NO_LINK {
            keys.push(key);
            key = table[key].next;
        }
        keys
    }

    #[test]
    fn insert_then_remove_leaves_queue_empty_and_links_detached() {
        let mut queue = DeathQueue::new(5);
        let (mut table, keys) = table_with(&mut queue, 1);

        queue.remove(&mut table, keys[0]);

        assert!(queue.is_empty());
        assert_eq!(NO_LINK, queue.head_next);
        assert_eq!(NO_LINK, queue.head_prev);
        assert_eq!(NO_LINK, table[keys[0]].prev);
        assert_eq!(NO_LINK, table[keys[0]].next);
    }

    #[test]
    fn removing_a_middle_entry_relinks_its_neighbors() {
        let mut queue = DeathQueue::new(5);
        let (mut table, keys) = table_with(&mut queue, 3);

        queue.remove(&mut table, keys[1]);

        assert_eq!(vec![keys[0], keys[2]], order(&queue, &table));
        assert_eq!(NO_LINK, table[keys[1]].prev);
        assert_eq!(NO_LINK, table[keys[1]].next);
    }

    #[test]
    fn insert_stamps_a_full_window() {
        let mut queue = DeathQueue::new(5);
        queue.advance();
        queue.advance();
        let (table, keys) = table_with(&mut queue, 1);

        assert_eq!(7, table[keys[0]].time_to_die);
    }

    #[test]
    fn poll_timeout_is_finite_iff_nonempty() {
        let mut queue = DeathQueue::new(5);
        assert_eq!(None, queue.poll_timeout());

        let (mut table, keys) = table_with(&mut queue, 1);
        assert_eq!(Some(super::TICK), queue.poll_timeout());

        queue.remove(&mut table, keys[0]);
        assert_eq!(None, queue.poll_timeout());
    }

    #[test]
    fn deadlines_stay_sorted_under_keep_alive_refreshes() {
        let mut queue = DeathQueue::new(5);
        let (mut table, keys) = table_with(&mut queue, 3);

        queue.advance();
        queue.move_to_tail(&mut table, keys[0]);

        assert_eq!(vec![keys[1], keys[2], keys[0]], order(&queue, &table));
        let mut previous = 0;
        for key in order(&queue, &table) {
            assert!(table[key].time_to_die >= previous);
            previous = table[key].time_to_die;
        }
    }

    #[test]
    fn move_to_tail_without_keep_alive_is_due_immediately() {
        let mut queue = DeathQueue::new(5);
        let (mut table, keys) = table_with(&mut queue, 1);
        table[keys[0]].flags = ConnFlags::IS_ALIVE;

        queue.move_to_tail(&mut table, keys[0]);
        assert_eq!(queue.tick(), table[keys[0]].time_to_die);

        queue.advance();
        assert_eq!(Some(keys[0]), queue.expired(&table));
    }

    #[test]
    fn move_to_tail_is_idempotent_when_no_time_has_passed() {
        let mut queue = DeathQueue::new(5);
        let (mut table, keys) = table_with(&mut queue, 2);

        queue.move_to_tail(&mut table, keys[1]);
        let first = (
            order(&queue, &table),
            table[keys[1]].time_to_die,
            table[keys[1]].prev,
            table[keys[1]].next,
        );

        queue.move_to_tail(&mut table, keys[1]);
        let second = (
            order(&queue, &table),
            table[keys[1]].time_to_die,
            table[keys[1]].prev,
            table[keys[1]].next,
        );

        assert_eq!(first, second);
    }

    #[test]
    fn entries_expire_at_their_exact_deadline() {
        let mut queue = DeathQueue::new(2);
        let (table, keys) = table_with(&mut queue, 1);

        queue.advance();
        assert_eq!(None, queue.expired(&table));
        queue.advance();
        assert_eq!(Some(keys[0]), queue.expired(&table));
    }

    #[test]
    fn reset_restarts_the_clock_once_drained() {
        let mut queue = DeathQueue::new(2);
        let (mut table, keys) = table_with(&mut queue, 1);

        queue.advance();
        queue.advance();
        assert_eq!(Some(keys[0]), queue.expired(&table));
        queue.remove(&mut table, keys[0]);

        assert!(queue.is_empty());
        queue.reset();
        assert_eq!(0, queue.tick());
    }
}
