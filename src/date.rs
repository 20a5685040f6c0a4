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

//! Worker-local clock cache for `Date` and `Expires` headers

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Formatted-timestamp cache, refreshed at most once per second.
///
/// Each worker owns one and request handlers read it through
/// [`Request`](crate::request::Request), so no locking is involved.
#[derive(Debug, Clone)]
pub struct DateCache {
    second: u64,
    date: String,
    expires: String,
    expiry: Duration,
}

impl DateCache {
    /// Creates a cache whose `Expires` string leads `Date` by `expires`
    /// seconds.
    pub fn new(expires: u32) -> Self {
        let mut cache = Self {
            second: 0,
            date: String::new(),
            expires: String::new(),
            expiry: Duration::from_secs(u64::from(expires)),
        };
        cache.refresh();
        cache
    }

    /// Reformats both strings if the wall clock has moved to a new second.
    pub fn refresh(&mut self) {
        let now = SystemTime::now();
        let second = now
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);

        if second == self.second && !self.date.is_empty() {
            return;
        }

        self.second = second;
        self.date = httpdate::fmt_http_date(now);
        self.expires = httpdate::fmt_http_date(now + self.expiry);
    }

    /// Current IMF-fixdate timestamp for the `Date` header.
    #[inline]
    pub fn date(&self) -> &str {
        &self.date
    }

    /// `Date` plus the configured expiry, for the `Expires` header.
    #[inline]
    pub fn expires(&self) -> &str {
        &self.expires
    }
}
