/*
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The `StatsHandler` external interface: receives connection-count
//! samples pushed by the control loop. Stats aggregation backends
//! (Prometheus, StatsD, ...) are out of scope for the core; this module
//! only ships a logging reference implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

/// Receives a stream of live connection-count samples from a server's
/// control loop, plus lifecycle `start`/`stop` calls.
///
/// Implementations are expected to be internally thread-safe.
#[async_trait]
pub trait StatsHandler: Send + Sync {
    fn report_connection_count(&self, count: u64);

    async fn start(&self) {}
    async fn stop(&self) {}
}

/// Logs every connection-count sample at `debug` level via the `log`
/// facade, the lifecycle-logging half of the dual logging scheme
/// (structured per-task logs use `slog` instead, see `serve::task_log`).
#[derive(Debug, Default)]
pub struct LoggingStatsHandler {
    name: String,
}

impl LoggingStatsHandler {
    pub fn new(name: impl Into<String>) -> Self {
        LoggingStatsHandler { name: name.into() }
    }
}

#[async_trait]
impl StatsHandler for LoggingStatsHandler {
    fn report_connection_count(&self, count: u64) {
        let name = &self.name;
        log::debug!("STAT[{name}] client connection count: {count}");
    }

    async fn start(&self) {
        let name = &self.name;
        log::info!("STAT[{name}] stats handler started");
    }

    async fn stop(&self) {
        let name = &self.name;
        log::info!("STAT[{name}] stats handler stopped");
    }
}

/// Accumulates the last reported connection count and a running total of
/// samples seen, for use in tests that need to assert on exact sample
/// sequences (e.g. scenario S2's `1, 1`).
#[derive(Debug, Default)]
pub struct CountingStatsHandler {
    last: AtomicU64,
    samples: AtomicU64,
}

impl CountingStatsHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_count(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }

    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatsHandler for CountingStatsHandler {
    fn report_connection_count(&self, count: u64) {
        self.last.store(count, Ordering::SeqCst);
        self.samples.fetch_add(1, Ordering::SeqCst);
    }
}
