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

//! The `Scheduler` external interface: backend discovery, health checking
//! and balancing are consumed through it, never implemented by the core.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use crate::backend::Backend;
use crate::serve::task::TcpContext;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("no healthy backend available")]
    NoBackendAvailable,
    #[error("scheduler error: {0}")]
    Other(String),
}

/// Combines discovery, health checking and balancing to produce a
/// [`Backend`] for a given connection context, and receives counter
/// deltas for the connections it hands out.
///
/// Implementations are expected to be internally thread-safe: the core
/// makes concurrent calls from many per-connection handler tasks.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn take_backend(&self, ctx: &TcpContext) -> Result<Backend, SchedulerError>;

    fn increment_connection(&self, backend: &Backend);
    fn decrement_connection(&self, backend: &Backend);
    fn increment_refused(&self, backend: &Backend);
    fn increment_rx(&self, backend: &Backend, n: u64);
    fn increment_tx(&self, backend: &Backend, n: u64);

    async fn start(&self) {}
    async fn stop(&self) {}
}

#[derive(Debug, Default)]
struct BackendCounters {
    connections: AtomicU32,
    refused: AtomicU64,
    rx: AtomicU64,
    tx: AtomicU64,
}

/// A minimal round-robin [`Scheduler`] over a fixed backend list.
///
/// This is a reference/test collaborator, not a production discovery,
/// health-check or balancing stack — those remain out of the core's
/// scope by design.
pub struct RoundRobinScheduler {
    backends: Vec<Backend>,
    next: AtomicU32,
    counters: Mutex<HashMap<Backend, BackendCounters>>,
}

impl RoundRobinScheduler {
    pub fn new(backends: Vec<Backend>) -> Self {
        let mut counters = HashMap::with_capacity(backends.len());
        for b in &backends {
            counters.insert(b.clone(), BackendCounters::default());
        }
        RoundRobinScheduler {
            backends,
            next: AtomicU32::new(0),
            counters: Mutex::new(counters),
        }
    }

    pub fn active_connections(&self, backend: &Backend) -> u32 {
        self.counters
            .lock()
            .unwrap()
            .get(backend)
            .map(|c| c.connections.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn refused(&self, backend: &Backend) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(backend)
            .map(|c| c.refused.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn rx_bytes(&self, backend: &Backend) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(backend)
            .map(|c| c.rx.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn tx_bytes(&self, backend: &Backend) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(backend)
            .map(|c| c.tx.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Scheduler for RoundRobinScheduler {
    async fn take_backend(&self, _ctx: &TcpContext) -> Result<Backend, SchedulerError> {
        if self.backends.is_empty() {
            return Err(SchedulerError::NoBackendAvailable);
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) as usize % self.backends.len();
        Ok(self.backends[i].clone())
    }

    fn increment_connection(&self, backend: &Backend) {
        if let Some(c) = self.counters.lock().unwrap().get(backend) {
            c.connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn decrement_connection(&self, backend: &Backend) {
        if let Some(c) = self.counters.lock().unwrap().get(backend) {
            c.connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn increment_refused(&self, backend: &Backend) {
        if let Some(c) = self.counters.lock().unwrap().get(backend) {
            c.refused.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn increment_rx(&self, backend: &Backend, n: u64) {
        if let Some(c) = self.counters.lock().unwrap().get(backend) {
            c.rx.fetch_add(n, Ordering::Relaxed);
        }
    }

    fn increment_tx(&self, backend: &Backend, n: u64) {
        if let Some(c) = self.counters.lock().unwrap().get(backend) {
            c.tx.fetch_add(n, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn ctx() -> TcpContext {
        TcpContext::for_test(None, "127.0.0.1:1".parse::<SocketAddr>().unwrap())
    }

    #[tokio::test]
    async fn round_robin_cycles_backends() {
        let b1 = Backend::new("127.0.0.1:9001".parse().unwrap());
        let b2 = Backend::new("127.0.0.1:9002".parse().unwrap());
        let sched = RoundRobinScheduler::new(vec![b1.clone(), b2.clone()]);

        let ctx = ctx();
        let picks: Vec<_> = futures_util::future::join_all((0..4).map(|_| sched.take_backend(&ctx)))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(picks, vec![b1.clone(), b2.clone(), b1, b2]);
    }

    #[tokio::test]
    async fn counters_track_deltas() {
        let b1 = Backend::new("127.0.0.1:9001".parse().unwrap());
        let sched = RoundRobinScheduler::new(vec![b1.clone()]);

        sched.increment_connection(&b1);
        sched.increment_connection(&b1);
        sched.decrement_connection(&b1);
        assert_eq!(sched.active_connections(&b1), 1);

        sched.increment_refused(&b1);
        assert_eq!(sched.refused(&b1), 1);

        sched.increment_rx(&b1, 5);
        sched.increment_tx(&b1, 7);
        assert_eq!(sched.rx_bytes(&b1), 5);
        assert_eq!(sched.tx_bytes(&b1), 7);
    }

    #[tokio::test]
    async fn empty_scheduler_refuses() {
        let sched = RoundRobinScheduler::new(vec![]);
        let ctx = ctx();
        assert!(matches!(
            sched.take_backend(&ctx).await,
            Err(SchedulerError::NoBackendAvailable)
        ));
    }
}
