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

//! One [`Server`] per configured listener: owns the accept loops, the
//! control loop and the TLS/access/scheduler collaborators wired together
//! at construction time. Grounded on `serve/mod.rs`'s `ServerInternal`
//! start/stop lifecycle, trimmed to a single listener's worth of state
//! (no registry of sibling servers — each `Server` is independent here).

pub mod accept;
mod acme;
mod control;
pub mod error;
mod handler;
mod io;
mod relay;
mod sni;
pub mod task;
mod task_log;
mod tls_builder;

use std::sync::Arc;

use slog::{o, Drain};
use tokio::task::JoinHandle;

use crate::access::{AccessFilter, CidrAccessFilter};
use crate::config::server::{Protocol, ServerConfig};
use crate::scheduler::Scheduler;
use crate::stats_handler::StatsHandler;

pub use error::{ServerError, ServerResult};
use handler::HandlerEnv;
use tls_builder::{Terminator, TlsConfigBuilder};

/// A single listener: binds sockets, accepts, optionally sniffs SNI and
/// terminates TLS, hands each connection to a [`Scheduler`]-picked
/// backend, relays bytes, and reports through a [`StatsHandler`] (spec
/// §4's full pipeline).
pub struct Server {
    name: String,
    cfg: Arc<ServerConfig>,
    scheduler: Arc<dyn Scheduler>,
    stats: Arc<dyn StatsHandler>,
    terminator: Option<Terminator>,
    backend_dialer: Option<Arc<rustls::ClientConfig>>,
    task_logger: slog::Logger,
    running: Option<Running>,
}

struct Running {
    control_task: JoinHandle<()>,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    listen_addrs: Vec<std::net::SocketAddr>,
}

impl Server {
    /// Builds a server's static collaborators — TLS terminator/dialer,
    /// access filter, task logger — without binding any socket or
    /// spawning any task. Fails fast on bad cert/key material.
    pub fn new(
        name: impl Into<String>,
        cfg: ServerConfig,
        scheduler: Arc<dyn Scheduler>,
        stats: Arc<dyn StatsHandler>,
    ) -> ServerResult<Server> {
        let name = name.into();

        let terminator = match cfg.protocol {
            Protocol::Tls => Some(TlsConfigBuilder::build_terminator(
                cfg.tls.as_ref(),
                cfg.acme.as_ref(),
            )?),
            Protocol::Tcp => None,
        };

        let backend_dialer = cfg
            .backends_tls
            .as_ref()
            .map(TlsConfigBuilder::build_dialer)
            .transpose()?;

        let task_logger = build_task_logger(&name);

        Ok(Server {
            name,
            cfg: Arc::new(cfg),
            scheduler,
            stats,
            terminator,
            backend_dialer,
            task_logger,
            running: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cfg(&self) -> &ServerConfig {
        &self.cfg
    }

    /// Starts the scheduler, stats handler and (for ACME) terminator
    /// background tasks, binds every listener instance, and spawns the
    /// control loop. Idempotent only in the sense that calling it twice on
    /// an already-running server leaks the first run's tasks — callers are
    /// expected to `stop` before a second `start`.
    pub async fn start(&mut self) -> ServerResult<()> {
        self.scheduler.start().await;
        self.stats.start().await;
        if let Some(terminator) = &self.terminator {
            terminator
                .start()
                .await
                .map_err(|e| ServerError::ConfigError(e.to_string()))?;
        }

        let access: Option<Arc<dyn AccessFilter>> = self
            .cfg
            .access
            .clone()
            .map(|cfg| Arc::new(CidrAccessFilter::new(cfg)) as Arc<dyn AccessFilter>);

        let env = Arc::new(HandlerEnv {
            server_name: self.name.clone(),
            cfg: Arc::clone(&self.cfg),
            scheduler: Arc::clone(&self.scheduler),
            access,
            backend_dialer: self.backend_dialer.clone(),
            task_logger: self.task_logger.clone(),
        });

        let (channels, connect_rx, disconnect_rx, stop_rx) = control::channels();

        let bound = accept::spawn_all(
            &self.cfg.listen,
            self.cfg.sni,
            self.terminator.as_ref().map(Terminator::rustls_config),
            channels.connect_tx,
            Arc::from(self.name.as_str()),
        )?;
        let listen_addrs: Vec<std::net::SocketAddr> = bound.iter().map(|(_, addr)| *addr).collect();
        let accept_handles = bound.into_iter().map(|(handle, _)| handle).collect();

        let control_task = control::spawn(
            env,
            Arc::clone(&self.scheduler),
            Arc::clone(&self.stats),
            self.cfg.max_connections,
            connect_rx,
            disconnect_rx,
            stop_rx,
            channels.disconnect_tx,
            accept_handles,
        );

        log::info!("{}: started on {listen_addrs:?}", self.name);
        self.running = Some(Running {
            control_task,
            stop_tx: Some(channels.stop_tx),
            listen_addrs,
        });

        Ok(())
    }

    /// The actual bound address of every listener instance — useful when
    /// `listen.bind`'s port is `0` and the OS assigned an ephemeral one.
    /// Empty before `start` and after `stop`.
    pub fn listen_addrs(&self) -> &[std::net::SocketAddr] {
        self.running
            .as_ref()
            .map(|r| r.listen_addrs.as_slice())
            .unwrap_or(&[])
    }

    /// Signals the control loop to stop (aborting every accept loop and
    /// every in-flight handler task) and waits for it to finish.
    pub async fn stop(&mut self) {
        if let Some(mut running) = self.running.take() {
            if let Some(stop_tx) = running.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            let _ = (&mut running.control_task).await;
            log::info!("{}: stopped", self.name);
        }
    }
}

fn build_task_logger(server_name: &str) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!("server" => server_name.to_string()))
}
