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

//! Per-connection handler: access check → backend selection → dial →
//! proxy. Grounded on `serve/sni_proxy/task/relay/task.rs`'s
//! `run` → `run_connected` → `relay` sequencing, and
//! `serve/tcp_stream/task.rs` for the plain (non-SNI) dial path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::access::AccessFilter;
use crate::backend::Backend;
use crate::config::server::ServerConfig;
use crate::scheduler::Scheduler;
use crate::serve::io::AnyStream;
use crate::serve::relay;
use crate::serve::task::TcpContext;
use crate::serve::task_log::TaskLogForTcpConnect;

/// The immutable, per-server collaborators a handler task needs. Cloned
/// (cheaply, behind `Arc`s) into every spawned handler by the control loop.
pub struct HandlerEnv {
    pub server_name: String,
    pub cfg: Arc<ServerConfig>,
    pub scheduler: Arc<dyn Scheduler>,
    pub access: Option<Arc<dyn AccessFilter>>,
    pub backend_dialer: Option<Arc<rustls::ClientConfig>>,
    pub task_logger: slog::Logger,
}

/// Runs one accepted connection to completion. Every exit path simply lets
/// `ctx.conn` (and any backend connection opened along the way) drop,
/// closing the underlying sockets; the caller is responsible for posting
/// the matching `disconnect` event regardless of how this returns.
pub async fn handle(ctx: TcpContext, env: &HandlerEnv) {
    let start_at = Instant::now();
    let start_at_utc = chrono::Utc::now();
    let client_addr = ctx.client_addr;
    let hostname = ctx.hostname.clone();

    if let Some(access) = &env.access {
        if !access.allows(client_addr.ip()) {
            log::info!(
                "{}: connection from {client_addr} denied by access filter",
                env.server_name
            );
            return;
        }
    }

    let backend = match env.scheduler.take_backend(&ctx).await {
        Ok(b) => b,
        Err(e) => {
            log::info!(
                "{}: no backend available for {client_addr}: {e}",
                env.server_name
            );
            return;
        }
    };

    let backend_conn = match dial_backend(
        &backend,
        env.cfg.backend_connection_timeout,
        env.backend_dialer.as_ref(),
    )
    .await
    {
        Ok(conn) => conn,
        Err(source) => {
            env.scheduler.increment_refused(&backend);
            log::warn!(
                "{}: failed to dial backend {backend} for {client_addr}: {source}",
                env.server_name
            );
            return;
        }
    };

    env.scheduler.increment_connection(&backend);

    let backend_for_samples = backend.clone();
    let scheduler_for_rx = Arc::clone(&env.scheduler);
    let backend_for_rx = backend_for_samples.clone();
    let scheduler_for_tx = Arc::clone(&env.scheduler);
    let backend_for_tx = backend_for_samples.clone();

    let relay_result = relay::proxy(
        ctx.conn,
        backend_conn,
        env.cfg.client_idle_timeout,
        env.cfg.backend_idle_timeout,
        move |n| scheduler_for_rx.increment_rx(&backend_for_rx, n),
        move |n| scheduler_for_tx.increment_tx(&backend_for_tx, n),
    )
    .await;

    env.scheduler.decrement_connection(&backend);

    let (rx_bytes, tx_bytes, reason) = match relay_result {
        Ok((rx, tx)) => (rx, tx, "closed"),
        Err(e) => {
            log::info!(
                "{}: relay error for {client_addr} <-> {backend}: {e}",
                env.server_name
            );
            (0, 0, "relay_error")
        }
    };

    TaskLogForTcpConnect {
        server_name: &env.server_name,
        client_addr,
        hostname: hostname.as_deref(),
        backend: Some(&backend),
        start_at_utc,
        start_at,
        rx_bytes,
        tx_bytes,
    }
    .log(&env.task_logger, reason);
}

async fn dial_backend(
    backend: &Backend,
    connect_timeout: Option<Duration>,
    tls: Option<&Arc<rustls::ClientConfig>>,
) -> std::io::Result<AnyStream> {
    let tcp = dial_tcp(backend.address(), connect_timeout).await?;
    match tls {
        Some(client_cfg) => {
            let connector = TlsConnector::from(Arc::clone(client_cfg));
            let server_name = ServerName::from(backend.address().ip());
            let stream = connector.connect(server_name, tcp).await?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(tcp)),
    }
}

async fn dial_tcp(addr: SocketAddr, connect_timeout: Option<Duration>) -> std::io::Result<TcpStream> {
    let connect = TcpStream::connect(addr);
    match connect_timeout {
        Some(d) => match tokio::time::timeout(d, connect).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )),
        },
        None => connect.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::CidrAccessFilter;
    use crate::config::access::{AccessConfig, AccessRule};
    use crate::scheduler::RoundRobinScheduler;
    use crate::stats_handler::StatsHandler;
    use ip_network::IpNetwork;
    use slog::{o, Discard};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(Discard, o!())
    }

    fn minimal_cfg() -> ServerConfig {
        use crate::config::server::{ListenConfig, Protocol};
        ServerConfig {
            name: "test".into(),
            listen: ListenConfig {
                bind: "127.0.0.1:0".parse().unwrap(),
                instances: 1,
                backlog: 1024,
            },
            protocol: Protocol::Tcp,
            sni: None,
            tls: None,
            acme: None,
            backends_tls: None,
            access: None,
            max_connections: 0,
            backend_connection_timeout: Some(Duration::from_millis(200)),
            client_idle_timeout: None,
            backend_idle_timeout: None,
        }
    }

    #[tokio::test]
    async fn relays_an_echo_session_and_updates_counters() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let backend = Backend::new(echo_addr);
        let scheduler = Arc::new(RoundRobinScheduler::new(vec![backend.clone()]));

        let env = HandlerEnv {
            server_name: "test".into(),
            cfg: Arc::new(minimal_cfg()),
            scheduler: scheduler.clone() as Arc<dyn Scheduler>,
            access: None,
            backend_dialer: None,
            task_logger: test_logger(),
        };

        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let client_side = tokio::spawn(async move {
            let mut sock = TcpStream::connect(client_addr).await.unwrap();
            sock.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (accepted, remote_addr) = client_listener.accept().await.unwrap();
        let ctx = TcpContext::new(None, remote_addr, Box::new(accepted));
        handle(ctx, &env).await;

        let echoed = client_side.await.unwrap();
        assert_eq!(&echoed, b"hello");
        assert_eq!(scheduler.rx_bytes(&backend), 5);
        assert_eq!(scheduler.tx_bytes(&backend), 5);
        assert_eq!(scheduler.active_connections(&backend), 0);
    }

    #[tokio::test]
    async fn dial_failure_increments_refused_not_connection() {
        let backend = Backend::new("127.0.0.1:1".parse::<SocketAddr>().unwrap());
        let scheduler = Arc::new(RoundRobinScheduler::new(vec![backend.clone()]));

        let mut cfg = minimal_cfg();
        cfg.backend_connection_timeout = Some(Duration::from_millis(100));
        let env = HandlerEnv {
            server_name: "test".into(),
            cfg: Arc::new(cfg),
            scheduler: scheduler.clone() as Arc<dyn Scheduler>,
            access: None,
            backend_dialer: None,
            task_logger: test_logger(),
        };

        let ctx = TcpContext::for_test(None, "127.0.0.1:2".parse().unwrap());
        handle(ctx, &env).await;

        assert_eq!(scheduler.refused(&backend), 1);
        assert_eq!(scheduler.active_connections(&backend), 0);
    }

    #[tokio::test]
    async fn access_deny_never_touches_scheduler() {
        let backend = Backend::new("127.0.0.1:1".parse::<SocketAddr>().unwrap());
        let scheduler = Arc::new(RoundRobinScheduler::new(vec![backend.clone()]));
        let access = Arc::new(CidrAccessFilter::new(AccessConfig {
            rules: vec![AccessRule {
                network: "10.0.0.0/8".parse::<IpNetwork>().unwrap(),
                allow: true,
            }],
        }));

        let env = HandlerEnv {
            server_name: "test".into(),
            cfg: Arc::new(minimal_cfg()),
            scheduler: scheduler.clone() as Arc<dyn Scheduler>,
            access: Some(access as Arc<dyn AccessFilter>),
            backend_dialer: None,
            task_logger: test_logger(),
        };

        let ctx = TcpContext::for_test(None, "203.0.113.5:4321".parse().unwrap());
        handle(ctx, &env).await;

        assert_eq!(scheduler.refused(&backend), 0);
        assert_eq!(scheduler.active_connections(&backend), 0);
    }

    #[allow(dead_code)]
    fn assert_stats_handler_object_safe(_: &dyn StatsHandler) {}
}
