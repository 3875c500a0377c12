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

//! Accept path & `wrap`. Binds `listen.instances` listeners (`SO_REUSEPORT`
//! scale-out, the same socket tuning `g3-socket` applies, here
//! reimplemented directly against `socket2` since that internal crate has
//! no available source), and for each accepted connection runs the
//! SNI-sniff-then-TLS-wrap pipeline before handing a [`TcpContext`] to the
//! control loop.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_rustls::TlsAcceptor;

use crate::config::server::{ListenConfig, SniConfig};
use crate::serve::error::{ServerError, ServerResult};
use crate::serve::io::AnyStream;
use crate::serve::sni::{self, SniSniffer};
use crate::serve::task::TcpContext;

/// Binds every listener instance and spawns its accept loop, returning an
/// [`AbortHandle`] and the actual bound address per instance so the
/// control loop can cancel them at `stop` (closing the listener) and so
/// `Server::start` can report the real port when `listen.bind`'s port is
/// `0`.
pub fn spawn_all(
    listen: &ListenConfig,
    sni: Option<SniConfig>,
    terminator: Option<Arc<rustls::ServerConfig>>,
    connect_tx: mpsc::Sender<TcpContext>,
    server_name: Arc<str>,
) -> ServerResult<Vec<(AbortHandle, SocketAddr)>> {
    let instances = listen.instances.max(1);
    let mut handles = Vec::with_capacity(instances as usize);
    for _ in 0..instances {
        let listener = bind_listener(listen.bind, listen.backlog)?;
        let local_addr = listener.local_addr().map_err(ServerError::BindError)?;
        let task = tokio::spawn(accept_loop(
            listener,
            sni,
            terminator.clone(),
            connect_tx.clone(),
            Arc::clone(&server_name),
        ));
        handles.push((task.abort_handle(), local_addr));
    }
    Ok(handles)
}

fn bind_listener(bind: SocketAddr, backlog: u32) -> ServerResult<TcpListener> {
    let domain = if bind.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP)).map_err(ServerError::BindError)?;
    socket.set_reuse_address(true).map_err(ServerError::BindError)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(ServerError::BindError)?;
    socket.set_nonblocking(true).map_err(ServerError::BindError)?;
    socket.bind(&bind.into()).map_err(ServerError::BindError)?;
    socket
        .listen(backlog.try_into().unwrap_or(i32::MAX))
        .map_err(ServerError::BindError)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(ServerError::BindError)
}

async fn accept_loop(
    listener: TcpListener,
    sni: Option<SniConfig>,
    terminator: Option<Arc<rustls::ServerConfig>>,
    connect_tx: mpsc::Sender<TcpContext>,
    server_name: Arc<str>,
) {
    loop {
        match listener.accept().await {
            Ok((sock, addr)) => {
                tokio::spawn(wrap(sock, addr, sni, terminator.clone(), connect_tx.clone()));
            }
            Err(e) => {
                log::warn!("{server_name}: accept error, stopping this accept loop: {e}");
                break;
            }
        }
    }
}

async fn wrap(
    sock: TcpStream,
    addr: SocketAddr,
    sni: Option<SniConfig>,
    terminator: Option<Arc<rustls::ServerConfig>>,
    connect_tx: mpsc::Sender<TcpContext>,
) {
    let _ = sock.set_nodelay(true);

    let mut hostname = None;
    let mut conn: AnyStream = Box::new(sock);

    if let Some(sni_cfg) = sni {
        match SniSniffer::sniff(conn, sni_cfg.read_timeout).await {
            Ok((replay, host)) => {
                hostname = Some(host);
                conn = sni::boxed(replay);
            }
            Err(e) => {
                log::info!("sni sniff failed for {addr}: {e}");
                return;
            }
        }
    }

    if let Some(tls_cfg) = terminator {
        let acceptor = TlsAcceptor::from(tls_cfg);
        match acceptor.accept(conn).await {
            Ok(tls_stream) => conn = Box::new(tls_stream),
            Err(e) => {
                log::info!("tls handshake failed for {addr}: {e}");
                return;
            }
        }
    }

    let ctx = TcpContext::new(hostname, addr, conn);
    if connect_tx.send(ctx).await.is_err() {
        log::debug!("{addr}: control loop no longer accepting connections");
    }
}
