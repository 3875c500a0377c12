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

//! The control loop: the single-consumer task that owns the client table
//! and is the sole mutator of it, reacting to `connect`, `disconnect` and
//! `stop` events. Grounded on
//! `serve/runtime/ordinary_tcp_port.rs`'s biased `tokio::select!` loop
//! shape, simplified to this crate's three event kinds (no hot-reload
//! variant — this crate has no reload concept).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use crate::scheduler::Scheduler;
use crate::serve::handler::{self, HandlerEnv};
use crate::serve::task::TcpContext;
use crate::stats_handler::StatsHandler;

/// The three channel endpoints the rest of `Server` needs to drive the
/// loop from outside: enqueue an accepted connection, post a disconnect,
/// or request a stop. Created with [`channels`] before either the accept
/// loops or the control task exist, breaking the otherwise-circular
/// dependency between them (accept loops need `connect_tx`; the control
/// task needs the accept loops' `AbortHandle`s).
pub struct ControlChannels {
    pub connect_tx: mpsc::Sender<TcpContext>,
    pub disconnect_tx: mpsc::Sender<SocketAddr>,
    pub stop_tx: oneshot::Sender<()>,
}

/// `connect`/`disconnect` are given capacity 1 rather than true zero
/// capacity (tokio's `mpsc` has no unbuffered variant) — the closest
/// approximation of unbuffered, synchronous-rendezvous backpressure
/// without growing unbounded.
const RENDEZVOUS_CAPACITY: usize = 1;

pub fn channels() -> (
    ControlChannels,
    mpsc::Receiver<TcpContext>,
    mpsc::Receiver<SocketAddr>,
    oneshot::Receiver<()>,
) {
    let (connect_tx, connect_rx) = mpsc::channel(RENDEZVOUS_CAPACITY);
    let (disconnect_tx, disconnect_rx) = mpsc::channel(RENDEZVOUS_CAPACITY);
    let (stop_tx, stop_rx) = oneshot::channel();
    let control = ControlChannels {
        connect_tx,
        disconnect_tx,
        stop_tx,
    };
    (control, connect_rx, disconnect_rx, stop_rx)
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    env: Arc<HandlerEnv>,
    scheduler: Arc<dyn Scheduler>,
    stats: Arc<dyn StatsHandler>,
    max_connections: u32,
    connect_rx: mpsc::Receiver<TcpContext>,
    disconnect_rx: mpsc::Receiver<SocketAddr>,
    stop_rx: oneshot::Receiver<()>,
    disconnect_tx: mpsc::Sender<SocketAddr>,
    accept_handles: Vec<AbortHandle>,
) -> JoinHandle<()> {
    tokio::spawn(run(
        env,
        scheduler,
        stats,
        max_connections,
        connect_rx,
        disconnect_rx,
        stop_rx,
        disconnect_tx,
        accept_handles,
    ))
}

#[allow(clippy::too_many_arguments)]
async fn run(
    env: Arc<HandlerEnv>,
    scheduler: Arc<dyn Scheduler>,
    stats: Arc<dyn StatsHandler>,
    max_connections: u32,
    mut connect_rx: mpsc::Receiver<TcpContext>,
    mut disconnect_rx: mpsc::Receiver<SocketAddr>,
    mut stop_rx: oneshot::Receiver<()>,
    disconnect_tx: mpsc::Sender<SocketAddr>,
    accept_handles: Vec<AbortHandle>,
) {
    let mut clients: HashMap<SocketAddr, AbortHandle> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {
                scheduler.stop().await;
                stats.stop().await;
                for handle in &accept_handles {
                    handle.abort();
                }
                for (_, handle) in clients.drain() {
                    handle.abort();
                }
                log::info!("{}: control loop stopped", env.server_name);
                break;
            }

            Some(ctx) = connect_rx.recv() => {
                handle_client_connect(ctx, &env, &stats, max_connections, &mut clients, &disconnect_tx);
            }

            Some(addr) = disconnect_rx.recv() => {
                handle_client_disconnect(addr, &stats, &mut clients);
            }
        }
    }
}

fn handle_client_connect(
    ctx: TcpContext,
    env: &Arc<HandlerEnv>,
    stats: &Arc<dyn StatsHandler>,
    max_connections: u32,
    clients: &mut HashMap<SocketAddr, AbortHandle>,
    disconnect_tx: &mpsc::Sender<SocketAddr>,
) {
    if max_connections > 0 && clients.len() >= max_connections as usize {
        log::warn!(
            "{}: refusing connection from {} — at max_connections={max_connections}",
            env.server_name,
            ctx.client_addr
        );
        return;
    }

    let addr = ctx.client_addr;
    let env = Arc::clone(env);
    let disconnect_tx = disconnect_tx.clone();
    let join = tokio::spawn(async move {
        handler::handle(ctx, &env).await;
        post_disconnect(&disconnect_tx, addr).await;
    });
    clients.insert(addr, join.abort_handle());
    stats.report_connection_count(clients.len() as u64);
}

/// Posts a disconnect event, tolerating the post-`stop` race without
/// tolerating ordinary backpressure. `try_send` covers the common case
/// without blocking; a `Full` error (the rendezvous slot is momentarily
/// occupied by another handler's own disconnect) falls back to a
/// blocking `send` so the event is never silently dropped — that would
/// leak this connection's entry out of `clients` forever. A `Closed`
/// error means the control loop has already exited (post-`stop`), so
/// there is nobody left to wait for.
async fn post_disconnect(disconnect_tx: &mpsc::Sender<SocketAddr>, addr: SocketAddr) {
    match disconnect_tx.try_send(addr) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Closed(_)) => {}
        Err(mpsc::error::TrySendError::Full(addr)) => {
            let _ = disconnect_tx.send(addr).await;
        }
    }
}

fn handle_client_disconnect(
    addr: SocketAddr,
    stats: &Arc<dyn StatsHandler>,
    clients: &mut HashMap<SocketAddr, AbortHandle>,
) {
    clients.remove(&addr);
    stats.report_connection_count(clients.len() as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn post_disconnect_waits_out_a_full_buffer_instead_of_dropping() {
        let (tx, mut rx) = mpsc::channel::<SocketAddr>(RENDEZVOUS_CAPACITY);
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();

        // Fill the single rendezvous slot so a concurrent post must see `Full`.
        tx.try_send(a).unwrap();

        let tx_clone = tx.clone();
        let second = tokio::spawn(async move {
            post_disconnect(&tx_clone, b).await;
        });

        // Drain the first event; this frees capacity for the blocked `send`.
        assert_eq!(rx.recv().await, Some(a));
        second.await.unwrap();
        assert_eq!(rx.recv().await, Some(b));
    }

    #[tokio::test]
    async fn post_disconnect_does_not_block_once_the_receiver_is_closed() {
        let (tx, rx) = mpsc::channel::<SocketAddr>(RENDEZVOUS_CAPACITY);
        drop(rx);
        let addr: SocketAddr = "127.0.0.1:3".parse().unwrap();

        tokio::time::timeout(Duration::from_millis(200), post_disconnect(&tx, addr))
            .await
            .expect("post_disconnect must not block after the control loop has stopped");
    }
}
