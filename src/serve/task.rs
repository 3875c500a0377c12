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

//! Per-connection bookkeeping types threaded from the accept path through
//! the control loop and into the handler.

use std::net::SocketAddr;

use crate::serve::io::AnyStream;

/// Produced by `wrap` at the boundary between the accept path and the
/// control loop, consumed by the handler and passed opaquely to
/// `Scheduler::take_backend`.
pub struct TcpContext {
    /// SNI hostname sniffed from the ClientHello, if `sni` was enabled
    /// and sniffing succeeded. Empty when not configured or not present.
    pub hostname: Option<String>,
    pub client_addr: SocketAddr,
    pub conn: AnyStream,
}

impl TcpContext {
    pub fn new(hostname: Option<String>, client_addr: SocketAddr, conn: AnyStream) -> Self {
        TcpContext {
            hostname,
            client_addr,
            conn,
        }
    }
}

#[cfg(test)]
impl TcpContext {
    /// Test-only constructor: builds a context around a closed pipe, for
    /// scheduler/admission unit tests that never touch the connection.
    pub fn for_test(hostname: Option<String>, client_addr: SocketAddr) -> Self {
        use tokio::io::duplex;

        let (a, _b) = duplex(4096);
        TcpContext {
            hostname,
            client_addr,
            conn: Box::new(a),
        }
    }
}
