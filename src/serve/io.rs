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

//! A single boxed connection type threaded through accept → sniff → TLS
//! wrap → relay, so each stage can swap the concrete stream type (plain
//! `TcpStream`, SNI [`super::sni::ReplayStream`] wrapper, `TlsStream`)
//! without the rest of the pipeline knowing about it.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that can be read from, written to, shut down asynchronously,
/// and sent across a spawned task.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> Stream for T {}

/// A type-erased half-duplex connection. Used for both the client side
/// (after optional SNI sniff / TLS termination) and the backend side
/// (after optional TLS dial).
pub type AnyStream = Box<dyn Stream>;
