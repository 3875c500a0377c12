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

//! `relaygate` is a per-listener L4 reverse proxy and load balancer: each
//! listener accepts TCP connections, optionally terminates TLS or sniffs
//! the ClientHello SNI, hands the connection to a pluggable [`Scheduler`]
//! for backend selection, and relays bytes bidirectionally until either
//! side closes or an idle timeout fires.
//!
//! Backend discovery, health checking and balancing are not implemented
//! here; they are consumed through the [`Scheduler`] trait.

pub mod access;
pub mod backend;
pub mod config;
pub mod opts;
pub mod scheduler;
pub mod serve;
pub mod stats_handler;

pub use backend::Backend;
pub use scheduler::Scheduler;
pub use serve::{Server, ServerError};
pub use stats_handler::StatsHandler;
