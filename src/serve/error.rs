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

use std::io;

use thiserror::Error;

use crate::scheduler::SchedulerError;

/// The core's error taxonomy. Each variant's recovery policy is fixed:
/// lifecycle errors (`ConfigError`, `BindError`) surface through
/// `Server::new`/`Server::start`; per-connection errors (`AcceptError`
/// excepted) are handled locally by the caller and never escape a handler
/// task.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("bind error: {0}")]
    BindError(#[source] io::Error),

    #[error("accept error: {0}")]
    AcceptError(#[source] io::Error),

    #[error("sni error: {0}")]
    SniError(String),

    #[error("dial error connecting to {backend}: {source}")]
    DialError {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("scheduler error: {0}")]
    SchedulerError(#[from] SchedulerError),

    #[error("relay error: {0}")]
    RelayError(#[source] io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
