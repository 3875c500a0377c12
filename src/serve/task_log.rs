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

//! Structured per-connection completion log, the `slog` half of the dual
//! logging scheme (the `log` facade carries lifecycle events; this carries
//! one record per finished connection). Trimmed down from the teacher's
//! `TaskLogForTcpConnect` to the fields this core actually owns — no
//! user/escaper/resolver notes, since those belong to subsystems out of
//! scope here.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use slog::{slog_info, Logger};

use crate::backend::Backend;

pub struct TaskLogForTcpConnect<'a> {
    pub server_name: &'a str,
    pub client_addr: SocketAddr,
    pub hostname: Option<&'a str>,
    pub backend: Option<&'a Backend>,
    /// Wall-clock stamp of task creation, logged alongside the monotonic
    /// `start_at` — the same `DateTime<Utc>` + `Instant` pairing the
    /// teacher's `serve::task::ServerTaskNotes` carries (`start_at` for
    /// reporting, a separate `Instant` for elapsed-time math).
    pub start_at_utc: DateTime<Utc>,
    pub start_at: Instant,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl TaskLogForTcpConnect<'_> {
    pub fn log(&self, logger: &Logger, reason: &str) {
        slog_info!(logger, "{}", reason;
            "task_type" => "TcpConnect",
            "server" => self.server_name,
            "client_addr" => self.client_addr,
            "sni_hostname" => self.hostname.unwrap_or(""),
            "backend" => self.backend.map(|b| b.to_string()).unwrap_or_default(),
            "start_at" => self.start_at_utc.to_rfc3339(),
            "total_time" => format_duration(self.start_at.elapsed()),
            "rx_bytes" => self.rx_bytes,
            "tx_bytes" => self.tx_bytes,
        )
    }
}

fn format_duration(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}
