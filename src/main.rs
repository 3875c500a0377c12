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

//! Process bootstrap: parse CLI args, set up logging, load config, start
//! one [`Server`] per listener, wait for a termination signal, stop them
//! all. Follows `g3proxy`'s `main.rs` top-level shape (parse args → setup
//! logger → load config → `--test-config` early-exit → run → signal →
//! stop), minus the daemon/control-socket machinery this crate doesn't
//! carry here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use log::{error, info};

use relaygate::config::Config;
use relaygate::scheduler::RoundRobinScheduler;
use relaygate::stats_handler::LoggingStatsHandler;
use relaygate::{Backend, Scheduler, Server};

use relaygate::opts;

fn main() -> anyhow::Result<()> {
    let proc_args = opts::parse_clap().context("failed to parse command line options")?;

    env_logger::Builder::new()
        .filter_level(opts::log_level_for(proc_args.verbose_level))
        .init();

    let config = Config::load(&proc_args.config_file)
        .with_context(|| format!("failed to load config file {}", proc_args.config_file.display()))?;
    info!("loaded config from {}", proc_args.config_file.display());

    if proc_args.test_config {
        info!("the format of the config file is ok");
        return Ok(());
    }

    let static_backends = load_static_backends(&proc_args.config_file)
        .context("failed to load the `backends` map alongside the config file")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the tokio runtime")?;
    rt.block_on(run(config, static_backends))
}

/// This reference binary's own scheduler wiring: every listener's backend
/// set is an unordered list of addresses fed into a
/// [`RoundRobinScheduler`]. The core itself never parses this — per spec,
/// discovery/health-check/balance settings are opaque to `ServerConfig`
/// and are the Scheduler's business alone — so this reads a sibling
/// top-level `backends:` map (`server name` → address list) that
/// `Config::parse_str` already ignores.
fn load_static_backends(path: &std::path::Path) -> anyhow::Result<HashMap<String, Vec<Backend>>> {
    use yaml_rust::YamlLoader;

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let docs = YamlLoader::load_from_str(&content).context("invalid yaml document")?;
    let doc = docs
        .first()
        .ok_or_else(|| anyhow!("config file contains no yaml documents"))?;

    let mut out = HashMap::new();
    let Some(map) = doc.as_hash() else {
        return Ok(out);
    };
    let Some((_, backends_val)) = map.iter().find(|(k, _)| k.as_str() == Some("backends")) else {
        return Ok(out);
    };
    let Some(backends_map) = backends_val.as_hash() else {
        return Err(anyhow!("`backends` should be a yaml map of server name to address list"));
    };

    for (server_name, addrs) in backends_map.iter() {
        let server_name = server_name
            .as_str()
            .ok_or_else(|| anyhow!("backends map keys should be strings"))?
            .to_string();
        let addrs = addrs
            .as_vec()
            .ok_or_else(|| anyhow!("backends[{server_name}] should be a yaml list"))?;
        let mut backends = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let s = addr
                .as_str()
                .ok_or_else(|| anyhow!("backends[{server_name}] entries should be strings"))?;
            let addr: SocketAddr = s
                .parse()
                .with_context(|| format!("invalid backend address {s:?} for server {server_name}"))?;
            backends.push(Backend::new(addr));
        }
        out.insert(server_name, backends);
    }
    Ok(out)
}

async fn run(config: Config, static_backends: HashMap<String, Vec<Backend>>) -> anyhow::Result<()> {
    let mut servers = Vec::with_capacity(config.servers.len());
    for cfg in config.servers {
        let name = cfg.name.clone();
        let backends = static_backends.get(&name).cloned().unwrap_or_default();
        if backends.is_empty() {
            info!("server {name}: no backends configured, connections will be refused until an operator supplies some");
        }
        let scheduler: Arc<dyn Scheduler> = Arc::new(RoundRobinScheduler::new(backends));
        let stats = Arc::new(LoggingStatsHandler::new(name.clone()));

        let mut server = Server::new(name.clone(), cfg, scheduler, stats)
            .with_context(|| format!("failed to construct server {name}"))?;
        server
            .start()
            .await
            .with_context(|| format!("failed to start server {name}"))?;
        servers.push(server);
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping all servers");

    for server in &mut servers {
        server.stop().await;
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGINT handler: {e}");
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
