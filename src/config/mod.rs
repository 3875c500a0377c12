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

//! Configuration loading and validation: one [`server::ServerConfig`] per
//! listener, loaded from a top-level `servers:` list in a YAML document.

pub mod access;
pub mod acme;
pub mod backend_tls;
pub mod duration;
pub mod server;
pub mod tls;
mod yaml;

use std::path::Path;

use anyhow::{anyhow, Context};
use yaml_rust::YamlLoader;

pub use server::{ListenConfig, Protocol, ServerConfig, SniConfig};

/// The top-level config document: a list of independent listeners.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Config::parse_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn parse_str(content: &str) -> anyhow::Result<Self> {
        let docs = YamlLoader::load_from_str(content).context("invalid yaml document")?;
        let doc = docs
            .first()
            .ok_or_else(|| anyhow!("config file contains no yaml documents"))?;
        let map = doc
            .as_hash()
            .ok_or_else(|| anyhow!("top level config should be a yaml map"))?;

        let servers_key = map
            .iter()
            .find(|(k, _)| k.as_str() == Some("servers"))
            .map(|(_, v)| v)
            .ok_or_else(|| anyhow!("config is missing a top-level `servers` list"))?;
        let servers_arr = servers_key
            .as_vec()
            .ok_or_else(|| anyhow!("`servers` should be a yaml list"))?;

        let mut servers = Vec::with_capacity(servers_arr.len());
        for (i, entry) in servers_arr.iter().enumerate() {
            let map = entry
                .as_hash()
                .ok_or_else(|| anyhow!("servers[{i}] should be a yaml map"))?;
            let cfg = ServerConfig::parse(map)
                .with_context(|| format!("invalid config for servers[{i}]"))?;
            servers.push(cfg);
        }

        let config = Config { servers };
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> anyhow::Result<()> {
        let mut names = std::collections::HashSet::new();
        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                return Err(anyhow!("duplicate server name {:?}", server.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_servers() {
        let config = Config::parse_str(
            r#"
servers:
  - name: plain
    listen: "127.0.0.1:9000"
  - name: tls_term
    listen: "127.0.0.1:9443"
    protocol: tls
    tls:
      cert_path: /etc/relaygate/cert.pem
      key_path: /etc/relaygate/key.pem
"#,
        )
        .unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].name, "plain");
        assert_eq!(config.servers[1].name, "tls_term");
    }

    #[test]
    fn rejects_duplicate_server_names() {
        let err = Config::parse_str(
            r#"
servers:
  - name: dup
    listen: "127.0.0.1:9000"
  - name: dup
    listen: "127.0.0.1:9001"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_missing_servers_key() {
        assert!(Config::parse_str("foo: bar\n").is_err());
    }
}
