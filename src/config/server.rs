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

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use yaml_rust::{yaml, Yaml};

use super::access::AccessConfig;
use super::acme::AcmeConfig;
use super::backend_tls::BackendTlsConfig;
use super::duration::{as_duration, as_optional_duration};
use super::tls::TlsConfig;
use super::yaml::{as_string, as_u16, as_u32, foreach_kv, normalize};

/// Whether the listener speaks plain TCP or terminates TLS.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Tcp,
    Tls,
}

/// `sni.read_timeout`, defaulting to 2s.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SniConfig {
    pub read_timeout: Duration,
}

impl Default for SniConfig {
    fn default() -> Self {
        SniConfig {
            read_timeout: Duration::from_secs(2),
        }
    }
}

impl SniConfig {
    fn parse(v: &Yaml) -> anyhow::Result<Self> {
        let mut config = SniConfig::default();
        match v {
            Yaml::Boolean(true) => Ok(config),
            Yaml::Hash(map) => {
                foreach_kv(map, |k, v| match k {
                    "read_timeout" => {
                        config.read_timeout = as_duration(v)?;
                        Ok(())
                    }
                    _ => Err(anyhow!("invalid key {k} in sni config")),
                })?;
                Ok(config)
            }
            _ => Err(anyhow!("sni config should be `true` or a yaml map")),
        }
    }
}

/// Listen socket settings. `instances` supplements a single accept task
/// with `SO_REUSEPORT` scale-out; `1` preserves a single listener.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenConfig {
    pub bind: SocketAddr,
    pub instances: u16,
    pub backlog: u32,
}

impl ListenConfig {
    fn parse(v: &Yaml) -> anyhow::Result<Self> {
        match v {
            Yaml::String(s) => Ok(ListenConfig {
                bind: s
                    .parse()
                    .with_context(|| format!("invalid bind address {s:?}"))?,
                instances: 1,
                backlog: 1024,
            }),
            Yaml::Hash(map) => {
                let mut bind = None;
                let mut instances = 1u16;
                let mut backlog = 1024u32;
                foreach_kv(map, |k, v| match k {
                    "address" | "addr" | "bind" => {
                        let s = as_string(v)?;
                        bind = Some(
                            s.parse()
                                .with_context(|| format!("invalid bind address {s:?}"))?,
                        );
                        Ok(())
                    }
                    "instances" => {
                        instances = as_u16(v)?;
                        Ok(())
                    }
                    "backlog" => {
                        backlog = as_u32(v)?;
                        Ok(())
                    }
                    _ => Err(anyhow!("invalid key {k} in listen config")),
                })?;
                Ok(ListenConfig {
                    bind: bind.ok_or_else(|| anyhow!("listen config is missing an address"))?,
                    instances: instances.max(1),
                    backlog,
                })
            }
            _ => Err(anyhow!("listen config should be an address string or a yaml map")),
        }
    }
}

/// One listener's full configuration, immutable after construction.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub name: String,
    pub listen: ListenConfig,
    pub protocol: Protocol,
    pub sni: Option<SniConfig>,
    pub tls: Option<TlsConfig>,
    pub acme: Option<AcmeConfig>,
    pub backends_tls: Option<BackendTlsConfig>,
    pub access: Option<AccessConfig>,
    pub max_connections: u32,
    pub backend_connection_timeout: Option<Duration>,
    pub client_idle_timeout: Option<Duration>,
    pub backend_idle_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn parse(map: &yaml::Hash) -> anyhow::Result<Self> {
        let mut name = None;
        let mut listen = None;
        let mut protocol = Protocol::Tcp;
        let mut sni = None;
        let mut tls = None;
        let mut acme = None;
        let mut backends_tls = None;
        let mut access = None;
        let mut max_connections = 0u32;
        let mut backend_connection_timeout = None;
        let mut client_idle_timeout = None;
        let mut backend_idle_timeout = None;

        foreach_kv(map, |k, v| match normalize(k).as_str() {
            "name" => {
                name = Some(as_string(v)?);
                Ok(())
            }
            "listen" | "bind" => {
                listen = Some(ListenConfig::parse(v).context("invalid listen config")?);
                Ok(())
            }
            "protocol" => {
                let s = as_string(v)?;
                protocol = match s.as_str() {
                    "tcp" => Protocol::Tcp,
                    "tls" => Protocol::Tls,
                    _ => return Err(anyhow!("invalid protocol {s:?}, expected tcp or tls")),
                };
                Ok(())
            }
            "sni" => {
                sni = Some(SniConfig::parse(v).context("invalid sni config")?);
                Ok(())
            }
            "tls" => {
                tls = Some(TlsConfig::parse(v).context("invalid tls config")?);
                Ok(())
            }
            "acme" => {
                acme = Some(AcmeConfig::parse(v).context("invalid acme config")?);
                Ok(())
            }
            "backends_tls" | "backend_tls" => {
                backends_tls =
                    Some(BackendTlsConfig::parse(v).context("invalid backends_tls config")?);
                Ok(())
            }
            "access" => {
                access = Some(AccessConfig::parse(v).context("invalid access config")?);
                Ok(())
            }
            "max_connections" => {
                max_connections = as_u32(v)?;
                Ok(())
            }
            "backend_connection_timeout" => {
                backend_connection_timeout =
                    as_optional_duration(v).context("invalid backend_connection_timeout")?;
                Ok(())
            }
            "client_idle_timeout" => {
                client_idle_timeout =
                    as_optional_duration(v).context("invalid client_idle_timeout")?;
                Ok(())
            }
            "backend_idle_timeout" => {
                backend_idle_timeout =
                    as_optional_duration(v).context("invalid backend_idle_timeout")?;
                Ok(())
            }
            other => Err(anyhow!("invalid key {other} in server config")),
        })?;

        let config = ServerConfig {
            name: name.ok_or_else(|| anyhow!("server config is missing a name"))?,
            listen: listen.ok_or_else(|| anyhow!("server config is missing listen/bind"))?,
            protocol,
            sni,
            tls,
            acme,
            backends_tls,
            access,
            max_connections,
            backend_connection_timeout,
            client_idle_timeout,
            backend_idle_timeout,
        };
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            return Err(anyhow!("name must not be empty"));
        }
        if self.protocol == Protocol::Tls && self.tls.is_none() && self.acme.is_none() {
            return Err(anyhow!(
                "protocol is tls but neither tls nor acme is configured"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yaml_rust::YamlLoader;

    fn parse(src: &str) -> anyhow::Result<ServerConfig> {
        let docs = YamlLoader::load_from_str(src).unwrap();
        ServerConfig::parse(docs[0].as_hash().unwrap())
    }

    #[test]
    fn parses_minimal_tcp_server() {
        let cfg = parse(
            r#"
name: plain
listen: "127.0.0.1:9000"
"#,
        )
        .unwrap();
        assert_eq!(cfg.name, "plain");
        assert_eq!(cfg.protocol, Protocol::Tcp);
        assert_eq!(cfg.listen.instances, 1);
        assert_eq!(cfg.max_connections, 0);
    }

    #[test]
    fn tls_protocol_requires_tls_or_acme() {
        let err = parse(
            r#"
name: broken
listen: "127.0.0.1:9443"
protocol: tls
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tls"));
    }

    #[test]
    fn parses_full_server_with_instances_and_access() {
        let cfg = parse(
            r#"
name: full
listen:
  address: "0.0.0.0:9443"
  instances: 4
  backlog: 2048
protocol: tls
tls:
  cert_path: /etc/relaygate/cert.pem
  key_path: /etc/relaygate/key.pem
max_connections: 100
client_idle_timeout: "30s"
backend_idle_timeout: "30s"
backend_connection_timeout: "2s"
access:
  rules:
    - network: "0.0.0.0/0"
      action: allow
"#,
        )
        .unwrap();
        assert_eq!(cfg.listen.instances, 4);
        assert_eq!(cfg.listen.backlog, 2048);
        assert_eq!(cfg.max_connections, 100);
        assert_eq!(
            cfg.client_idle_timeout,
            Some(std::time::Duration::from_secs(30))
        );
        assert!(cfg.access.is_some());
    }

    #[test]
    fn zero_duration_means_unbounded() {
        let cfg = parse(
            r#"
name: unbounded
listen: "127.0.0.1:9000"
client_idle_timeout: "0"
"#,
        )
        .unwrap();
        assert_eq!(cfg.client_idle_timeout, None);
    }
}
