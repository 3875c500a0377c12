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

use std::path::PathBuf;

use anyhow::anyhow;
use yaml_rust::Yaml;

use super::yaml::{as_bool, as_string, as_string_list, foreach_kv};

/// TLS terminator settings loaded from static cert/key files.
#[derive(Clone, Debug, PartialEq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ciphers: Option<Vec<String>>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    pub prefer_server_ciphers: bool,
    pub session_tickets: bool,
}

impl TlsConfig {
    pub fn parse(v: &Yaml) -> anyhow::Result<Self> {
        let map = v
            .as_hash()
            .ok_or_else(|| anyhow!("tls config should be a yaml map"))?;

        let mut cert_path = None;
        let mut key_path = None;
        let mut ciphers = None;
        let mut min_version = None;
        let mut max_version = None;
        let mut prefer_server_ciphers = false;
        let mut session_tickets = true;

        foreach_kv(map, |k, v| match k {
            "cert_path" | "cert" => {
                cert_path = Some(PathBuf::from(as_string(v)?));
                Ok(())
            }
            "key_path" | "key" => {
                key_path = Some(PathBuf::from(as_string(v)?));
                Ok(())
            }
            "ciphers" => {
                ciphers = Some(as_string_list(v)?);
                Ok(())
            }
            "min_version" => {
                min_version = Some(as_string(v)?);
                Ok(())
            }
            "max_version" => {
                max_version = Some(as_string(v)?);
                Ok(())
            }
            "prefer_server_ciphers" => {
                prefer_server_ciphers = as_bool(v)?;
                Ok(())
            }
            "session_tickets" => {
                session_tickets = as_bool(v)?;
                Ok(())
            }
            _ => Err(anyhow!("invalid key {k} in tls config")),
        })?;

        Ok(TlsConfig {
            cert_path: cert_path.ok_or_else(|| anyhow!("tls config is missing cert_path"))?,
            key_path: key_path.ok_or_else(|| anyhow!("tls config is missing key_path"))?,
            ciphers,
            min_version,
            max_version,
            prefer_server_ciphers,
            session_tickets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yaml_rust::YamlLoader;

    #[test]
    fn parses_minimal_tls_config() {
        let docs = YamlLoader::load_from_str(
            r#"
cert_path: /etc/relaygate/tls/cert.pem
key_path: /etc/relaygate/tls/key.pem
"#,
        )
        .unwrap();
        let cfg = TlsConfig::parse(&docs[0]).unwrap();
        assert_eq!(cfg.cert_path, PathBuf::from("/etc/relaygate/tls/cert.pem"));
        assert!(cfg.session_tickets);
        assert!(!cfg.prefer_server_ciphers);
    }

    #[test]
    fn missing_cert_path_is_an_error() {
        let docs = YamlLoader::load_from_str("key_path: /k.pem\n").unwrap();
        assert!(TlsConfig::parse(&docs[0]).is_err());
    }
}
