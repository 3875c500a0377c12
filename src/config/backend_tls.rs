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

use super::yaml::{as_bool, as_string, foreach_kv};

/// TLS dialer settings for connecting to backends: the same shape as
/// `tls` plus insecure-skip-verify and a root CA path.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendTlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    pub insecure_skip_verify: bool,
    pub root_ca_cert_path: Option<PathBuf>,
}

impl BackendTlsConfig {
    pub fn parse(v: &Yaml) -> anyhow::Result<Self> {
        let map = v
            .as_hash()
            .ok_or_else(|| anyhow!("backends_tls config should be a yaml map"))?;

        let mut config = BackendTlsConfig::default();
        foreach_kv(map, |k, v| match k {
            "cert_path" | "cert" => {
                config.cert_path = Some(PathBuf::from(as_string(v)?));
                Ok(())
            }
            "key_path" | "key" => {
                config.key_path = Some(PathBuf::from(as_string(v)?));
                Ok(())
            }
            "min_version" => {
                config.min_version = Some(as_string(v)?);
                Ok(())
            }
            "max_version" => {
                config.max_version = Some(as_string(v)?);
                Ok(())
            }
            "insecure_skip_verify" | "ignore_verify" => {
                config.insecure_skip_verify = as_bool(v)?;
                Ok(())
            }
            "root_ca_cert_path" | "root_ca" | "ca_cert" => {
                config.root_ca_cert_path = Some(PathBuf::from(as_string(v)?));
                Ok(())
            }
            _ => Err(anyhow!("invalid key {k} in backends_tls config")),
        })?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yaml_rust::YamlLoader;

    #[test]
    fn defaults_to_verifying_dialer() {
        let docs = YamlLoader::load_from_str("{}\n").unwrap();
        let cfg = BackendTlsConfig::parse(&docs[0]).unwrap();
        assert!(!cfg.insecure_skip_verify);
        assert!(cfg.root_ca_cert_path.is_none());
    }

    #[test]
    fn parses_insecure_skip_verify() {
        let docs = YamlLoader::load_from_str("insecure_skip_verify: true\n").unwrap();
        let cfg = BackendTlsConfig::parse(&docs[0]).unwrap();
        assert!(cfg.insecure_skip_verify);
    }
}
