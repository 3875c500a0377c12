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

use super::yaml::{as_string, as_string_list, foreach_kv};

/// ACME-issued certificate settings. An empty host whitelist is accepted
/// at parse time: construction succeeds, and the TLS handshake simply
/// fails for any SNI.
#[derive(Clone, Debug, PartialEq)]
pub struct AcmeConfig {
    pub hosts: Vec<String>,
    pub cache_dir: PathBuf,
    pub directory_url: String,
    pub contact_email: Option<String>,
}

const DEFAULT_CACHE_DIR: &str = "/tmp";
const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

impl AcmeConfig {
    pub fn parse(v: &Yaml) -> anyhow::Result<Self> {
        let map = v
            .as_hash()
            .ok_or_else(|| anyhow!("acme config should be a yaml map"))?;

        let mut hosts = Vec::new();
        let mut cache_dir = PathBuf::from(DEFAULT_CACHE_DIR);
        let mut directory_url = LETS_ENCRYPT_PRODUCTION.to_string();
        let mut contact_email = None;

        foreach_kv(map, |k, v| match k {
            "hosts" => {
                hosts = as_string_list(v)?;
                Ok(())
            }
            "cache_dir" => {
                cache_dir = PathBuf::from(as_string(v)?);
                Ok(())
            }
            "directory_url" | "directory" => {
                directory_url = as_string(v)?;
                Ok(())
            }
            "contact_email" | "email" => {
                contact_email = Some(as_string(v)?);
                Ok(())
            }
            _ => Err(anyhow!("invalid key {k} in acme config")),
        })?;

        Ok(AcmeConfig {
            hosts,
            cache_dir,
            directory_url,
            contact_email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yaml_rust::YamlLoader;

    #[test]
    fn defaults_cache_dir_and_directory() {
        let docs = YamlLoader::load_from_str("hosts: [example.com]\n").unwrap();
        let cfg = AcmeConfig::parse(&docs[0]).unwrap();
        assert_eq!(cfg.cache_dir, PathBuf::from("/tmp"));
        assert_eq!(cfg.directory_url, LETS_ENCRYPT_PRODUCTION);
    }

    #[test]
    fn empty_host_whitelist_is_accepted() {
        let docs = YamlLoader::load_from_str("cache_dir: /var/cache/acme\n").unwrap();
        let cfg = AcmeConfig::parse(&docs[0]).unwrap();
        assert!(cfg.hosts.is_empty());
    }
}
