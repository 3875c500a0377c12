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

use anyhow::{anyhow, Context};
use ip_network::IpNetwork;
use yaml_rust::{yaml, Yaml};

use super::yaml::{as_bool, as_string, foreach_kv};

/// One ordered allow/deny rule over a CIDR network. First match wins, see
/// `access::CidrAccessFilter`.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessRule {
    pub network: IpNetwork,
    pub allow: bool,
}

/// Parsed `access.rules` config.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccessConfig {
    pub rules: Vec<AccessRule>,
}

impl AccessConfig {
    pub fn parse(v: &Yaml) -> anyhow::Result<Self> {
        let map = v
            .as_hash()
            .ok_or_else(|| anyhow!("access config should be a yaml map"))?;

        let mut config = AccessConfig::default();
        foreach_kv(map, |k, v| match k {
            "rules" => {
                config.rules = parse_rules(v).context("invalid access rules")?;
                Ok(())
            }
            _ => Err(anyhow!("invalid key {k} in access config")),
        })?;
        Ok(config)
    }
}

fn parse_rules(v: &Yaml) -> anyhow::Result<Vec<AccessRule>> {
    let arr = v
        .as_vec()
        .ok_or_else(|| anyhow!("access.rules should be a yaml list"))?;
    arr.iter().map(parse_rule).collect()
}

fn parse_rule(v: &Yaml) -> anyhow::Result<AccessRule> {
    let map = v
        .as_hash()
        .ok_or_else(|| anyhow!("each access rule should be a yaml map"))?;

    let mut network = None;
    let mut allow = None;
    foreach_kv(map, |k, v| match k {
        "network" | "cidr" => {
            let s = as_string(v)?;
            network = Some(
                s.parse::<IpNetwork>()
                    .map_err(|e| anyhow!("invalid cidr network {s:?}: {e}"))?,
            );
            Ok(())
        }
        "action" => {
            let s = as_string(v)?;
            allow = Some(match s.as_str() {
                "allow" | "permit" => true,
                "deny" | "forbid" | "block" => false,
                _ => return Err(anyhow!("invalid access rule action {s:?}")),
            });
            Ok(())
        }
        "allow" => {
            allow = Some(as_bool(v)?);
            Ok(())
        }
        _ => Err(anyhow!("invalid key {k} in access rule")),
    })?;

    Ok(AccessRule {
        network: network.ok_or_else(|| anyhow!("access rule is missing a network"))?,
        allow: allow.ok_or_else(|| anyhow!("access rule is missing an action"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use yaml_rust::YamlLoader;

    #[test]
    fn parses_rule_list() {
        let docs = YamlLoader::load_from_str(
            r#"
rules:
  - network: "10.0.0.0/8"
    action: allow
  - network: "0.0.0.0/0"
    action: deny
"#,
        )
        .unwrap();
        let cfg = AccessConfig::parse(&docs[0]).unwrap();
        assert_eq!(cfg.rules.len(), 2);
        assert!(cfg.rules[0].allow);
        assert!(!cfg.rules[1].allow);
    }

    #[test]
    fn rejects_bad_network() {
        let docs = YamlLoader::load_from_str(
            r#"
rules:
  - network: "not-a-cidr"
    action: allow
"#,
        )
        .unwrap();
        assert!(AccessConfig::parse(&docs[0]).is_err());
    }
}
