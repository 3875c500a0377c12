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

//! The `AccessFilter` external interface: decides per remote IP whether a
//! new connection is allowed.

use std::net::IpAddr;

use crate::config::access::AccessConfig;

/// Decides per remote IP whether a new connection is admitted.
pub trait AccessFilter: Send + Sync {
    fn allows(&self, ip: IpAddr) -> bool;
}

/// An ordered CIDR allow/deny list: the first rule whose network contains
/// the remote IP wins. If no rule matches and at least one rule is
/// configured, the connection is denied (default-deny); an empty rule set
/// allows everything, matching "no access filter configured".
#[derive(Clone, Debug, Default)]
pub struct CidrAccessFilter {
    config: AccessConfig,
}

impl CidrAccessFilter {
    pub fn new(config: AccessConfig) -> Self {
        CidrAccessFilter { config }
    }
}

impl AccessFilter for CidrAccessFilter {
    fn allows(&self, ip: IpAddr) -> bool {
        if self.config.rules.is_empty() {
            return true;
        }
        for rule in &self.config.rules {
            if rule.network.contains(ip) {
                return rule.allow;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::access::AccessRule;
    use ip_network::IpNetwork;

    fn network(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn empty_rules_allow_everything() {
        let filter = CidrAccessFilter::new(AccessConfig::default());
        assert!(filter.allows("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn first_match_wins() {
        let config = AccessConfig {
            rules: vec![
                AccessRule {
                    network: network("10.0.0.0/8"),
                    allow: true,
                },
                AccessRule {
                    network: network("0.0.0.0/0"),
                    allow: false,
                },
            ],
        };
        let filter = CidrAccessFilter::new(config);
        assert!(filter.allows("10.1.2.3".parse().unwrap()));
        assert!(!filter.allows("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn unmatched_ip_is_denied_when_rules_present() {
        let config = AccessConfig {
            rules: vec![AccessRule {
                network: network("10.0.0.0/8"),
                allow: true,
            }],
        };
        let filter = CidrAccessFilter::new(config);
        assert!(!filter.allows("192.168.1.1".parse().unwrap()));
    }
}
