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

//! Small YAML value helpers, narrowly reimplementing the slice of
//! `g3_yaml::{foreach_kv, value::*}` this crate needs (that crate has no
//! available source in the retrieval pack).

use anyhow::anyhow;
use yaml_rust::{yaml, Yaml};

/// Normalizes a config key: lowercase, `-` and ` ` folded to `_`, so
/// `client-idle-timeout`, `Client Idle Timeout` and `client_idle_timeout`
/// are all equivalent.
pub fn normalize(k: &str) -> String {
    k.to_lowercase().replace(['-', ' '], "_")
}

/// Drives a per-key parse callback over a YAML mapping, normalizing keys
/// first, mirroring `g3_yaml::foreach_kv`'s dispatch-loop convention.
pub fn foreach_kv<F>(map: &yaml::Hash, mut f: F) -> anyhow::Result<()>
where
    F: FnMut(&str, &Yaml) -> anyhow::Result<()>,
{
    for (k, v) in map.iter() {
        let key = k
            .as_str()
            .ok_or_else(|| anyhow!("yaml map keys should be strings"))?;
        f(key, v)?;
    }
    Ok(())
}

pub fn as_string(v: &Yaml) -> anyhow::Result<String> {
    v.as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("yaml value should be a string"))
}

pub fn as_bool(v: &Yaml) -> anyhow::Result<bool> {
    match v {
        Yaml::Boolean(b) => Ok(*b),
        Yaml::String(s) => match s.as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(anyhow!("invalid bool string {s:?}")),
        },
        _ => Err(anyhow!("yaml value should be a bool")),
    }
}

pub fn as_u32(v: &Yaml) -> anyhow::Result<u32> {
    v.as_i64()
        .ok_or_else(|| anyhow!("yaml value should be an integer"))
        .and_then(|i| u32::try_from(i).map_err(|_| anyhow!("integer {i} out of range for u32")))
}

pub fn as_u16(v: &Yaml) -> anyhow::Result<u16> {
    v.as_i64()
        .ok_or_else(|| anyhow!("yaml value should be an integer"))
        .and_then(|i| u16::try_from(i).map_err(|_| anyhow!("integer {i} out of range for u16")))
}

pub fn as_string_list(v: &Yaml) -> anyhow::Result<Vec<String>> {
    match v {
        Yaml::Array(arr) => arr.iter().map(as_string).collect(),
        Yaml::String(_) => Ok(vec![as_string(v)?]),
        _ => Err(anyhow!("yaml value should be a string or a list of strings")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_keys() {
        assert_eq!(normalize("Client-Idle Timeout"), "client_idle_timeout");
    }

    #[test]
    fn bool_accepts_common_spellings() {
        assert!(as_bool(&Yaml::String("yes".into())).unwrap());
        assert!(!as_bool(&Yaml::String("off".into())).unwrap());
        assert!(as_bool(&Yaml::Boolean(true)).unwrap());
    }
}
