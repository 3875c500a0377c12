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

//! Humanized duration strings for config fields, e.g. `"2s"`, `"500ms"`,
//! `"1m"`, or a bare `"0"` meaning unbounded. A narrow reimplementation of
//! what `g3_yaml::humanize::as_duration` provides, since that crate has no
//! available source in the retrieval pack.

use std::time::Duration;

use anyhow::{anyhow, Context};
use yaml_rust::Yaml;

pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let split_at = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| anyhow!("no unit suffix found in duration string {s:?}"))?;
    let (value, unit) = s.split_at(split_at);
    let value: f64 = value
        .parse()
        .with_context(|| format!("invalid numeric duration value in {s:?}"))?;

    let secs = match unit {
        "ns" => value / 1_000_000_000.0,
        "us" | "µs" => value / 1_000_000.0,
        "ms" => value / 1_000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        _ => return Err(anyhow!("unsupported duration unit {unit:?} in {s:?}")),
    };
    if secs < 0.0 {
        return Err(anyhow!("duration value {s:?} must not be negative"));
    }
    Ok(Duration::from_secs_f64(secs))
}

pub fn as_duration(v: &Yaml) -> anyhow::Result<Duration> {
    match v {
        Yaml::String(s) => parse_duration(s),
        Yaml::Integer(i) => {
            if *i < 0 {
                Err(anyhow!("duration integer value must not be negative"))
            } else {
                Ok(Duration::from_secs(*i as u64))
            }
        }
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .with_context(|| format!("invalid float duration value {s:?}"))?;
            Ok(Duration::from_secs_f64(f))
        }
        _ => Err(anyhow!("yaml value type for duration should be string or integer")),
    }
}

/// A zero duration means "unbounded"/"disabled" everywhere this crate uses
/// a duration (idle timeouts, connect timeout). `Option::None` is used in
/// the in-memory config shape to make that explicit at call sites.
pub fn as_optional_duration(v: &Yaml) -> anyhow::Result<Option<Duration>> {
    let d = as_duration(v)?;
    Ok(if d.is_zero() { None } else { Some(d) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_units() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn rejects_bad_unit() {
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn optional_duration_zero_is_none() {
        assert_eq!(as_optional_duration(&Yaml::String("0".into())).unwrap(), None);
        assert_eq!(
            as_optional_duration(&Yaml::String("2s".into())).unwrap(),
            Some(Duration::from_secs(2))
        );
    }
}
