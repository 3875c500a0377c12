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

//! Command line parsing, trimmed down to the flags this single-process
//! core actually needs: no daemonization, control socket or
//! shell-completion surface, since those belong to a process-management
//! layer out of this core's scope.

use std::path::PathBuf;

use anyhow::anyhow;
use clap::{value_parser, Arg, ArgAction, Command, ValueHint};

const ARGS_VERBOSE: &str = "verbose";
const ARGS_TEST_CONFIG: &str = "test-config";
const ARGS_CONFIG_FILE: &str = "config-file";

#[derive(Debug, Default)]
pub struct ProcArgs {
    pub config_file: PathBuf,
    pub test_config: bool,
    pub verbose_level: u8,
}

fn build_cli_args() -> Command {
    Command::new("relaygate")
        .arg(
            Arg::new(ARGS_VERBOSE)
                .help("Show verbose output")
                .num_args(0)
                .action(ArgAction::Count)
                .short('v')
                .long("verbose"),
        )
        .arg(
            Arg::new(ARGS_TEST_CONFIG)
                .help("Test the format of the config file and exit")
                .action(ArgAction::SetTrue)
                .short('t')
                .long("test-config"),
        )
        .arg(
            Arg::new(ARGS_CONFIG_FILE)
                .help("Config file path")
                .num_args(1)
                .value_name("CONFIG FILE")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .required(true)
                .short('c')
                .long("config-file"),
        )
}

pub fn parse_clap() -> anyhow::Result<ProcArgs> {
    let args = build_cli_args().get_matches();

    let mut proc_args = ProcArgs::default();

    if let Some(verbose_level) = args.get_one::<u8>(ARGS_VERBOSE) {
        proc_args.verbose_level = *verbose_level;
    }
    if args.get_flag(ARGS_TEST_CONFIG) {
        proc_args.test_config = true;
    }
    proc_args.config_file = args
        .get_one::<PathBuf>(ARGS_CONFIG_FILE)
        .cloned()
        .ok_or_else(|| anyhow!("no config file given"))?;

    Ok(proc_args)
}

/// Maps `-v` repeats to an `env_logger` filter level, matching the
/// teacher's convention that verbosity is additive and capped at `trace`.
pub fn log_level_for(verbose_level: u8) -> log::LevelFilter {
    match verbose_level {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_level() {
        assert_eq!(log_level_for(0), log::LevelFilter::Info);
        assert_eq!(log_level_for(1), log::LevelFilter::Debug);
        assert_eq!(log_level_for(5), log::LevelFilter::Trace);
    }

    #[test]
    fn requires_config_file() {
        let err = build_cli_args().try_get_matches_from(["relaygate"]).unwrap_err();
        assert!(err.to_string().contains("config-file") || err.to_string().contains("required"));
    }
}
