//! Command line of the bridge binaries.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser};

#[derive(Parser, Debug, Clone)]
#[command(about = "Zigbee2MQTT to HomeKit bridge", version)]
pub struct BridgeArgs {
    /// JSON5 configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Log level, overriding `logging.level` (trace|debug|info|warn|error).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl BridgeArgs {
    /// Parse the process arguments, reading `default_config` when
    /// `--config` is absent.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        Self::parse_from_with_default(std::env::args_os(), default_config)
    }

    /// Like [`parse_with_default`](Self::parse_with_default) for an explicit
    /// argument list. Invalid arguments print usage and exit.
    pub fn parse_from_with_default<I, T>(args: I, default_config: &'static str) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command()
            .mut_arg("config", |arg| arg.default_value(default_config))
            .get_matches_from(args);

        Self::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
    }
}
