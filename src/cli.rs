use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

pub struct CliArgs {
    pub config: PathBuf,
    pub interval: Option<u64>,
    pub once: bool,
}

impl From<ArgMatches> for CliArgs {
    fn from(matches: ArgMatches) -> Self {
        CliArgs {
            config: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("portwatch.toml")),
            interval: matches.get_one::<u64>("watch").copied(),
            once: matches.get_flag("once"),
        }
    }
}

pub fn configure_cli() -> CliArgs {
    let matches = Command::new("portwatch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("watch Portainer containers for image updates")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the configuration file")
                .value_name("FILE")
                .default_value("portwatch.toml")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("watch")
                .short('w')
                .long("watch")
                .help("Override the polling interval in seconds")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Run a single refresh cycle and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();
    matches.into()
}
