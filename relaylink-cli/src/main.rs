// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use std::{path::PathBuf, time::Duration};

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use relaylink::{common::dispatch::OverflowPolicy, util};

use util::validators::{
  parse_positive_u64, validate_non_empty, validate_positive_u64, validate_relay_url,
};

mod pair;
mod run;

const DEFAULT_CONFIG_PATH: &str = "relaylink.json";

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relaylink=info,info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let config_arg = Arg::new("config")
    .long("config")
    .short('c')
    .help("Path of the JSON file holding the relay pairing")
    .takes_value(true)
    .default_value(DEFAULT_CONFIG_PATH);
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("run")
        .about("Connect to the relay and serve tunnelled requests until interrupted")
        .arg(config_arg.clone())
        .arg(
          Arg::new("max-in-flight")
            .long("max-in-flight")
            .help("Limit on concurrently executing requests; unlimited when absent")
            .validator(validate_positive_u64)
            .takes_value(true),
        )
        .arg(
          Arg::new("overflow")
            .long("overflow")
            .help("What to do with requests beyond --max-in-flight")
            .possible_values(["queue", "reject"])
            .default_value("queue")
            .takes_value(true),
        )
        .arg(
          Arg::new("heartbeat-secs")
            .long("heartbeat-secs")
            .validator(validate_positive_u64)
            .default_value("30")
            .takes_value(true),
        )
        .arg(
          Arg::new("liveness-timeout-secs")
            .long("liveness-timeout-secs")
            .help("Drop the connection when the relay is silent this long")
            .validator(validate_positive_u64)
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("pair")
        .about("Store the relay URL and pairing token used by `run`")
        .arg(config_arg)
        .arg(
          Arg::new("relay-url")
            .long("relay-url")
            .short('r')
            .validator(validate_relay_url)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("token")
            .long("token")
            .short('t')
            .validator(validate_non_empty)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("relaylink-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn config_path(args: &'_ ArgMatches) -> PathBuf {
  PathBuf::from(args.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH))
}

fn optional_secs(args: &'_ ArgMatches, name: &str) -> Result<Option<Duration>> {
  args
    .value_of(name)
    .map(|raw| parse_positive_u64(raw).map(Duration::from_secs))
    .transpose()
    .with_context(|| format!("Invalid --{}", name))
}

pub fn run_arg_handling(args: &'_ ArgMatches) -> Result<run::ConnectorArgs> {
  let max_in_flight = args
    .value_of("max-in-flight")
    .map(parse_positive_u64)
    .transpose()
    .context("Invalid --max-in-flight")?
    .map(|n| usize::try_from(n).unwrap_or(usize::MAX));
  let overflow = match args.value_of("overflow") {
    Some("reject") => OverflowPolicy::Reject,
    _ => OverflowPolicy::Queue,
  };
  Ok(run::ConnectorArgs {
    config_path: config_path(args),
    max_in_flight,
    overflow,
    heartbeat_interval: optional_secs(args, "heartbeat-secs")?,
    liveness_timeout: optional_secs(args, "liveness-timeout-secs")?,
  })
}

pub fn pair_arg_handling(args: &'_ ArgMatches) -> Result<pair::PairArgs> {
  Ok(pair::PairArgs {
    config_path: config_path(args),
    relay_url: args
      .value_of("relay-url")
      .context("--relay-url is required")?
      .into(),
    token: args.value_of("token").context("--token is required")?.into(),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("run", opts)) => {
      let config = run_arg_handling(opts)?;
      tracing::info!("Running connector with config {:#?}", config);
      run::run_main(config).await
    }
    Some(("pair", opts)) => {
      let config = pair_arg_handling(opts)?;
      pair::pair_main(config).await
    }
    _ => anyhow::bail!("A subcommand is required"),
  }
}
