// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{env, fs, io, path::PathBuf, sync::Mutex};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
pub use hooks::Hooks;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod common;
pub mod config;
pub mod consts;
pub mod hooks;
pub mod install;
pub mod manager;
pub mod protocol;
pub mod session;
mod signals;
pub mod supervise;
pub mod worker;

/// The command line arguments that gridpool expects.
/// These can be directly parsed with clap or manually
/// constructed in order to present some other user
/// interface.
///
/// NOTE: You must check `version()` and handle it yourself
/// if it is set. Clap won't do a good job with its
/// automatic version support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

By default logs go to stderr."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(
        short,
        long,
        action,
        long_help = "The directory holding plug-in installs and cached archives

This defaults to $XDG_DATA_HOME/gridpool or ~/.local/share/gridpool
if XDG_DATA_HOME is unset."
    )]
    pub data_dir: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that gridpool supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Runs the grid manager: hosts the manager plug-in process,
accepts workers, and ships them the worker plug-in payload.

Operator commands typed on stdin are forwarded to the manager
plug-in verbatim.")]
    Manager {
        #[clap(short, long, help = "TCP port to listen on, overrides the config file")]
        port: Option<u16>,
        #[clap(
            long,
            help = "Install this zip archive as the manager plug-in before starting"
        )]
        manager_archive: Option<String>,
        #[clap(
            long,
            help = "Install this zip archive as the worker payload before starting"
        )]
        worker_archive: Option<String>,
    },

    #[clap(about = "Runs a grid worker: dials the manager and keeps
re-dialing until shut down. The worker plug-in arrives over the wire,
so there is nothing to install up front.")]
    Worker {
        #[clap(long, help = "Manager address to dial, overrides the config file")]
        server_ip: Option<String>,
        #[clap(short, long, help = "Manager port to dial, overrides the config file")]
        port: Option<u16>,
    },
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run the gridpool tool with the given arguments. If hooks is
/// provided, inject the callbacks into the router.
pub fn run(args: Args, hooks: Option<Box<dyn hooks::Hooks + Send + Sync>>) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let mut config = config::read_config(&args.config_file)?;

    let data_dir = match args.data_dir {
        Some(dir) => PathBuf::from(dir),
        None => match env::var("XDG_DATA_HOME") {
            Ok(data_home) => PathBuf::from(data_home),
            Err(_) => PathBuf::from(env::var("HOME").context("no XDG_DATA_HOME or HOME")?)
                .join(".local")
                .join("share"),
        }
        .join("gridpool"),
    };

    let hooks = hooks.unwrap_or(Box::new(hooks::NoopHooks {}));

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Manager { port, manager_archive, worker_archive } => {
            if let Some(port) = port {
                config.server_port = Some(port);
            }
            manager::run(
                config,
                data_dir,
                hooks,
                manager::ManagerArgs { manager_archive, worker_archive },
            )
        }
        Commands::Worker { server_ip, port } => {
            if let Some(server_ip) = server_ip {
                config.server_ip = Some(server_ip);
            }
            if let Some(port) = port {
                config.server_port = Some(port);
            }
            worker::run(config, data_dir, hooks)
        }
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
