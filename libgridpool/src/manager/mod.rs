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

use std::{
    fs,
    io::{self, BufRead as _},
    path::{Path, PathBuf},
    thread,
};

use anyhow::{anyhow, Context};
use tracing::{info, instrument, warn};

use crate::{
    config,
    hooks,
    install::{self, Role},
    signals,
    supervise::Supervisor,
};

pub mod router;
mod server;

pub struct ManagerArgs {
    /// Install this archive as the manager plug-in before starting.
    pub manager_archive: Option<String>,
    /// Install this archive as the worker payload before starting.
    pub worker_archive: Option<String>,
}

/// Run the grid manager until it is shut down: install any archives
/// handed over on the command line, boot the manager plug-in, open the
/// listening socket, and let the router take it from there.
#[instrument(skip_all)]
pub fn run(
    config: config::Config,
    data_dir: PathBuf,
    hooks: Box<dyn hooks::Hooks + Send + Sync>,
    args: ManagerArgs,
) -> anyhow::Result<()> {
    info!("\n\n================ STARTING GRID MANAGER ================\n\n");

    fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    if let Some(archive) = &args.manager_archive {
        install::install(&data_dir, Path::new(archive), Role::Manager)
            .map_err(|e| anyhow!("{}", e))
            .context("installing manager archive")?;
    }
    if let Some(archive) = &args.worker_archive {
        install::install(&data_dir, Path::new(archive), Role::Worker)
            .map_err(|e| anyhow!("{}", e))
            .context("installing worker archive")?;
    }

    // The worker payload is read into memory once; every attaching
    // peer gets these same bytes.
    let worker_archive = install::cached_archive(&data_dir, Role::Worker)
        .map_err(|e| anyhow!("{}", e))
        .context("loading cached worker archive (install one with --worker-archive)")?;

    let manager_exe = Role::Manager.exe_path(&data_dir);
    if !manager_exe.exists() {
        return Err(anyhow!(
            "no manager plug-in installed at {} (install one with --manager-archive)",
            manager_exe.display()
        ));
    }

    let (events_tx, events_rx) = crossbeam_channel::unbounded();

    // child first, network second; if the port is taken the child is
    // not left running
    let supervisor = Supervisor::start(
        &manager_exe,
        &[],
        &Role::Manager.install_dir(&data_dir),
        events_tx.clone(),
    )
    .map_err(|e| anyhow!("{}", e))
    .context("starting manager plug-in")?;

    let listener = match server::bind(config.server_port()) {
        Ok(listener) => listener,
        Err(e) => {
            let mut supervisor = supervisor;
            supervisor.stop();
            return Err(e);
        }
    };

    {
        let events_tx = events_tx.clone();
        thread::spawn(move || server::serve(listener, events_tx));
    }

    {
        let events_tx = events_tx.clone();
        signals::spawn(move || {
            let _ = events_tx.send(router::Event::Shutdown);
        })?;
    }

    // Operator commands typed at the terminal travel to the manager
    // plug-in as `tc` commands; this is the headless stand-in for the
    // GUI command prompt.
    {
        let events_tx = events_tx.clone();
        thread::spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("reading operator command: {}", e);
                        break;
                    }
                };
                if events_tx.send(router::Event::Terminal(line)).is_err() {
                    break;
                }
            }
            // stdin EOF is normal when running detached
        });
    }

    router::Router::new(
        supervisor,
        worker_archive,
        config.worker_limit(),
        config.keep_alive_interval(),
        hooks,
        events_tx,
        events_rx,
    )
    .run();

    Ok(())
}
