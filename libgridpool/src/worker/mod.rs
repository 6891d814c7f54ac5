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
    net::{TcpStream, ToSocketAddrs as _},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context;
use gridpool_protocol::{LogSource, LogType};
use tracing::{info, instrument};

use crate::{
    common::surface_log,
    config, consts, hooks,
    session::PeerSession,
    signals,
};

pub mod router;

/// Run a grid worker until it is shut down. The worker dials the
/// manager, runs one session to completion, and re-dials: quickly
/// after an established session drops, after the reconnect timeout
/// when a dial fails outright. There is no backoff escalation and no
/// attempt cap.
#[instrument(skip_all)]
pub fn run(
    config: config::Config,
    data_dir: PathBuf,
    hooks: Box<dyn hooks::Hooks + Send + Sync>,
) -> anyhow::Result<()> {
    info!("\n\n================ STARTING GRID WORKER ================\n\n");

    fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let server_ip = config.server_ip();
    let server_port = config.server_port();
    let addr_str = format!("{}:{}", server_ip, server_port);

    // The signal handler pokes two things: the sleep channel, so a
    // waiting redial loop wakes up, and the live router (if any), so
    // an active session winds down in order.
    let (term_tx, term_rx) = crossbeam_channel::bounded::<()>(1);
    let current_session: Arc<Mutex<Option<crossbeam_channel::Sender<router::Event>>>> =
        Arc::new(Mutex::new(None));
    {
        let current_session = Arc::clone(&current_session);
        signals::spawn(move || {
            let _ = term_tx.send(());
            // we unwrap to propagate the poison as an unwind
            if let Some(tx) = current_session.lock().unwrap().take() {
                let _ = tx.send(router::Event::Shutdown);
            }
        })?;
    }

    loop {
        surface_log(
            &*hooks,
            LogSource::GridWorker,
            LogType::Info,
            &format!("Connecting to grid manager at {}:{}", server_ip, server_port),
        );

        match dial(&addr_str, &config) {
            Ok(stream) => {
                surface_log(
                    &*hooks,
                    LogSource::GridWorker,
                    LogType::Info,
                    "Connected to the Grid-Manager.",
                );

                let reason =
                    run_session(stream, &config, &data_dir, &*hooks, &current_session)?;
                if reason == router::ExitReason::Shutdown {
                    break;
                }

                // brief pause so a flapping manager isn't hammered
                if term_rx.recv_timeout(consts::RECONNECT_AFTER_DROP).is_ok() {
                    break;
                }
            }
            Err(e) => {
                surface_log(
                    &*hooks,
                    LogSource::GridWorker,
                    LogType::Error,
                    &format!(
                        "Connection failed ({:#}). Retrying in {} ms.",
                        e,
                        config.reconnect_timeout().as_millis()
                    ),
                );
                if term_rx.recv_timeout(config.reconnect_timeout()).is_ok() {
                    break;
                }
            }
        }
    }

    info!("worker shut down");
    Ok(())
}

fn dial(addr_str: &str, config: &config::Config) -> anyhow::Result<TcpStream> {
    let addr = addr_str
        .to_socket_addrs()
        .with_context(|| format!("resolving {}", addr_str))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("{} resolved to no addresses", addr_str))?;
    let stream = TcpStream::connect_timeout(&addr, config.connect_timeout())
        .with_context(|| format!("dialing {}", addr_str))?;
    Ok(stream)
}

fn run_session(
    stream: TcpStream,
    config: &config::Config,
    data_dir: &Path,
    hooks: &(dyn hooks::Hooks + Send + Sync),
    current_session: &Arc<Mutex<Option<crossbeam_channel::Sender<router::Event>>>>,
) -> anyhow::Result<router::ExitReason> {
    // the id the manager files us under is this link's address:port
    // as seen from our end
    let id = stream.local_addr().context("resolving local addr")?.to_string();

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let session = PeerSession::spawn(id.clone(), stream, events_tx.clone())?;

    // we unwrap to propagate the poison as an unwind
    *current_session.lock().unwrap() = Some(events_tx.clone());

    let router = router::Router::new(
        data_dir.to_path_buf(),
        id,
        session,
        config.keep_alive_interval(),
        hooks,
        events_tx,
        events_rx,
    );
    let reason = router.run();

    *current_session.lock().unwrap() = None;
    Ok(reason)
}
