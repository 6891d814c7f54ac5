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

//! The worker-side router: owns the single session to the manager and
//! the (at most one) worker plug-in process. Handles the attach
//! pipeline, relays work items both ways, and watches manager
//! liveness with a two-tick heartbeat window.

use std::{fs, path::PathBuf, time};

use anyhow::Context as _;
use gridpool_protocol::{
    log_args, make_command, parse_command, DataPacketType, LogSource, LogType, PacketKind,
    ProcessCommand, WireMessage,
};
use tracing::{debug, info, warn};

use crate::{
    common::{ideal_thread_count, surface_log},
    hooks,
    install::{self, Role},
    protocol::{decode_string_list, encode_string_list},
    session::{PeerEvent, PeerEventKind, PeerSession, SessionState},
    supervise::{ChildEvent, ExitKind, Supervisor},
};

#[derive(Debug)]
pub enum Event {
    Peer(PeerEvent),
    Child(ChildEvent),
    Shutdown,
}

impl From<PeerEvent> for Event {
    fn from(ev: PeerEvent) -> Self {
        Event::Peer(ev)
    }
}

impl From<ChildEvent> for Event {
    fn from(ev: ChildEvent) -> Self {
        Event::Child(ev)
    }
}

/// Why the router's run loop returned, which tells the outer connect
/// loop whether to re-dial or bail out.
#[derive(Debug, PartialEq, Eq)]
pub enum ExitReason {
    Disconnected,
    Shutdown,
}

pub struct Router<'a> {
    data_dir: PathBuf,
    /// The local address:port of the link, which is the id the manager
    /// files this worker under.
    id: String,
    session: PeerSession,
    supervisor: Option<Supervisor>,
    /// Liveness flag. Any inbound packet asserts it; the keep-alive
    /// tick clears it, and a tick that finds it already cleared means
    /// the manager has been silent for a full interval on both sides
    /// of the tick.
    alive: bool,
    keep_alive_interval: time::Duration,
    hooks: &'a (dyn hooks::Hooks + Send + Sync),
    events_tx: crossbeam_channel::Sender<Event>,
    events_rx: crossbeam_channel::Receiver<Event>,
}

impl<'a> Router<'a> {
    pub fn new(
        data_dir: PathBuf,
        id: String,
        session: PeerSession,
        keep_alive_interval: time::Duration,
        hooks: &'a (dyn hooks::Hooks + Send + Sync),
        events_tx: crossbeam_channel::Sender<Event>,
        events_rx: crossbeam_channel::Receiver<Event>,
    ) -> Self {
        Router {
            data_dir,
            id,
            session,
            supervisor: None,
            alive: true,
            keep_alive_interval,
            hooks,
            events_tx,
            events_rx,
        }
    }

    /// Spin until the session dies or we are told to stop. Cleanup
    /// order on shutdown is process first, then the socket.
    pub fn run(mut self) -> ExitReason {
        // the link is up; the attach payload is the manager's next move
        self.session.state = SessionState::Attached;

        let events_rx = self.events_rx.clone();
        let liveness = crossbeam_channel::tick(self.keep_alive_interval);

        loop {
            crossbeam_channel::select! {
                recv(events_rx) -> ev => match ev {
                    Err(_) => return ExitReason::Disconnected,
                    Ok(Event::Shutdown) => {
                        if let Some(mut supervisor) = self.supervisor.take() {
                            supervisor.stop();
                        }
                        self.session.close();
                        return ExitReason::Shutdown;
                    }
                    Ok(Event::Peer(ev)) => {
                        if self.handle_peer(ev) {
                            return ExitReason::Disconnected;
                        }
                    }
                    Ok(Event::Child(ev)) => self.handle_child(ev),
                },
                recv(liveness) -> _ => self.liveness_tick(),
            }
        }
    }

    fn log(&self, level: LogType, message: &str) {
        surface_log(self.hooks, LogSource::GridWorker, level, message);
    }

    /// Returns true once the session is finished and the caller should
    /// wind down.
    fn handle_peer(&mut self, ev: PeerEvent) -> bool {
        match ev.kind {
            PeerEventKind::Packet(msg) => {
                self.alive = true;
                self.handle_packet(msg);
                false
            }
            PeerEventKind::Error(kind) => {
                self.log(LogType::Error, &format!("Socket error: {}", kind.canonical_name()));
                false
            }
            PeerEventKind::Disconnected => {
                self.log(LogType::Warning, "Disconnected from the Grid-Manager.");
                if let Some(mut supervisor) = self.supervisor.take() {
                    supervisor.write_line(&make_command(
                        ProcessCommand::WorkerExit,
                        &[String::from("-1")],
                    ));
                    supervisor.stop();
                }
                self.session.state = SessionState::Disconnected;
                if let Err(e) = self.hooks.worker_out_grid(&self.id) {
                    warn!("worker_out_grid hook: {:?}", e);
                }
                true
            }
        }
    }

    fn handle_packet(&mut self, msg: WireMessage) {
        let packet_type = match (msg.kind, msg.packet_type()) {
            (PacketKind::Data, Ok(pt)) => pt,
            _ => {
                self.log(
                    LogType::Warning,
                    "Unknown network packet received from the Grid-Manager.",
                );
                return;
            }
        };

        match packet_type {
            DataPacketType::Heartbeat => {
                debug!("heartbeat from the manager");
            }
            DataPacketType::GridAttach => self.handle_attach(msg.payload),
            DataPacketType::WorkerData | DataPacketType::WorkerExit => {
                let mut args = match decode_string_list(&msg.payload) {
                    Ok(args) => args,
                    Err(e) => {
                        warn!("malformed packet from the manager: {:#}", e);
                        return;
                    }
                };
                if !args.is_empty() {
                    // the manager echoes our own id in front; the
                    // plug-in has no use for it
                    args.remove(0);
                }
                let pc = if packet_type == DataPacketType::WorkerData {
                    ProcessCommand::WorkerData
                } else {
                    ProcessCommand::WorkerExit
                };
                if let Some(supervisor) = self.supervisor.as_mut() {
                    supervisor.write_line(&make_command(pc, &args));
                }
            }
            DataPacketType::GridWorkerReady | DataPacketType::Log => {
                self.log(
                    LogType::Warning,
                    "Unknown network packet received from the Grid-Manager.",
                );
            }
        }
    }

    /// The attach pipeline: cache the shipped archive, install it,
    /// start the plug-in, and report readiness with our capacity. Any
    /// failure goes back to the manager as a LOG packet and is also
    /// surfaced locally.
    fn handle_attach(&mut self, archive: Vec<u8>) {
        let res = (|| -> anyhow::Result<u32> {
            fs::create_dir_all(&self.data_dir).with_context(|| {
                format!("Directory:'{}' couldn't modify.", self.data_dir.display())
            })?;
            let cached = Role::Worker.archive_path(&self.data_dir);
            fs::write(&cached, &archive).with_context(|| {
                format!(
                    "Worker archive couldn't create at directory: {}",
                    self.data_dir.display()
                )
            })?;

            install::install_cached(&self.data_dir, Role::Worker)
                .map_err(|e| anyhow::anyhow!("{}", e))?;

            // a stale plug-in from an earlier attach has to go first
            if let Some(mut old) = self.supervisor.take() {
                old.stop();
            }
            let supervisor = Supervisor::start(
                &Role::Worker.exe_path(&self.data_dir),
                &[],
                &Role::Worker.install_dir(&self.data_dir),
                self.events_tx.clone(),
            )
            .map_err(|e| anyhow::anyhow!("Worker process start error! {}", e))?;
            self.supervisor = Some(supervisor);

            Ok(ideal_thread_count())
        })();

        match res {
            Ok(threads) => {
                let reply = WireMessage::data(
                    DataPacketType::GridWorkerReady,
                    encode_string_list(&[threads.to_string()]),
                );
                if let Err(e) = self.session.send(&reply) {
                    self.log(LogType::Error, &format!("Network error: {:#}", e));
                    return;
                }
                self.session.state = SessionState::Ready;
                info!("joined the grid advertising {} threads", threads);
                if let Err(e) = self.hooks.worker_in_grid(&self.id, threads) {
                    warn!("worker_in_grid hook: {:?}", e);
                }
            }
            Err(e) => {
                let err = format!("{:#}", e);
                let report = WireMessage::data(
                    DataPacketType::Log,
                    encode_string_list(&log_args(
                        LogSource::GridWorker,
                        LogType::Error,
                        &err,
                    )),
                );
                if let Err(send_err) = self.session.send(&report) {
                    warn!("reporting attach failure upstream: {:#}", send_err);
                }
                self.log(LogType::Error, &err);
            }
        }
    }

    fn handle_child(&mut self, ev: ChildEvent) {
        match ev {
            ChildEvent::Started => self.log(LogType::Info, "Process started."),
            ChildEvent::Line(line) => self.handle_child_line(line),
            ChildEvent::Finished { exit_code, kind } => {
                let level =
                    if kind == ExitKind::Normal { LogType::Info } else { LogType::Error };
                self.log(
                    level,
                    &format!("Process finished. Exit-Code:{} ({})", exit_code, kind),
                );

                // the supervisor's handle is spent once the child is gone
                self.supervisor = None;

                let status = match kind {
                    ExitKind::Normal => "0",
                    ExitKind::Crash => "1",
                };
                let payload = encode_string_list(&[
                    self.id.clone(),
                    exit_code.to_string(),
                    String::from(status),
                ]);
                let msg = WireMessage::data(DataPacketType::WorkerExit, payload);
                if let Err(e) = self.session.send(&msg) {
                    self.log(LogType::Error, &format!("Network error: {:#}", e));
                }

                // A crashed plug-in means this node's install is in an
                // unknown state. Dropping the link buys us a fresh
                // attach, and with it a clean re-install.
                if kind == ExitKind::Crash {
                    self.session.close();
                }
            }
        }
    }

    fn handle_child_line(&mut self, line: String) {
        let Some((pc, args)) = parse_command(&line) else {
            self.log(LogType::Warning, &format!("Unknown process command: {}", line));
            return;
        };

        match pc {
            ProcessCommand::WorkerData => {
                let msg = WireMessage::data(
                    DataPacketType::WorkerData,
                    encode_string_list(&args),
                );
                if let Err(e) = self.session.send(&msg) {
                    self.log(LogType::Error, &format!("Network error: {:#}", e));
                }
            }
            ProcessCommand::Log => {
                if args.len() < 3 {
                    self.log(LogType::Warning, &format!("Unknown process command: {}", line));
                    return;
                }
                let source = LogSource::from_wire(&args[0]).unwrap_or(LogSource::WorkerProcess);
                let level = LogType::from_wire(&args[1]).unwrap_or(LogType::Info);
                surface_log(self.hooks, source, level, &args[2]);

                let msg =
                    WireMessage::data(DataPacketType::Log, encode_string_list(&args));
                if let Err(e) = self.session.send(&msg) {
                    self.log(LogType::Error, &format!("Network error: {:#}", e));
                }
            }
            ProcessCommand::StatusMessage => {
                let message = args.first().map(String::as_str).unwrap_or("");
                if let Err(e) = self.hooks.status_message(message) {
                    warn!("status_message hook: {:?}", e);
                }
            }
            ProcessCommand::WorkerExit => {
                // the process-finished event is the real exit signal;
                // nothing goes on the network for this line
                debug!("worker plug-in announced exit: {}", line);
            }
            _ => {
                self.log(LogType::Warning, &format!("Unknown process command: {}", line));
            }
        }
    }

    fn liveness_tick(&mut self) {
        if !self.alive {
            info!("no traffic from the manager for two ticks, forcing a reconnect");
            // the read loop turns this into a Disconnected event,
            // which is the one cleanup path
            self.session.close();
            return;
        }
        self.alive = false;
    }
}
