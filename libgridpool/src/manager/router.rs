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

//! The manager-side router: a single thread that owns the live worker
//! table and the session set, and reacts to every event source
//! (accepted sockets, peer packets, plug-in process lines, keep-alive
//! ticks, operator commands). All mutable routing state lives here and
//! is touched by no other thread, so a peer's packets and the child's
//! lines hit their targets in queue arrival order.

use std::{collections::HashMap, net, time};

use gridpool_protocol::{
    make_command, parse_command, DataPacketType, LogSource, LogType, PacketKind, ProcessCommand,
    WireMessage,
};
use tracing::{debug, info, warn};

use crate::{
    common::surface_log,
    hooks,
    protocol::{decode_string_list, encode_string_list},
    session::{PeerEvent, PeerEventKind, PeerSession, SessionState},
    supervise::{ChildEvent, ExitKind, Supervisor},
};

/// Everything the router can be woken up by. All sources share this
/// one queue, which is what gives per-worker causal ordering.
#[derive(Debug)]
pub enum Event {
    /// The acceptor took a new connection.
    Accepted(net::TcpStream),
    Peer(PeerEvent),
    Child(ChildEvent),
    /// A raw operator command line to forward to the manager plug-in.
    Terminal(String),
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

/// The manager's bookkeeping for one attached worker. Created on
/// GRID_WORKER_READY, destroyed together with the session on
/// disconnect.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub address: String,
    pub port: u16,
    pub thread_capacity: u32,
    pub last_seen: time::SystemTime,
}

pub struct Router {
    supervisor: Supervisor,
    /// Raw bytes of the worker plug-in archive, shipped on attach.
    /// Written once at startup, read-only after.
    worker_archive: Vec<u8>,
    worker_limit: usize,
    keep_alive_interval: time::Duration,
    hooks: Box<dyn hooks::Hooks + Send + Sync>,
    sessions: HashMap<String, PeerSession>,
    workers: HashMap<String, WorkerEntry>,
    events_tx: crossbeam_channel::Sender<Event>,
    events_rx: crossbeam_channel::Receiver<Event>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        supervisor: Supervisor,
        worker_archive: Vec<u8>,
        worker_limit: usize,
        keep_alive_interval: time::Duration,
        hooks: Box<dyn hooks::Hooks + Send + Sync>,
        events_tx: crossbeam_channel::Sender<Event>,
        events_rx: crossbeam_channel::Receiver<Event>,
    ) -> Self {
        Router {
            supervisor,
            worker_archive,
            worker_limit,
            keep_alive_interval,
            hooks,
            sessions: HashMap::new(),
            workers: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Spin until shutdown. On the way out the network goes first,
    /// then the plug-in process.
    pub fn run(mut self) {
        let events_rx = self.events_rx.clone();
        let keep_alive = crossbeam_channel::tick(self.keep_alive_interval);

        loop {
            crossbeam_channel::select! {
                recv(events_rx) -> ev => match ev {
                    Ok(Event::Shutdown) | Err(_) => break,
                    Ok(ev) => self.handle_event(ev),
                },
                recv(keep_alive) -> _ => self.keep_alive_tick(),
            }
        }

        info!("router shutting down");
        for (_, session) in self.sessions.drain() {
            session.close();
        }
        self.workers.clear();
        self.supervisor.stop();
    }

    fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Accepted(stream) => self.handle_accepted(stream),
            Event::Peer(ev) => self.handle_peer(ev),
            Event::Child(ev) => self.handle_child(ev),
            Event::Terminal(line) => self.handle_terminal(line),
            Event::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn log(&self, level: LogType, message: &str) {
        surface_log(&*self.hooks, LogSource::GridManager, level, message);
    }

    fn handle_accepted(&mut self, stream: net::TcpStream) {
        let id = match stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(e) => {
                warn!("accepted a socket with no peer address: {}", e);
                return;
            }
        };

        if self.worker_limit > 0 && self.sessions.len() >= self.worker_limit {
            self.log(
                LogType::Warning,
                &format!("Worker limit ({}) reached, turning away {}.", self.worker_limit, id),
            );
            let _ = stream.shutdown(net::Shutdown::Both);
            return;
        }

        self.log(LogType::Info, &format!("Grid-Worker: {} is connected.", id));

        match PeerSession::spawn(id.clone(), stream, self.events_tx.clone()) {
            Ok(mut session) => {
                let attach =
                    WireMessage::data(DataPacketType::GridAttach, self.worker_archive.clone());
                match session.send(&attach) {
                    Ok(_) => session.state = SessionState::Attached,
                    Err(e) => {
                        // the read loop will notice the dead socket
                        self.log(LogType::Error, &format!("Network error: {:#}", e));
                    }
                }
                self.sessions.insert(id, session);
            }
            Err(e) => self.log(LogType::Error, &format!("Network error: {:#}", e)),
        }
    }

    fn handle_peer(&mut self, ev: PeerEvent) {
        match ev.kind {
            PeerEventKind::Packet(msg) => self.handle_packet(ev.peer, msg),
            PeerEventKind::Error(kind) => {
                // Transient errors are only surfaced; teardown waits
                // for the read loop's Disconnected event.
                self.log(
                    LogType::Error,
                    &format!(
                        "Grid-Worker: {} threw network error: {}",
                        ev.peer,
                        kind.canonical_name()
                    ),
                );
            }
            PeerEventKind::Disconnected => {
                self.sessions.remove(&ev.peer);
                self.workers.remove(&ev.peer);
                self.log(LogType::Warning, &format!("Grid-Worker: {} is disconnected.", ev.peer));
                self.supervisor.write_line(&make_command(
                    ProcessCommand::WorkerOutGrid,
                    &[ev.peer.clone()],
                ));
                if let Err(e) = self.hooks.worker_out_grid(&ev.peer) {
                    warn!("worker_out_grid hook: {:?}", e);
                }
            }
        }
    }

    fn handle_packet(&mut self, peer: String, msg: WireMessage) {
        let packet_type = match (msg.kind, msg.packet_type()) {
            (PacketKind::Data, Ok(pt)) => pt,
            _ => {
                self.log(
                    LogType::Warning,
                    &format!("Unknown network packet from Grid-Worker: {}", peer),
                );
                return;
            }
        };

        if let Some(entry) = self.workers.get_mut(&peer) {
            entry.last_seen = time::SystemTime::now();
        }

        match packet_type {
            DataPacketType::GridWorkerReady => {
                let mut args = match decode_string_list(&msg.payload) {
                    Ok(args) => args,
                    Err(e) => {
                        warn!("malformed GRID_WORKER_READY from {}: {:#}", peer, e);
                        return;
                    }
                };
                let capacity = args.first().and_then(|s| s.parse::<u32>().ok()).unwrap_or(0);
                args.insert(0, peer.clone());
                self.supervisor.write_line(&make_command(ProcessCommand::WorkerInGrid, &args));

                let (address, port) = split_worker_id(&peer);
                self.workers.insert(
                    peer.clone(),
                    WorkerEntry {
                        address,
                        port,
                        thread_capacity: capacity,
                        last_seen: time::SystemTime::now(),
                    },
                );
                if let Some(session) = self.sessions.get_mut(&peer) {
                    session.state = SessionState::Ready;
                }
                if let Err(e) = self.hooks.worker_in_grid(&peer, capacity) {
                    warn!("worker_in_grid hook: {:?}", e);
                }
            }
            DataPacketType::WorkerData | DataPacketType::WorkerExit => {
                let mut args = match decode_string_list(&msg.payload) {
                    Ok(args) => args,
                    Err(e) => {
                        warn!("malformed packet from {}: {:#}", peer, e);
                        return;
                    }
                };
                args.insert(0, peer);
                let pc = if packet_type == DataPacketType::WorkerData {
                    ProcessCommand::WorkerData
                } else {
                    ProcessCommand::WorkerExit
                };
                self.supervisor.write_line(&make_command(pc, &args));
            }
            DataPacketType::Log => {
                let args = match decode_string_list(&msg.payload) {
                    Ok(args) if args.len() >= 3 => args,
                    _ => {
                        warn!("malformed LOG packet from {}", peer);
                        return;
                    }
                };
                let source = LogSource::from_wire(&args[0]).unwrap_or(LogSource::GridWorker);
                let level = LogType::from_wire(&args[1]).unwrap_or(LogType::Info);
                surface_log(&*self.hooks, source, level, &format!("({}){}", peer, args[2]));
            }
            DataPacketType::Heartbeat | DataPacketType::GridAttach => {
                // manager-to-worker traffic has no business arriving here
                self.log(
                    LogType::Warning,
                    &format!("Unknown network packet from Grid-Worker: {}", peer),
                );
            }
        }
    }

    fn handle_child(&mut self, ev: ChildEvent) {
        match ev {
            ChildEvent::Started => self.log(LogType::Info, "Process started."),
            ChildEvent::Line(line) => self.handle_child_line(line),
            ChildEvent::Finished { exit_code, kind } => {
                let level = if kind == ExitKind::Normal && exit_code == 0 {
                    LogType::Info
                } else {
                    LogType::Error
                };
                self.log(
                    level,
                    &format!("Process finished. Exit-Code:{} ({})", exit_code, kind),
                );

                // Tell every attached worker that its stream of work
                // is over; each gets an exit packet carrying its own id.
                for (id, session) in &self.sessions {
                    let payload = encode_string_list(&[id.clone()]);
                    let msg = WireMessage::data(DataPacketType::WorkerExit, payload);
                    if let Err(e) = session.send(&msg) {
                        self.log(LogType::Error, &format!("Network error: {:#}", e));
                    }
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
            ProcessCommand::WorkerData | ProcessCommand::WorkerExit => {
                let Some(worker) = args.first() else {
                    self.log(LogType::Warning, &format!("Unknown process command: {}", line));
                    return;
                };
                match self.sessions.get(worker) {
                    Some(session) => {
                        let packet_type = if pc == ProcessCommand::WorkerData {
                            DataPacketType::WorkerData
                        } else {
                            DataPacketType::WorkerExit
                        };
                        let msg =
                            WireMessage::data(packet_type, encode_string_list(&args));
                        if let Err(e) = session.send(&msg) {
                            self.log(LogType::Error, &format!("Network error: {:#}", e));
                        }
                    }
                    None => {
                        self.log(
                            LogType::Error,
                            &format!("Network client of worker {} couldn't find.", worker),
                        );
                    }
                }
            }
            ProcessCommand::Log => {
                if args.len() < 3 {
                    self.log(LogType::Warning, &format!("Unknown process command: {}", line));
                    return;
                }
                let source = LogSource::from_wire(&args[0]).unwrap_or(LogSource::ManagerProcess);
                let level = LogType::from_wire(&args[1]).unwrap_or(LogType::Info);
                surface_log(&*self.hooks, source, level, &args[2]);
            }
            ProcessCommand::StatusMessage => {
                let message = args.first().map(String::as_str).unwrap_or("");
                if let Err(e) = self.hooks.status_message(message) {
                    warn!("status_message hook: {:?}", e);
                }
            }
            _ => {
                self.log(LogType::Warning, &format!("Unknown process command: {}", line));
            }
        }
    }

    fn handle_terminal(&mut self, line: String) {
        let args: Vec<String> = line.split_whitespace().map(String::from).collect();
        if args.is_empty() {
            return;
        }
        self.supervisor.write_line(&make_command(ProcessCommand::TerminalCommand, &args));
    }

    fn keep_alive_tick(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        debug!("pinging {} live workers", self.sessions.len());
        let now_ms = chrono::Utc::now().timestamp_millis();
        let msg =
            WireMessage::data(DataPacketType::Heartbeat, now_ms.to_string().into_bytes());
        for (id, session) in &self.sessions {
            if let Err(e) = session.send(&msg) {
                // the next read or write on this session will surface
                // the failure properly
                warn!("sending heartbeat to {}: {:#}", id, e);
            }
        }
    }
}

/// Worker ids are the peer's address:port text form; pull the two
/// halves back apart for the worker table.
fn split_worker_id(id: &str) -> (String, u16) {
    match id.rsplit_once(':') {
        Some((address, port)) => {
            (String::from(address), port.parse::<u16>().unwrap_or(0))
        }
        None => (String::from(id), 0),
    }
}
