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
    fmt, io, net,
    net::TcpStream,
    sync::Mutex,
    thread,
};

use anyhow::Context;
use gridpool_protocol::WireMessage;
use tracing::{info, warn};

use crate::protocol::{FrameError, WireMessageExt as _};

/// Where a peer session is in its lifecycle. The router advances this;
/// the session itself only distinguishes open from closed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    /// The attach payload has been sent (manager) or received (worker).
    Attached,
    /// The worker's plug-in process is up and the manager has been told
    /// its capacity.
    Ready,
    Disconnected,
}

/// The socket error taxonomy. The canonical names are preserved
/// verbatim from the original deployment's logs, so operators' grep
/// habits and alerting rules keep working.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocketErrorKind {
    ConnectionRefused,
    RemoteHostClosed,
    HostNotFound,
    SocketAccess,
    SocketResource,
    SocketTimeout,
    DatagramTooLarge,
    Network,
    AddressInUse,
    SocketAddressNotAvailable,
    UnsupportedSocketOperation,
    UnfinishedSocketOperation,
    ProxyAuthenticationRequired,
    SslHandshakeFailed,
    ProxyConnectionRefused,
    ProxyConnectionClosed,
    ProxyConnectionTimeout,
    ProxyNotFound,
    ProxyProtocol,
    Operation,
    SslInternal,
    SslInvalidUserData,
    Temporary,
}

impl SocketErrorKind {
    pub fn canonical_name(&self) -> &'static str {
        match self {
            SocketErrorKind::ConnectionRefused => "ConnectionRefusedError",
            SocketErrorKind::RemoteHostClosed => "RemoteHostClosedError",
            SocketErrorKind::HostNotFound => "HostNotFoundError",
            SocketErrorKind::SocketAccess => "SocketAccessError",
            SocketErrorKind::SocketResource => "SocketResourceError",
            SocketErrorKind::SocketTimeout => "SocketTimeoutError",
            SocketErrorKind::DatagramTooLarge => "DatagramTooLargeError",
            SocketErrorKind::Network => "NetworkError",
            SocketErrorKind::AddressInUse => "AddressInUseError",
            SocketErrorKind::SocketAddressNotAvailable => "SocketAddressNotAvailableError",
            SocketErrorKind::UnsupportedSocketOperation => "UnsupportedSocketOperationError",
            SocketErrorKind::UnfinishedSocketOperation => "UnfinishedSocketOperationError",
            SocketErrorKind::ProxyAuthenticationRequired => "ProxyAuthenticationRequiredError",
            SocketErrorKind::SslHandshakeFailed => "SslHandshakeFailedError",
            SocketErrorKind::ProxyConnectionRefused => "ProxyConnectionRefusedError",
            SocketErrorKind::ProxyConnectionClosed => "ProxyConnectionClosedError",
            SocketErrorKind::ProxyConnectionTimeout => "ProxyConnectionTimeoutError",
            SocketErrorKind::ProxyNotFound => "ProxyNotFoundError",
            SocketErrorKind::ProxyProtocol => "ProxyProtocolError",
            SocketErrorKind::Operation => "OperationError",
            SocketErrorKind::SslInternal => "SslInternalError",
            SocketErrorKind::SslInvalidUserData => "SslInvalidUserDataError",
            SocketErrorKind::Temporary => "TemporaryError",
        }
    }

    pub fn from_io(e: &io::Error) -> Self {
        use io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionRefused => SocketErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => SocketErrorKind::RemoteHostClosed,
            ErrorKind::NotFound => SocketErrorKind::HostNotFound,
            ErrorKind::PermissionDenied => SocketErrorKind::SocketAccess,
            ErrorKind::OutOfMemory => SocketErrorKind::SocketResource,
            ErrorKind::WouldBlock | ErrorKind::TimedOut => SocketErrorKind::SocketTimeout,
            ErrorKind::AddrInUse => SocketErrorKind::AddressInUse,
            ErrorKind::AddrNotAvailable => SocketErrorKind::SocketAddressNotAvailable,
            ErrorKind::Unsupported => SocketErrorKind::UnsupportedSocketOperation,
            ErrorKind::Interrupted => SocketErrorKind::Temporary,
            _ => SocketErrorKind::Network,
        }
    }
}

impl fmt::Display for SocketErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_name())
    }
}

/// One event out of a peer session's read loop. Events for a given
/// session arrive on the router queue in socket order, with
/// `Disconnected` always last.
#[derive(Debug)]
pub struct PeerEvent {
    pub peer: String,
    pub kind: PeerEventKind,
}

#[derive(Debug)]
pub enum PeerEventKind {
    Packet(WireMessage),
    Error(SocketErrorKind),
    Disconnected,
}

/// PeerSession owns one TCP socket. Sends are serialized behind a
/// mutex so any thread may call `send`; receives are pumped by a
/// dedicated read loop that feeds the router queue.
pub struct PeerSession {
    id: String,
    writer: Mutex<TcpStream>,
    stream: TcpStream,
    pub state: SessionState,
}

impl PeerSession {
    /// Take ownership of a connected stream and start its read loop.
    /// `id` is the routing identity of the peer: on the manager it is
    /// the remote address:port, on the worker the local address:port
    /// (the same string, seen from the two ends of the link). Events
    /// are converted into whatever the consuming router's queue
    /// carries so all sources share one channel.
    pub fn spawn<E>(
        id: String,
        stream: TcpStream,
        events: crossbeam_channel::Sender<E>,
    ) -> anyhow::Result<PeerSession>
    where
        E: From<PeerEvent> + Send + 'static,
    {
        let read_stream = stream.try_clone().context("cloning read stream")?;
        let writer = Mutex::new(stream.try_clone().context("cloning write stream")?);

        let reader_id = id.clone();
        thread::spawn(move || read_loop(reader_id, read_stream, events));

        Ok(PeerSession { id, writer, stream, state: SessionState::Connected })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn send(&self, msg: &WireMessage) -> anyhow::Result<()> {
        // we unwrap to propagate the poison as an unwind
        let mut writer = self.writer.lock().unwrap();
        msg.write_to(&mut *writer).with_context(|| format!("sending packet to {}", self.id))
    }

    /// Close the socket. Idempotent; the read loop notices EOF and
    /// emits `Disconnected`, which is what drives cleanup.
    pub fn close(&self) {
        // shutting down an already-dead socket just reports NotConnected
        let _ = self.stream.shutdown(net::Shutdown::Both);
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop<E>(id: String, stream: TcpStream, events: crossbeam_channel::Sender<E>)
where
    E: From<PeerEvent> + Send + 'static,
{
    let mut reader = io::BufReader::new(stream);
    loop {
        match WireMessage::read_from(&mut reader) {
            Ok(msg) => {
                let ev = PeerEvent { peer: id.clone(), kind: PeerEventKind::Packet(msg) };
                if events.send(E::from(ev)).is_err() {
                    // router is gone, nothing left to deliver to
                    break;
                }
            }
            Err(FrameError::Eof) => break,
            Err(FrameError::Closed) => {
                let kind = PeerEventKind::Error(SocketErrorKind::RemoteHostClosed);
                let _ = events.send(E::from(PeerEvent { peer: id.clone(), kind }));
                break;
            }
            Err(FrameError::Protocol(msg)) => {
                // The length prefix can no longer be trusted, so there
                // is no realigning with the peer. Stop reading and let
                // the disconnect event drive cleanup.
                warn!("unparseable frame from {}: {}", id, msg);
                break;
            }
            Err(FrameError::Io(e)) => {
                let kind = PeerEventKind::Error(SocketErrorKind::from_io(&e));
                let _ = events.send(E::from(PeerEvent { peer: id.clone(), kind }));
                break;
            }
        }
    }

    info!("read loop for {} winding down", id);
    let _ = events.send(E::from(PeerEvent { peer: id, kind: PeerEventKind::Disconnected }));
}
