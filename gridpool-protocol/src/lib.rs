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

use std::fmt;

use anyhow::anyhow;

/// PacketKind is the frame-level discriminator that leads every message
/// on the socket. Only `Data` is used today; `Control` is reserved for
/// future out-of-band traffic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Data = 1,
    Control = 2,
}

impl TryFrom<u8> for PacketKind {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            1 => Ok(PacketKind::Data),
            2 => Ok(PacketKind::Control),
            _ => Err(anyhow!("unknown PacketKind {}", v)),
        }
    }
}

/// DataPacketType tags the payload of a `Data` frame. The numeric values
/// are on the wire and must never be renumbered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataPacketType {
    /// manager -> worker. Payload is the current wall-clock timestamp in
    /// milliseconds, as a decimal string.
    Heartbeat = 1,
    /// manager -> worker. Payload is the raw bytes of the worker plug-in
    /// archive.
    GridAttach = 2,
    /// worker -> manager. Payload is a string list holding the worker's
    /// ideal thread count as a decimal string.
    GridWorkerReady = 3,
    /// both directions. Payload is a string list: worker id followed by
    /// work-specific arguments.
    WorkerData = 4,
    /// both directions. Payload is a string list: worker id followed by
    /// work-specific arguments (manager -> worker) or the exit code and
    /// exit status (worker -> manager).
    WorkerExit = 5,
    /// worker -> manager. Payload is a string list: log source, log type,
    /// message.
    Log = 6,
}

impl TryFrom<u16> for DataPacketType {
    type Error = anyhow::Error;

    fn try_from(v: u16) -> anyhow::Result<Self> {
        match v {
            1 => Ok(DataPacketType::Heartbeat),
            2 => Ok(DataPacketType::GridAttach),
            3 => Ok(DataPacketType::GridWorkerReady),
            4 => Ok(DataPacketType::WorkerData),
            5 => Ok(DataPacketType::WorkerExit),
            6 => Ok(DataPacketType::Log),
            _ => Err(anyhow!("unknown DataPacketType {}", v)),
        }
    }
}

/// WireMessage is one logical packet on the socket.
///
/// format:
///
/// ```text
/// 1 byte: kind tag
/// big endian 2 byte word: type id
/// big endian 4 byte word: length prefix
/// N bytes: payload
/// ```
///
/// The type id is kept raw rather than parsed into a [`DataPacketType`]
/// so that a packet with an unknown tag can still be framed, logged, and
/// dropped by the routing layer instead of killing the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub kind: PacketKind,
    pub type_id: u16,
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Build a `Data` packet with the given tag and payload.
    pub fn data(packet_type: DataPacketType, payload: Vec<u8>) -> Self {
        WireMessage { kind: PacketKind::Data, type_id: packet_type as u16, payload }
    }

    pub fn packet_type(&self) -> anyhow::Result<DataPacketType> {
        DataPacketType::try_from(self.type_id)
    }
}

pub const COMMAND_PREFIX: char = '$';
pub const COMMAND_SUFFIX: char = '\n';
pub const COMMAND_SEPARATOR: char = '|';
pub const COMMAND_DATA_SEPARATOR: char = '#';

/// ProcessCommand names one line exchanged with a plug-in process over
/// its stdio. Encoding: `'$' <mnemonic> ('|' <arg>)* '\n'`, with any `|`
/// inside an argument rewritten to `#`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessCommand {
    /// worker-in-grid. host -> manager child: [worker_id, thread_count];
    /// host -> worker child: no args.
    WorkerInGrid,
    /// worker-out-grid. host -> manager child: [worker_id]; host ->
    /// worker child: no args.
    WorkerOutGrid,
    /// worker data, both ways. manager side: [worker_id, args...];
    /// worker side: [args...].
    WorkerData,
    /// worker exit, both ways.
    WorkerExit,
    /// child -> host: [log_source, log_type, message].
    Log,
    /// child -> host: [status_message].
    StatusMessage,
    /// host -> manager child only: a terminal command forwarded verbatim
    /// from the operator.
    TerminalCommand,
}

impl ProcessCommand {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            ProcessCommand::WorkerInGrid => "wig",
            ProcessCommand::WorkerOutGrid => "wog",
            ProcessCommand::WorkerData => "wd",
            ProcessCommand::WorkerExit => "wex",
            ProcessCommand::Log => "log",
            ProcessCommand::StatusMessage => "stm",
            ProcessCommand::TerminalCommand => "tc",
        }
    }

    pub fn from_mnemonic(m: &str) -> Option<Self> {
        match m {
            "wig" => Some(ProcessCommand::WorkerInGrid),
            "wog" => Some(ProcessCommand::WorkerOutGrid),
            "wd" => Some(ProcessCommand::WorkerData),
            "wex" => Some(ProcessCommand::WorkerExit),
            "log" => Some(ProcessCommand::Log),
            "stm" => Some(ProcessCommand::StatusMessage),
            "tc" => Some(ProcessCommand::TerminalCommand),
            _ => None,
        }
    }
}

/// Encode a process command line, without the trailing newline (the
/// writer appends it). Separator chars inside arguments are escaped to
/// `#`. The escape is one-way: `parse_command` does not undo it, so an
/// argument that legitimately contains `#` is indistinguishable from an
/// escaped `|` on the receiving side.
pub fn make_command(pc: ProcessCommand, args: &[String]) -> String {
    let mut cmd = format!("{}{}", COMMAND_PREFIX, pc.mnemonic());
    for arg in args {
        cmd.push(COMMAND_SEPARATOR);
        cmd.push_str(&arg.replace(COMMAND_SEPARATOR, &COMMAND_DATA_SEPARATOR.to_string()));
    }
    cmd
}

/// Parse one line into a command and its arguments. Returns `None` for
/// lines that do not start with the command prefix or use an unknown
/// mnemonic; such lines are the callers' to log and drop.
pub fn parse_command(line: &str) -> Option<(ProcessCommand, Vec<String>)> {
    let line = line.trim_end_matches(['\n', '\r']);
    let body = line.strip_prefix(COMMAND_PREFIX)?;

    let mut parts = body.split(COMMAND_SEPARATOR);
    let pc = ProcessCommand::from_mnemonic(parts.next()?)?;
    Some((pc, parts.map(String::from).collect()))
}

/// LogSource identifies which component originated a log line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogSource {
    GridManager = 0,
    GridWorker = 1,
    ManagerProcess = 2,
    WorkerProcess = 3,
}

impl LogSource {
    /// The display names are load-bearing: operators grep for them, so
    /// they match the original deployment verbatim.
    pub fn literal(&self) -> &'static str {
        match self {
            LogSource::GridManager => "Grid Manager",
            LogSource::GridWorker => "Grid Worker",
            LogSource::ManagerProcess => "Manager Process",
            LogSource::WorkerProcess => "Worker Process",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s.parse::<u32>().ok()? {
            0 => Some(LogSource::GridManager),
            1 => Some(LogSource::GridWorker),
            2 => Some(LogSource::ManagerProcess),
            3 => Some(LogSource::WorkerProcess),
            _ => None,
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.literal())
    }
}

/// LogType is the severity attached to forwarded log lines.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogType {
    Info = 0,
    Warning = 1,
    Error = 2,
}

impl LogType {
    pub fn literal(&self) -> &'static str {
        match self {
            LogType::Info => "Info",
            LogType::Warning => "Warning",
            LogType::Error => "Error",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s.parse::<u32>().ok()? {
            0 => Some(LogType::Info),
            1 => Some(LogType::Warning),
            2 => Some(LogType::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.literal())
    }
}

/// Build the standard three element argument list carried by `Log`
/// packets and `log` process commands.
pub fn log_args(source: LogSource, level: LogType, message: &str) -> Vec<String> {
    vec![(source as u32).to_string(), (level as u32).to_string(), String::from(message)]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_round_trip() {
        let cases: Vec<(ProcessCommand, Vec<String>)> = vec![
            (ProcessCommand::WorkerInGrid, vec!["192.168.0.7:51422".into(), "8".into()]),
            (ProcessCommand::WorkerOutGrid, vec!["192.168.0.7:51422".into()]),
            (ProcessCommand::WorkerData, vec!["w1".into(), "foo".into(), "bar".into()]),
            (ProcessCommand::WorkerExit, vec![]),
            (ProcessCommand::Log, vec!["3".into(), "0".into(), "hello".into()]),
            (ProcessCommand::StatusMessage, vec!["74% done".into()]),
            (ProcessCommand::TerminalCommand, vec!["pause".into()]),
        ];

        for (pc, args) in cases {
            let line = make_command(pc, &args);
            let (parsed_pc, parsed_args) = parse_command(&line).expect("line to parse");
            assert_eq!(pc, parsed_pc);
            assert_eq!(args, parsed_args);
        }
    }

    #[test]
    fn separator_escape_is_one_way() {
        // The encoder rewrites '|' to '#', and a second encode pass of the
        // already escaped text must leave it alone.
        let args = vec![String::from("a|b")];
        let line = make_command(ProcessCommand::TerminalCommand, &args);
        assert_eq!(line, "$tc|a#b");

        let (_, parsed) = parse_command(&line).expect("line to parse");
        assert_eq!(parsed, vec![String::from("a#b")]);

        let again = make_command(ProcessCommand::TerminalCommand, &parsed);
        assert_eq!(again, line);
    }

    #[test]
    fn parse_rejects_junk() {
        assert_eq!(parse_command("wd|foo"), None); // missing prefix
        assert_eq!(parse_command("$frob|foo"), None); // unknown mnemonic
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("$"), None);
    }

    #[test]
    fn parse_trims_line_endings() {
        let (pc, args) = parse_command("$wd|w1|foo\r\n").expect("line to parse");
        assert_eq!(pc, ProcessCommand::WorkerData);
        assert_eq!(args, vec![String::from("w1"), String::from("foo")]);
    }

    #[test]
    fn wire_tags_are_stable() {
        // These values are persisted on the wire; a renumbering is a
        // protocol break even if everything still compiles.
        assert_eq!(DataPacketType::Heartbeat as u16, 1);
        assert_eq!(DataPacketType::GridAttach as u16, 2);
        assert_eq!(DataPacketType::GridWorkerReady as u16, 3);
        assert_eq!(DataPacketType::WorkerData as u16, 4);
        assert_eq!(DataPacketType::WorkerExit as u16, 5);
        assert_eq!(DataPacketType::Log as u16, 6);

        for id in 1..=6u16 {
            let pt = DataPacketType::try_from(id).expect("tag to parse");
            assert_eq!(pt as u16, id);
        }
        assert!(DataPacketType::try_from(7).is_err());
        assert!(PacketKind::try_from(0).is_err());
    }

    #[test]
    fn log_args_shape() {
        let args = log_args(LogSource::GridWorker, LogType::Error, "boom");
        assert_eq!(args, vec!["1", "2", "boom"]);
        assert_eq!(LogSource::from_wire(&args[0]), Some(LogSource::GridWorker));
        assert_eq!(LogType::from_wire(&args[1]), Some(LogType::Error));
    }
}
