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

//! The framed transport: [`WireMessage`]s over any reliable byte pipe.
//!
//! Each frame is `[kind:u8][type_id:u16][payload_len:u32][payload]`,
//! integers big endian. Multi-argument payloads carry a length-prefixed
//! list of UTF-16 strings (`[count:u32]` then `[byte_len:u32][bytes]`
//! per entry), which existing deployments expect bit-exact.

use std::{
    fmt, io,
    io::{Read, Write},
};

use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};
use gridpool_protocol::{PacketKind, WireMessage};

use crate::consts;

/// Byte length marker QDataStream uses for a null string. We decode it
/// as an empty string and never produce it.
const NULL_STRING_LEN: u32 = 0xffff_ffff;

#[derive(Debug)]
pub enum FrameError {
    /// The stream ended cleanly on a frame boundary.
    Eof,
    /// The stream ended partway through a frame.
    Closed,
    /// The header cannot describe a real frame. The byte stream can no
    /// longer be trusted to be frame aligned after one of these.
    Protocol(String),
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Eof => write!(f, "end of stream"),
            FrameError::Closed => write!(f, "connection closed mid frame"),
            FrameError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            FrameError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Closed
        } else {
            FrameError::Io(e)
        }
    }
}

/// Frame I/O for the wire message struct. Protocol structs are bare
/// structs, so we use an ext trait to mix in methods.
pub trait WireMessageExt: Sized {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()>;
    fn read_from<R: Read>(r: &mut R) -> Result<Self, FrameError>;
}

impl WireMessageExt for WireMessage {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.kind as u8)?;
        w.write_u16::<BigEndian>(self.type_id)?;
        w.write_u32::<BigEndian>(self.payload.len() as u32)?;
        w.write_all(&self.payload)?;
        w.flush()
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self, FrameError> {
        // EOF on the very first byte is a normal end of stream, EOF
        // anywhere later in the frame is a truncation.
        let kind = match r.read_u8() {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Eof),
            Err(e) => return Err(FrameError::Io(e)),
        };
        let type_id = r.read_u16::<BigEndian>()?;
        let len = r.read_u32::<BigEndian>()? as usize;
        if len > consts::MAX_FRAME_BYTES {
            return Err(FrameError::Protocol(format!(
                "frame of {} bytes exceeds size limit of {} bytes",
                len,
                consts::MAX_FRAME_BYTES
            )));
        }

        let mut payload = vec![0; len];
        r.read_exact(&mut payload)?;

        // Validate the kind tag only once the whole frame has been
        // consumed so the stream stays aligned for the next frame.
        let kind = PacketKind::try_from(kind)
            .map_err(|e| FrameError::Protocol(format!("{}", e)))?;

        Ok(WireMessage { kind, type_id, payload })
    }
}

/// A lazy sequence of frames pulled off a reader. Ends when the stream
/// does; not restartable.
pub struct Messages<R> {
    reader: R,
}

impl<R: Read> Messages<R> {
    pub fn new(reader: R) -> Self {
        Messages { reader }
    }
}

impl<R: Read> Iterator for Messages<R> {
    type Item = Result<WireMessage, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        match WireMessage::read_from(&mut self.reader) {
            Err(FrameError::Eof) => None,
            res => Some(res),
        }
    }
}

/// Encode an argument list into the wire payload form.
pub fn encode_string_list(args: &[String]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + args.iter().map(|a| 4 + a.len() * 2).sum::<usize>());
    buf.extend_from_slice(&(args.len() as u32).to_be_bytes());
    for arg in args {
        let units: Vec<u16> = arg.encode_utf16().collect();
        buf.extend_from_slice(&((units.len() * 2) as u32).to_be_bytes());
        for unit in units {
            buf.extend_from_slice(&unit.to_be_bytes());
        }
    }
    buf
}

/// Decode a wire payload back into an argument list.
pub fn decode_string_list(payload: &[u8]) -> anyhow::Result<Vec<String>> {
    let mut r = io::Cursor::new(payload);
    let count = r.read_u32::<BigEndian>()? as usize;
    // Each entry costs at least its 4 byte length prefix.
    if count > payload.len() / 4 {
        return Err(anyhow::anyhow!("string list claims {} entries in {} bytes", count, payload.len()));
    }

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let byte_len = r.read_u32::<BigEndian>()?;
        if byte_len == NULL_STRING_LEN {
            args.push(String::new());
            continue;
        }
        let byte_len = byte_len as usize;
        if byte_len % 2 != 0 {
            return Err(anyhow::anyhow!("odd UTF-16 byte length {}", byte_len));
        }

        let mut units = Vec::with_capacity(byte_len / 2);
        for _ in 0..byte_len / 2 {
            units.push(r.read_u16::<BigEndian>()?);
        }
        args.push(String::from_utf16(&units).map_err(|e| anyhow::anyhow!("bad UTF-16: {}", e))?);
    }

    Ok(args)
}
