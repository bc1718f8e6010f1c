// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol between the Tower server, attach clients, and sidecars.
//!
//! Frames are `[type: u8][length: u32 big-endian][payload]`. Payloads are
//! either raw bytes (DATA, REPLAY) or JSON (everything else). Unknown type
//! tags are skipped and surfaced as [`Frame::Unknown`] so readers stay
//! forward-compatible.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame payload.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Protocol version carried in HELLO.
pub const PROTOCOL_VERSION: u32 = 1;

/// Role a client declares in HELLO. At most one `tower` client is attached
/// to a sidecar at a time; `terminal` clients coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Tower,
    Terminal,
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tower => f.write_str("tower"),
            Self::Terminal => f.write_str("terminal"),
        }
    }
}

/// The closed signal allow-list. Stop/continue are deliberately absent;
/// the substrate never pauses a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalName {
    Interrupt,
    Terminate,
    Kill,
    Hangup,
    WindowChange,
}

impl SignalName {
    pub fn to_signal(self) -> Signal {
        match self {
            Self::Interrupt => Signal::SIGINT,
            Self::Terminate => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
            Self::Hangup => Signal::SIGHUP,
            Self::WindowChange => Signal::SIGWINCH,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Terminate => "terminate",
            Self::Kill => "kill",
            Self::Hangup => "hangup",
            Self::WindowChange => "window-change",
        }
    }
}

impl FromStr for SignalName {
    type Err = UnknownSignal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interrupt" => Ok(Self::Interrupt),
            "terminate" => Ok(Self::Terminate),
            "kill" => Ok(Self::Kill),
            "hangup" => Ok(Self::Hangup),
            "window-change" => Ok(Self::WindowChange),
            _ => Err(UnknownSignal(s.to_owned())),
        }
    }
}

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a signal name outside the allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSignal(pub String);

impl fmt::Display for UnknownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown signal name: {}", self.0)
    }
}

impl std::error::Error for UnknownSignal {}

/// Spawn parameters for the child process inside a sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResizePayload {
    cols: u16,
    rows: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignalPayload {
    name: SignalName,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExitPayload {
    code: Option<i32>,
    signal: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelloPayload {
    version: u32,
    client_type: ClientType,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WelcomePayload {
    pid: u32,
    cols: u16,
    rows: u16,
    start_time: String,
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Raw PTY output (sidecar→client) or raw input bytes (client→sidecar).
    Data(Bytes),
    Resize { cols: u16, rows: u16 },
    Signal(SignalName),
    Exit { code: Option<i32>, signal: Option<String> },
    /// Line-aligned snapshot of the replay buffer, sent once per client
    /// right after WELCOME.
    Replay(Bytes),
    Ping,
    Pong,
    Hello { version: u32, client_type: ClientType },
    Welcome { pid: u32, cols: u16, rows: u16, start_time: String },
    Spawn(SpawnSpec),
    /// A type tag this build does not know. The payload was consumed;
    /// callers ignore the frame.
    Unknown(u8),
}

impl Frame {
    pub fn type_byte(&self) -> u8 {
        match self {
            Self::Data(_) => 0x01,
            Self::Resize { .. } => 0x02,
            Self::Signal(_) => 0x03,
            Self::Exit { .. } => 0x04,
            Self::Replay(_) => 0x05,
            Self::Ping => 0x06,
            Self::Pong => 0x07,
            Self::Hello { .. } => 0x08,
            Self::Welcome { .. } => 0x09,
            Self::Spawn(_) => 0x0A,
            Self::Unknown(b) => *b,
        }
    }

    fn payload(&self) -> io::Result<Bytes> {
        let json = |v: serde_json::Result<Vec<u8>>| -> io::Result<Bytes> {
            v.map(Bytes::from).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        };
        match self {
            Self::Data(b) | Self::Replay(b) => Ok(b.clone()),
            Self::Resize { cols, rows } => {
                json(serde_json::to_vec(&ResizePayload { cols: *cols, rows: *rows }))
            }
            Self::Signal(name) => json(serde_json::to_vec(&SignalPayload { name: *name })),
            Self::Exit { code, signal } => {
                json(serde_json::to_vec(&ExitPayload { code: *code, signal: signal.clone() }))
            }
            Self::Ping | Self::Pong => Ok(Bytes::new()),
            Self::Hello { version, client_type } => json(serde_json::to_vec(&HelloPayload {
                version: *version,
                client_type: *client_type,
            })),
            Self::Welcome { pid, cols, rows, start_time } => {
                json(serde_json::to_vec(&WelcomePayload {
                    pid: *pid,
                    cols: *cols,
                    rows: *rows,
                    start_time: start_time.clone(),
                }))
            }
            Self::Spawn(spec) => json(serde_json::to_vec(spec)),
            Self::Unknown(_) => Ok(Bytes::new()),
        }
    }
}

/// Encode a frame into a fresh buffer.
pub fn encode(frame: &Frame) -> io::Result<Bytes> {
    let payload = frame.payload()?;
    if payload.len() > MAX_PAYLOAD {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame payload exceeds 16 MiB"));
    }
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(frame.type_byte());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> io::Result<()> {
    let buf = encode(frame)?;
    w.write_all(&buf).await
}

/// Read one frame from the stream.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary. An oversized length
/// or a malformed JSON payload is an `InvalidData` error; callers drop the
/// connection (the sidecar itself keeps running).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Frame>> {
    let mut header = [0u8; 5];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let ty = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame payload exceeds 16 MiB"));
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;

    decode(ty, payload).map(Some)
}

fn decode(ty: u8, payload: Vec<u8>) -> io::Result<Frame> {
    fn json<T: serde::de::DeserializeOwned>(payload: &[u8]) -> io::Result<T> {
        serde_json::from_slice(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    Ok(match ty {
        0x01 => Frame::Data(Bytes::from(payload)),
        0x02 => {
            let p: ResizePayload = json(&payload)?;
            Frame::Resize { cols: p.cols, rows: p.rows }
        }
        0x03 => {
            let p: SignalPayload = json(&payload)?;
            Frame::Signal(p.name)
        }
        0x04 => {
            let p: ExitPayload = json(&payload)?;
            Frame::Exit { code: p.code, signal: p.signal }
        }
        0x05 => Frame::Replay(Bytes::from(payload)),
        0x06 => Frame::Ping,
        0x07 => Frame::Pong,
        0x08 => {
            let p: HelloPayload = json(&payload)?;
            Frame::Hello { version: p.version, client_type: p.client_type }
        }
        0x09 => {
            let p: WelcomePayload = json(&payload)?;
            Frame::Welcome { pid: p.pid, cols: p.cols, rows: p.rows, start_time: p.start_time }
        }
        0x0A => Frame::Spawn(json(&payload)?),
        other => Frame::Unknown(other),
    })
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
