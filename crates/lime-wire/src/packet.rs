//! Binary packet codec.
//!
//! Every frame on the wire is `[opcode: u32][len: u32][payload: len bytes]`,
//! with all integers little-endian. Payload layouts per opcode:
//!
//! | opcode | payload |
//! |---|---|
//! | `HANDSHAKE_CHALLENGE`, `HANDSHAKE_RESPONSE` | raw token bytes |
//! | `HEARTBEAT` | raw nonce bytes |
//! | `DISCONNECT` | UTF-8 reason, possibly empty |
//! | `JOB`, `TASK` | `[kind: u32]` then, only when arguments are present, `[args_len: u32][args: UTF-8]` |
//! | `STATISTIC` | `[kind: u32][min: i64][max: i64][current: i64]` |

use crate::error::{WireError, WireResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use lime_types::task::{Statistic, StatisticKind, Task, TaskKind, TaskMode};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Exact size of a `STATISTIC` payload.
pub const STATISTIC_PAYLOAD_LEN: usize = 4 + 8 * 3;

/// Packet discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    HandshakeChallenge = 1,
    HandshakeResponse = 2,
    Heartbeat = 3,
    Disconnect = 4,
    Job = 5,
    Task = 6,
    Statistic = 7,
}

impl Opcode {
    /// Every opcode, in wire-value order.
    pub const ALL: [Opcode; 7] = [
        Opcode::HandshakeChallenge,
        Opcode::HandshakeResponse,
        Opcode::Heartbeat,
        Opcode::Disconnect,
        Opcode::Job,
        Opcode::Task,
        Opcode::Statistic,
    ];

    /// Wire value.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Opcode {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Opcode::ALL
            .into_iter()
            .find(|op| op.code() == value)
            .ok_or(WireError::UnknownOpcode(value))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::HandshakeChallenge => "HANDSHAKE_CHALLENGE",
            Opcode::HandshakeResponse => "HANDSHAKE_RESPONSE",
            Opcode::Heartbeat => "HEARTBEAT",
            Opcode::Disconnect => "DISCONNECT",
            Opcode::Job => "JOB",
            Opcode::Task => "TASK",
            Opcode::Statistic => "STATISTIC",
        };
        f.write_str(name)
    }
}

/// One undecoded frame: a known opcode and its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Mediator → agent: token the agent must echo.
    HandshakeChallenge(Bytes),
    /// Agent → mediator: the echoed token.
    HandshakeResponse(Bytes),
    /// Liveness probe (mediator → agent) or its echo (agent → mediator).
    Heartbeat(Bytes),
    /// Either side: the connection is ending, with a human-readable reason.
    Disconnect(String),
    /// Mediator → agent: work. Sent as `TASK` or `JOB` depending on the mode.
    Task(Task),
    /// Agent → mediator: a measurement produced by a task.
    Statistic(Statistic),
}

impl Packet {
    /// The opcode this packet is framed with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::HandshakeChallenge(_) => Opcode::HandshakeChallenge,
            Packet::HandshakeResponse(_) => Opcode::HandshakeResponse,
            Packet::Heartbeat(_) => Opcode::Heartbeat,
            Packet::Disconnect(_) => Opcode::Disconnect,
            Packet::Task(task) => match task.mode {
                TaskMode::Once => Opcode::Task,
                TaskMode::Recurring => Opcode::Job,
            },
            Packet::Statistic(_) => Opcode::Statistic,
        }
    }

    /// Serialize the payload (without the frame header).
    pub fn payload(&self) -> WireResult<Bytes> {
        match self {
            Packet::HandshakeChallenge(b) | Packet::HandshakeResponse(b) | Packet::Heartbeat(b) => {
                Ok(b.clone())
            }
            Packet::Disconnect(reason) => Ok(Bytes::copy_from_slice(reason.as_bytes())),
            Packet::Task(task) => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_u32_le(task.kind.code());
                if let Some(args) = &task.args {
                    buf.put_u32_le(wire_len(args.len())?);
                    buf.put_slice(args.as_bytes());
                }
                Ok(buf.freeze())
            }
            Packet::Statistic(stat) => {
                let mut buf = BytesMut::with_capacity(STATISTIC_PAYLOAD_LEN);
                buf.put_u32_le(stat.kind.code());
                buf.put_i64_le(stat.min);
                buf.put_i64_le(stat.max);
                buf.put_i64_le(stat.current);
                Ok(buf.freeze())
            }
        }
    }

    /// Serialize into a complete frame.
    pub fn encode(&self) -> WireResult<Bytes> {
        encode_frame(self.opcode(), &self.payload()?)
    }

    /// Interpret a frame's payload according to its opcode.
    pub fn decode(frame: Frame) -> WireResult<Packet> {
        let Frame { opcode, payload } = frame;
        match opcode {
            Opcode::HandshakeChallenge => Ok(Packet::HandshakeChallenge(payload)),
            Opcode::HandshakeResponse => Ok(Packet::HandshakeResponse(payload)),
            Opcode::Heartbeat => Ok(Packet::Heartbeat(payload)),
            Opcode::Disconnect => String::from_utf8(payload.to_vec())
                .map(Packet::Disconnect)
                .map_err(|_| malformed(opcode, "reason is not valid UTF-8")),
            Opcode::Task => decode_task(opcode, payload, TaskMode::Once).map(Packet::Task),
            Opcode::Job => decode_task(opcode, payload, TaskMode::Recurring).map(Packet::Task),
            Opcode::Statistic => decode_statistic(payload).map(Packet::Statistic),
        }
    }
}

fn malformed(opcode: Opcode, reason: impl Into<String>) -> WireError {
    WireError::MalformedPayload {
        opcode,
        reason: reason.into(),
    }
}

fn wire_len(len: usize) -> WireResult<u32> {
    u32::try_from(len).map_err(|_| WireError::PayloadTooLarge {
        size: u32::MAX,
        max: u32::MAX,
    })
}

fn decode_task(opcode: Opcode, mut payload: Bytes, mode: TaskMode) -> WireResult<Task> {
    if payload.remaining() < 4 {
        return Err(malformed(opcode, "missing task kind"));
    }
    let kind = TaskKind::try_from(payload.get_u32_le())
        .map_err(|code| malformed(opcode, format!("unknown task kind {code}")))?;

    let args = if payload.has_remaining() {
        if payload.remaining() < 4 {
            return Err(malformed(opcode, "truncated argument length"));
        }
        let len = payload.get_u32_le() as usize;
        if payload.remaining() != len {
            return Err(malformed(
                opcode,
                format!(
                    "argument length {len} does not match {} remaining bytes",
                    payload.remaining()
                ),
            ));
        }
        let raw = payload.split_to(len);
        let args = String::from_utf8(raw.to_vec())
            .map_err(|_| malformed(opcode, "arguments are not valid UTF-8"))?;
        Some(args)
    } else {
        None
    };

    Ok(Task { kind, args, mode })
}

fn decode_statistic(mut payload: Bytes) -> WireResult<Statistic> {
    if payload.len() != STATISTIC_PAYLOAD_LEN {
        return Err(malformed(
            Opcode::Statistic,
            format!(
                "expected {STATISTIC_PAYLOAD_LEN} bytes, got {}",
                payload.len()
            ),
        ));
    }
    let kind = StatisticKind::try_from(payload.get_u32_le())
        .map_err(|code| malformed(Opcode::Statistic, format!("unknown statistic kind {code}")))?;
    Ok(Statistic {
        kind,
        min: payload.get_i64_le(),
        max: payload.get_i64_le(),
        current: payload.get_i64_le(),
    })
}

/// Build a frame: header followed by the payload.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> WireResult<Bytes> {
    let len = wire_len(payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(opcode.code());
    buf.put_u32_le(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Fill `buf` completely, or report how many bytes arrived before EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> WireResult<Result<(), usize>>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(Err(filled));
        }
        filled += n;
    }
    Ok(Ok(()))
}

/// Read exactly one frame.
///
/// A clean EOF before the first header byte is [`WireError::ConnectionClosed`];
/// EOF anywhere later is [`WireError::TruncatedStream`]. The declared length is
/// checked against `max_payload` before any payload buffer is allocated.
pub async fn read_frame<R>(reader: &mut R, max_payload: u32) -> WireResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match read_full(reader, &mut header).await? {
        Ok(()) => {}
        Err(0) => return Err(WireError::ConnectionClosed),
        Err(received) => {
            return Err(WireError::TruncatedStream {
                expected: HEADER_LEN,
                received,
            })
        }
    }

    let mut hdr = &header[..];
    let raw_opcode = hdr.get_u32_le();
    let len = hdr.get_u32_le();
    if len > max_payload {
        return Err(WireError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }
    let opcode = Opcode::try_from(raw_opcode)?;

    let mut payload = vec![0u8; len as usize];
    if let Err(received) = read_full(reader, &mut payload).await? {
        return Err(WireError::TruncatedStream {
            expected: HEADER_LEN + len as usize,
            received: HEADER_LEN + received,
        });
    }

    Ok(Frame {
        opcode,
        payload: Bytes::from(payload),
    })
}

/// Read and decode one packet.
pub async fn read_packet<R>(reader: &mut R, max_payload: u32) -> WireResult<Packet>
where
    R: AsyncRead + Unpin,
{
    Packet::decode(read_frame(reader, max_payload).await?)
}

/// Encode and write one packet, then flush.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> WireResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = packet.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
