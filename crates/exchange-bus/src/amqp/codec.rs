//! AMQP 0-9-1 frame codec.
//!
//! Covers the subset of the protocol the exchange client speaks: the
//! connection handshake, one channel, `basic.consume/publish/deliver/return`
//! and acknowledgements.
//!
//! ## Wire Layout
//!
//! ```text
//! ┌──────────┬────────────┬────────────┬─────────────────┬──────┐
//! │ type: u8 │ channel:16 │ size: u32  │ payload (size)  │ 0xCE │
//! └──────────┴────────────┴────────────┴─────────────────┴──────┘
//! ```
//!
//! All integers are big endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use exchange_types::MessageProperties;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sent by the client before any frame.
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// Frame type, channel and size.
const FRAME_HEADER_SIZE: usize = 7;
const FRAME_END: u8 = 0xCE;

const FRAME_METHOD: u8 = 1;
const FRAME_HEADER: u8 = 2;
const FRAME_BODY: u8 = 3;
const FRAME_HEARTBEAT: u8 = 8;

const CLASS_CONNECTION: u16 = 10;
const CLASS_CHANNEL: u16 = 20;
const CLASS_BASIC: u16 = 60;

// Basic property flags, most significant first.
const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;
const FLAG_CLUSTER_ID: u16 = 1 << 2;

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Frame truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Bad frame end marker 0x{0:02x}")]
    BadFrameEnd(u8),

    #[error("Unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Short string of {0} bytes exceeds 255")]
    ShortStringTooLong(usize),

    #[error("Unsupported field type '{0}'")]
    UnsupportedField(char),

    #[error("Peer does not speak AMQP 0-9-1")]
    ProtocolMismatch,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed by peer")]
    Eof,
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

type CodecResult<T> = Result<T, CodecError>;

// =============================================================================
// FIELD TABLES
// =============================================================================

/// Field table value. Only the shapes the broker sends us are kept apart.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Table(FieldTable),
    /// Arrays, decimals, timestamps and void
    Other,
}

impl FieldValue {
    /// Rendering used for string message headers.
    fn as_header(&self) -> Option<String> {
        match self {
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Table(_) | Self::Other => None,
        }
    }
}

pub type FieldTable = BTreeMap<String, FieldValue>;

// =============================================================================
// METHODS
// =============================================================================

/// Close reason carried by `connection.close` and `channel.close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub reply_code: u16,
    pub reply_text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl CloseReason {
    /// Normal shutdown initiated by the client.
    pub fn normal() -> Self {
        Self {
            reply_code: 200,
            reply_text: "Normal shutdown".to_string(),
            class_id: 0,
            method_id: 0,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.reply_code, self.reply_text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart {
        server_properties: FieldTable,
        mechanisms: String,
        locales: String,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: String,
        locale: String,
    },
    ConnectionSecure {
        challenge: String,
    },
    ConnectionSecureOk {
        response: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
    },
    ConnectionOpenOk,
    ConnectionClose(CloseReason),
    ConnectionCloseOk,
    ConnectionBlocked {
        reason: String,
    },
    ConnectionUnblocked,
    ChannelOpen,
    ChannelOpenOk,
    ChannelClose(CloseReason),
    ChannelCloseOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_ack: bool,
        exclusive: bool,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
    },
    BasicReturn {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    /// Anything outside the supported subset
    Unsupported { class_id: u16, method_id: u16 },
}

impl Method {
    fn ids(&self) -> (u16, u16) {
        match self {
            Self::ConnectionStart { .. } => (CLASS_CONNECTION, 10),
            Self::ConnectionStartOk { .. } => (CLASS_CONNECTION, 11),
            Self::ConnectionSecure { .. } => (CLASS_CONNECTION, 20),
            Self::ConnectionSecureOk { .. } => (CLASS_CONNECTION, 21),
            Self::ConnectionTune { .. } => (CLASS_CONNECTION, 30),
            Self::ConnectionTuneOk { .. } => (CLASS_CONNECTION, 31),
            Self::ConnectionOpen { .. } => (CLASS_CONNECTION, 40),
            Self::ConnectionOpenOk => (CLASS_CONNECTION, 41),
            Self::ConnectionClose(_) => (CLASS_CONNECTION, 50),
            Self::ConnectionCloseOk => (CLASS_CONNECTION, 51),
            Self::ConnectionBlocked { .. } => (CLASS_CONNECTION, 60),
            Self::ConnectionUnblocked => (CLASS_CONNECTION, 61),
            Self::ChannelOpen => (CLASS_CHANNEL, 10),
            Self::ChannelOpenOk => (CLASS_CHANNEL, 11),
            Self::ChannelClose(_) => (CLASS_CHANNEL, 40),
            Self::ChannelCloseOk => (CLASS_CHANNEL, 41),
            Self::BasicConsume { .. } => (CLASS_BASIC, 20),
            Self::BasicConsumeOk { .. } => (CLASS_BASIC, 21),
            Self::BasicCancel { .. } => (CLASS_BASIC, 30),
            Self::BasicPublish { .. } => (CLASS_BASIC, 40),
            Self::BasicReturn { .. } => (CLASS_BASIC, 50),
            Self::BasicDeliver { .. } => (CLASS_BASIC, 60),
            Self::BasicAck { .. } => (CLASS_BASIC, 80),
            Self::BasicNack { .. } => (CLASS_BASIC, 120),
            Self::Unsupported {
                class_id,
                method_id,
            } => (*class_id, *method_id),
        }
    }

    fn encode(&self, dst: &mut BytesMut) -> CodecResult<()> {
        let (class_id, method_id) = self.ids();
        dst.put_u16(class_id);
        dst.put_u16(method_id);

        match self {
            Self::ConnectionStart {
                server_properties,
                mechanisms,
                locales,
            } => {
                dst.put_u8(0);
                dst.put_u8(9);
                put_table(dst, server_properties)?;
                put_longstr(dst, mechanisms.as_bytes());
                put_longstr(dst, locales.as_bytes());
            }
            Self::ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                put_table(dst, client_properties)?;
                put_shortstr(dst, mechanism)?;
                put_longstr(dst, response.as_bytes());
                put_shortstr(dst, locale)?;
            }
            Self::ConnectionSecure { challenge } => put_longstr(dst, challenge.as_bytes()),
            Self::ConnectionSecureOk { response } => put_longstr(dst, response.as_bytes()),
            Self::ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | Self::ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                dst.put_u16(*channel_max);
                dst.put_u32(*frame_max);
                dst.put_u16(*heartbeat);
            }
            Self::ConnectionOpen { virtual_host } => {
                put_shortstr(dst, virtual_host)?;
                put_shortstr(dst, "")?;
                dst.put_u8(0);
            }
            Self::ConnectionOpenOk => put_shortstr(dst, "")?,
            Self::ConnectionClose(reason) | Self::ChannelClose(reason) => {
                dst.put_u16(reason.reply_code);
                put_shortstr(dst, &reason.reply_text)?;
                dst.put_u16(reason.class_id);
                dst.put_u16(reason.method_id);
            }
            Self::ConnectionBlocked { reason } => put_shortstr(dst, reason)?,
            Self::ChannelOpen => put_shortstr(dst, "")?,
            Self::ChannelOpenOk => put_longstr(dst, b""),
            Self::ConnectionCloseOk | Self::ConnectionUnblocked | Self::ChannelCloseOk => {}
            Self::BasicConsume {
                queue,
                consumer_tag,
                no_ack,
                exclusive,
            } => {
                dst.put_u16(0);
                put_shortstr(dst, queue)?;
                put_shortstr(dst, consumer_tag)?;
                // no-local, no-ack, exclusive, no-wait
                dst.put_u8(bits(&[false, *no_ack, *exclusive, false]));
                put_table(dst, &FieldTable::new())?;
            }
            Self::BasicConsumeOk { consumer_tag } => put_shortstr(dst, consumer_tag)?,
            Self::BasicCancel { consumer_tag } => {
                put_shortstr(dst, consumer_tag)?;
                dst.put_u8(0);
            }
            Self::BasicPublish {
                exchange,
                routing_key,
                mandatory,
            } => {
                dst.put_u16(0);
                put_shortstr(dst, exchange)?;
                put_shortstr(dst, routing_key)?;
                // mandatory, immediate
                dst.put_u8(bits(&[*mandatory, false]));
            }
            Self::BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                dst.put_u16(*reply_code);
                put_shortstr(dst, reply_text)?;
                put_shortstr(dst, exchange)?;
                put_shortstr(dst, routing_key)?;
            }
            Self::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                put_shortstr(dst, consumer_tag)?;
                dst.put_u64(*delivery_tag);
                dst.put_u8(bits(&[*redelivered]));
                put_shortstr(dst, exchange)?;
                put_shortstr(dst, routing_key)?;
            }
            Self::BasicAck {
                delivery_tag,
                multiple,
            } => {
                dst.put_u64(*delivery_tag);
                dst.put_u8(bits(&[*multiple]));
            }
            Self::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                dst.put_u64(*delivery_tag);
                dst.put_u8(bits(&[*multiple, *requeue]));
            }
            Self::Unsupported { .. } => {}
        }
        Ok(())
    }

    fn decode(src: &mut Bytes) -> CodecResult<Self> {
        let class_id = get_u16(src, "class id")?;
        let method_id = get_u16(src, "method id")?;

        let method = match (class_id, method_id) {
            (CLASS_CONNECTION, 10) => {
                let _major = get_u8(src, "version")?;
                let _minor = get_u8(src, "version")?;
                Self::ConnectionStart {
                    server_properties: get_table(src)?,
                    mechanisms: get_longstr_text(src)?,
                    locales: get_longstr_text(src)?,
                }
            }
            (CLASS_CONNECTION, 11) => Self::ConnectionStartOk {
                client_properties: get_table(src)?,
                mechanism: get_shortstr(src)?,
                response: get_longstr_text(src)?,
                locale: get_shortstr(src)?,
            },
            (CLASS_CONNECTION, 20) => Self::ConnectionSecure {
                challenge: get_longstr_text(src)?,
            },
            (CLASS_CONNECTION, 21) => Self::ConnectionSecureOk {
                response: get_longstr_text(src)?,
            },
            (CLASS_CONNECTION, 30) => Self::ConnectionTune {
                channel_max: get_u16(src, "channel max")?,
                frame_max: get_u32(src, "frame max")?,
                heartbeat: get_u16(src, "heartbeat")?,
            },
            (CLASS_CONNECTION, 31) => Self::ConnectionTuneOk {
                channel_max: get_u16(src, "channel max")?,
                frame_max: get_u32(src, "frame max")?,
                heartbeat: get_u16(src, "heartbeat")?,
            },
            (CLASS_CONNECTION, 40) => {
                let virtual_host = get_shortstr(src)?;
                let _capabilities = get_shortstr(src)?;
                let _insist = get_u8(src, "insist")?;
                Self::ConnectionOpen { virtual_host }
            }
            (CLASS_CONNECTION, 41) => Self::ConnectionOpenOk,
            (CLASS_CONNECTION, 50) => Self::ConnectionClose(get_close_reason(src)?),
            (CLASS_CONNECTION, 51) => Self::ConnectionCloseOk,
            (CLASS_CONNECTION, 60) => Self::ConnectionBlocked {
                reason: get_shortstr(src)?,
            },
            (CLASS_CONNECTION, 61) => Self::ConnectionUnblocked,
            (CLASS_CHANNEL, 10) => Self::ChannelOpen,
            (CLASS_CHANNEL, 11) => Self::ChannelOpenOk,
            (CLASS_CHANNEL, 40) => Self::ChannelClose(get_close_reason(src)?),
            (CLASS_CHANNEL, 41) => Self::ChannelCloseOk,
            (CLASS_BASIC, 20) => {
                let _ticket = get_u16(src, "ticket")?;
                let queue = get_shortstr(src)?;
                let consumer_tag = get_shortstr(src)?;
                let flags = get_u8(src, "consume flags")?;
                let _arguments = get_table(src)?;
                Self::BasicConsume {
                    queue,
                    consumer_tag,
                    no_ack: flags & 0b10 != 0,
                    exclusive: flags & 0b100 != 0,
                }
            }
            (CLASS_BASIC, 21) => Self::BasicConsumeOk {
                consumer_tag: get_shortstr(src)?,
            },
            (CLASS_BASIC, 30) => Self::BasicCancel {
                consumer_tag: get_shortstr(src)?,
            },
            (CLASS_BASIC, 40) => {
                let _ticket = get_u16(src, "ticket")?;
                let exchange = get_shortstr(src)?;
                let routing_key = get_shortstr(src)?;
                let flags = get_u8(src, "publish flags")?;
                Self::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory: flags & 0b1 != 0,
                }
            }
            (CLASS_BASIC, 50) => Self::BasicReturn {
                reply_code: get_u16(src, "reply code")?,
                reply_text: get_shortstr(src)?,
                exchange: get_shortstr(src)?,
                routing_key: get_shortstr(src)?,
            },
            (CLASS_BASIC, 60) => Self::BasicDeliver {
                consumer_tag: get_shortstr(src)?,
                delivery_tag: get_u64(src, "delivery tag")?,
                redelivered: get_u8(src, "redelivered")? & 0b1 != 0,
                exchange: get_shortstr(src)?,
                routing_key: get_shortstr(src)?,
            },
            (CLASS_BASIC, 80) => Self::BasicAck {
                delivery_tag: get_u64(src, "delivery tag")?,
                multiple: get_u8(src, "ack flags")? & 0b1 != 0,
            },
            (CLASS_BASIC, 120) => {
                let delivery_tag = get_u64(src, "delivery tag")?;
                let flags = get_u8(src, "nack flags")?;
                Self::BasicNack {
                    delivery_tag,
                    multiple: flags & 0b1 != 0,
                    requeue: flags & 0b10 != 0,
                }
            }
            (class_id, method_id) => Self::Unsupported {
                class_id,
                method_id,
            },
        };
        Ok(method)
    }
}

// =============================================================================
// FRAMES
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Method {
        channel: u16,
        method: Method,
    },
    /// Content header; `properties` is `None` when no property flag is set.
    Header {
        channel: u16,
        body_size: u64,
        properties: Option<MessageProperties>,
    },
    Body {
        channel: u16,
        payload: Bytes,
    },
    Heartbeat,
}

impl Frame {
    pub fn method(channel: u16, method: Method) -> Self {
        Self::Method { channel, method }
    }

    /// Append the wire form of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> CodecResult<()> {
        let mut payload = BytesMut::new();
        let (frame_type, channel) = match self {
            Self::Method { channel, method } => {
                method.encode(&mut payload)?;
                (FRAME_METHOD, *channel)
            }
            Self::Header {
                channel,
                body_size,
                properties,
            } => {
                payload.put_u16(CLASS_BASIC);
                payload.put_u16(0);
                payload.put_u64(*body_size);
                put_properties(&mut payload, properties.as_ref())?;
                (FRAME_HEADER, *channel)
            }
            Self::Body { channel, payload: body } => {
                payload.put_slice(body);
                (FRAME_BODY, *channel)
            }
            Self::Heartbeat => (FRAME_HEARTBEAT, 0),
        };

        dst.put_u8(frame_type);
        dst.put_u16(channel);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }

    /// Take one complete frame off the front of `buf`.
    ///
    /// Returns `None` while the frame is still incomplete.
    pub fn parse(buf: &mut BytesMut, max_size: usize) -> CodecResult<Option<Self>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        if buf.starts_with(b"AMQP") {
            // the broker answers an unsupported protocol header with its own
            return Err(CodecError::ProtocolMismatch);
        }

        let size = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
        if size > max_size {
            return Err(CodecError::FrameTooLarge {
                size,
                max: max_size,
            });
        }
        if buf.len() < FRAME_HEADER_SIZE + size + 1 {
            return Ok(None);
        }

        let mut frame = buf.split_to(FRAME_HEADER_SIZE + size + 1).freeze();
        let frame_type = frame.get_u8();
        let channel = frame.get_u16();
        let _size = frame.get_u32();
        let mut payload = frame.split_to(size);
        let end = frame.get_u8();
        if end != FRAME_END {
            return Err(CodecError::BadFrameEnd(end));
        }

        let parsed = match frame_type {
            FRAME_METHOD => Self::Method {
                channel,
                method: Method::decode(&mut payload)?,
            },
            FRAME_HEADER => {
                let _class_id = get_u16(&mut payload, "header class")?;
                let _weight = get_u16(&mut payload, "header weight")?;
                let body_size = get_u64(&mut payload, "body size")?;
                Self::Header {
                    channel,
                    body_size,
                    properties: get_properties(&mut payload)?,
                }
            }
            FRAME_BODY => Self::Body { channel, payload },
            FRAME_HEARTBEAT => Self::Heartbeat,
            other => return Err(CodecError::UnknownFrameType(other)),
        };
        Ok(Some(parsed))
    }
}

// =============================================================================
// FRAME I/O
// =============================================================================

/// Buffered frame reader over one half of a broker socket.
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
    max_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, max_size: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(8 * 1024),
            max_size,
        }
    }

    /// Continue reading from `io` with bytes already buffered by another reader.
    pub fn resume(io: R, buf: BytesMut, max_size: usize) -> Self {
        Self { io, buf, max_size }
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    pub async fn read_frame(&mut self) -> CodecResult<Frame> {
        loop {
            if let Some(frame) = Frame::parse(&mut self.buf, self.max_size)? {
                return Ok(frame);
            }
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(CodecError::Eof);
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.io
    }

    pub fn into_parts(self) -> (R, BytesMut) {
        (self.io, self.buf)
    }
}

/// Write `frames` in one flush.
pub async fn write_frames<W: AsyncWrite + Unpin>(io: &mut W, frames: &[Frame]) -> CodecResult<()> {
    let mut out = BytesMut::new();
    for frame in frames {
        frame.encode(&mut out)?;
    }
    io.write_all(&out).await?;
    io.flush().await?;
    Ok(())
}

// =============================================================================
// PRIMITIVES
// =============================================================================

fn bits(flags: &[bool]) -> u8 {
    flags
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, set)| if *set { acc | (1 << i) } else { acc })
}

fn need(src: &Bytes, n: usize, what: &'static str) -> CodecResult<()> {
    if src.remaining() < n {
        Err(CodecError::Truncated(what))
    } else {
        Ok(())
    }
}

fn get_u8(src: &mut Bytes, what: &'static str) -> CodecResult<u8> {
    need(src, 1, what)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes, what: &'static str) -> CodecResult<u16> {
    need(src, 2, what)?;
    Ok(src.get_u16())
}

fn get_u32(src: &mut Bytes, what: &'static str) -> CodecResult<u32> {
    need(src, 4, what)?;
    Ok(src.get_u32())
}

fn get_u64(src: &mut Bytes, what: &'static str) -> CodecResult<u64> {
    need(src, 8, what)?;
    Ok(src.get_u64())
}

fn get_shortstr(src: &mut Bytes) -> CodecResult<String> {
    let len = get_u8(src, "short string length")? as usize;
    need(src, len, "short string")?;
    let raw = src.split_to(len);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn get_longstr(src: &mut Bytes) -> CodecResult<Bytes> {
    let len = get_u32(src, "long string length")? as usize;
    need(src, len, "long string")?;
    Ok(src.split_to(len))
}

fn get_longstr_text(src: &mut Bytes) -> CodecResult<String> {
    let raw = get_longstr(src)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn put_shortstr(dst: &mut BytesMut, value: &str) -> CodecResult<()> {
    let len = value.len();
    if len > u8::MAX as usize {
        return Err(CodecError::ShortStringTooLong(len));
    }
    dst.put_u8(len as u8);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_longstr(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

fn get_close_reason(src: &mut Bytes) -> CodecResult<CloseReason> {
    Ok(CloseReason {
        reply_code: get_u16(src, "reply code")?,
        reply_text: get_shortstr(src)?,
        class_id: get_u16(src, "class id")?,
        method_id: get_u16(src, "method id")?,
    })
}

fn get_table(src: &mut Bytes) -> CodecResult<FieldTable> {
    let mut raw = get_longstr(src)?;
    let mut table = FieldTable::new();
    while raw.has_remaining() {
        let name = get_shortstr(&mut raw)?;
        let value = get_field(&mut raw)?;
        table.insert(name, value);
    }
    Ok(table)
}

fn get_field(src: &mut Bytes) -> CodecResult<FieldValue> {
    let tag = get_u8(src, "field type")?;
    let value = match tag {
        b't' => FieldValue::Bool(get_u8(src, "bool")? != 0),
        b'b' => FieldValue::Int(i64::from(get_u8(src, "i8")? as i8)),
        b'B' => FieldValue::Int(i64::from(get_u8(src, "u8")?)),
        b's' => FieldValue::Int(i64::from(get_u16(src, "i16")? as i16)),
        b'u' => FieldValue::Int(i64::from(get_u16(src, "u16")?)),
        b'I' => FieldValue::Int(i64::from(get_u32(src, "i32")? as i32)),
        b'i' => FieldValue::Int(i64::from(get_u32(src, "u32")?)),
        b'l' => FieldValue::Int(get_u64(src, "i64")? as i64),
        b'f' => FieldValue::Float(f64::from(f32::from_bits(get_u32(src, "f32")?))),
        b'd' => FieldValue::Float(f64::from_bits(get_u64(src, "f64")?)),
        b'S' => FieldValue::Text(get_longstr_text(src)?),
        b'F' => FieldValue::Table(get_table(src)?),
        b'D' => {
            need(src, 5, "decimal")?;
            src.advance(5);
            FieldValue::Other
        }
        b'T' => {
            get_u64(src, "timestamp")?;
            FieldValue::Other
        }
        b'x' | b'A' => {
            // arrays and byte arrays share the long string framing
            get_longstr(src)?;
            FieldValue::Other
        }
        b'V' => FieldValue::Other,
        other => return Err(CodecError::UnsupportedField(other as char)),
    };
    Ok(value)
}

fn put_table(dst: &mut BytesMut, table: &FieldTable) -> CodecResult<()> {
    let mut body = BytesMut::new();
    for (name, value) in table {
        put_shortstr(&mut body, name)?;
        put_field(&mut body, value)?;
    }
    put_longstr(dst, &body);
    Ok(())
}

fn put_field(dst: &mut BytesMut, value: &FieldValue) -> CodecResult<()> {
    match value {
        FieldValue::Bool(b) => {
            dst.put_u8(b't');
            dst.put_u8(u8::from(*b));
        }
        FieldValue::Int(i) => {
            dst.put_u8(b'l');
            dst.put_i64(*i);
        }
        FieldValue::Float(f) => {
            dst.put_u8(b'd');
            dst.put_f64(*f);
        }
        FieldValue::Text(s) => {
            dst.put_u8(b'S');
            put_longstr(dst, s.as_bytes());
        }
        FieldValue::Table(t) => {
            dst.put_u8(b'F');
            put_table(dst, t)?;
        }
        FieldValue::Other => dst.put_u8(b'V'),
    }
    Ok(())
}

// =============================================================================
// BASIC PROPERTIES
// =============================================================================

fn put_properties(dst: &mut BytesMut, properties: Option<&MessageProperties>) -> CodecResult<()> {
    let Some(properties) = properties else {
        dst.put_u16(0);
        return Ok(());
    };

    let mut flags = 0u16;
    if !properties.headers.is_empty() {
        flags |= FLAG_HEADERS;
    }
    if properties.correlation_id.is_some() {
        flags |= FLAG_CORRELATION_ID;
    }
    if properties.reply_to.is_some() {
        flags |= FLAG_REPLY_TO;
    }
    if properties.message_id.is_some() {
        flags |= FLAG_MESSAGE_ID;
    }
    dst.put_u16(flags);

    if !properties.headers.is_empty() {
        let table: FieldTable = properties
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), FieldValue::Text(v.clone())))
            .collect();
        put_table(dst, &table)?;
    }
    if let Some(correlation_id) = &properties.correlation_id {
        put_shortstr(dst, correlation_id)?;
    }
    if let Some(reply_to) = &properties.reply_to {
        put_shortstr(dst, reply_to)?;
    }
    if let Some(message_id) = &properties.message_id {
        put_shortstr(dst, message_id)?;
    }
    Ok(())
}

fn get_properties(src: &mut Bytes) -> CodecResult<Option<MessageProperties>> {
    let flags = get_u16(src, "property flags")?;
    if flags == 0 {
        return Ok(None);
    }

    let mut properties = MessageProperties::default();
    if flags & FLAG_CONTENT_TYPE != 0 {
        get_shortstr(src)?;
    }
    if flags & FLAG_CONTENT_ENCODING != 0 {
        get_shortstr(src)?;
    }
    if flags & FLAG_HEADERS != 0 {
        properties.headers = get_table(src)?
            .into_iter()
            .filter_map(|(k, v)| v.as_header().map(|v| (k, v)))
            .collect();
    }
    if flags & FLAG_DELIVERY_MODE != 0 {
        get_u8(src, "delivery mode")?;
    }
    if flags & FLAG_PRIORITY != 0 {
        get_u8(src, "priority")?;
    }
    if flags & FLAG_CORRELATION_ID != 0 {
        properties.correlation_id = Some(get_shortstr(src)?);
    }
    if flags & FLAG_REPLY_TO != 0 {
        properties.reply_to = Some(get_shortstr(src)?);
    }
    if flags & FLAG_EXPIRATION != 0 {
        get_shortstr(src)?;
    }
    if flags & FLAG_MESSAGE_ID != 0 {
        properties.message_id = Some(get_shortstr(src)?);
    }
    if flags & FLAG_TIMESTAMP != 0 {
        get_u64(src, "timestamp")?;
    }
    for flag in [FLAG_TYPE, FLAG_USER_ID, FLAG_APP_ID, FLAG_CLUSTER_ID] {
        if flags & flag != 0 {
            get_shortstr(src)?;
        }
    }
    Ok(Some(properties))
}
