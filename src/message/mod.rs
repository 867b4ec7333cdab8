//! CoAP message model and binary codec (RFC 7252 section 3).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

pub mod block;
pub mod option_def;
pub mod options;

use std::fmt;

use thiserror::Error;

pub use options::{CoapOption, OptionValue, Options};

use options::decode_uint;

/// The four message types of the datagram exchange pattern.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub enum MessageType {
    #[default]
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn from_bits(t: u8) -> MessageType {
        match t & 0x3 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Confirmable => "Confirmable",
            MessageType::NonConfirmable => "NonConfirmable",
            MessageType::Acknowledgement => "Acknowledgement",
            MessageType::Reset => "Reset",
        };
        f.write_str(name)
    }
}

/// An 8-bit code `c.dd`: class in the top three bits, detail in the
/// bottom five. Class 0 is a request method, 2 success, 4 client
/// error, 5 server error; `0.00` marks an empty message.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0);

    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const DELETE: Code = Code::new(0, 4);

    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);
    pub const CONTINUE: Code = Code::new(2, 31);

    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    pub const BAD_OPTION: Code = Code::new(4, 2);
    pub const FORBIDDEN: Code = Code::new(4, 3);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const NOT_ACCEPTABLE: Code = Code::new(4, 6);
    pub const REQUEST_ENTITY_INCOMPLETE: Code = Code::new(4, 8);
    pub const PRECONDITION_FAILED: Code = Code::new(4, 12);
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);
    pub const UNSUPPORTED_CONTENT_FORMAT: Code = Code::new(4, 15);

    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const NOT_IMPLEMENTED: Code = Code::new(5, 1);
    pub const BAD_GATEWAY: Code = Code::new(5, 2);
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);
    pub const GATEWAY_TIMEOUT: Code = Code::new(5, 4);
    pub const PROXYING_NOT_SUPPORTED: Code = Code::new(5, 5);

    pub const fn new(class: u8, detail: u8) -> Code {
        Code(class << 5 | detail & 0x1f)
    }

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_request(self) -> bool {
        !self.is_empty() && self.class() == 0
    }

    pub fn is_response(self) -> bool {
        matches!(self.class(), 2..=5)
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Code::GET => "GET",
            Code::POST => "POST",
            Code::PUT => "PUT",
            Code::DELETE => "DELETE",
            Code::CREATED => "Created",
            Code::DELETED => "Deleted",
            Code::VALID => "Valid",
            Code::CHANGED => "Changed",
            Code::CONTENT => "Content",
            Code::CONTINUE => "Continue",
            Code::BAD_REQUEST => "BadRequest",
            Code::UNAUTHORIZED => "Unauthorized",
            Code::BAD_OPTION => "BadOption",
            Code::FORBIDDEN => "Forbidden",
            Code::NOT_FOUND => "NotFound",
            Code::METHOD_NOT_ALLOWED => "MethodNotAllowed",
            Code::NOT_ACCEPTABLE => "NotAcceptable",
            Code::REQUEST_ENTITY_INCOMPLETE => "RequestEntityIncomplete",
            Code::PRECONDITION_FAILED => "PreconditionFailed",
            Code::REQUEST_ENTITY_TOO_LARGE => "RequestEntityTooLarge",
            Code::UNSUPPORTED_CONTENT_FORMAT => "UnsupportedContentFormat",
            Code::INTERNAL_SERVER_ERROR => "InternalServerError",
            Code::NOT_IMPLEMENTED => "NotImplemented",
            Code::BAD_GATEWAY => "BadGateway",
            Code::SERVICE_UNAVAILABLE => "ServiceUnavailable",
            Code::GATEWAY_TIMEOUT => "GatewayTimeout",
            Code::PROXYING_NOT_SUPPORTED => "ProxyingNotSupported",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}.{:02}", self.class(), self.detail()),
        }
    }
}

/// A complete CoAP message.
#[derive(Clone, Default, PartialEq, Debug)]
pub struct Message {
    pub message_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Options,
    pub payload: Vec<u8>,
}

/// Error from [`Message::to_bytes`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("token length {0} exceeds 8 bytes")]
    TokenTooLong(usize),
    #[error("option {0} value of {1} bytes cannot be encoded")]
    OptionTooLong(u16, usize),
}

/// What went wrong while decoding a datagram.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DecodeErrorKind {
    #[error("short packet")]
    ShortPacket,
    #[error("invalid version {0}")]
    InvalidVersion(u8),
    #[error("token length {0} exceeds 8 bytes")]
    TokenLength(usize),
    #[error("token truncated")]
    TokenTruncated,
    #[error("option truncated")]
    OptionTruncated,
    #[error("reserved option header")]
    ReservedOptionHeader,
    #[error("payload marker with no payload")]
    MissingPayload,
    #[error("unrecognized critical options")]
    BadOptions,
}

/// Error from [`Message::from_bytes`]. Carries whatever could be
/// parsed, so the reply policy can answer with the offending
/// message-id and token.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub message: Message,
}

impl DecodeError {
    fn new(kind: DecodeErrorKind, message: Message) -> DecodeError {
        DecodeError { kind, message }
    }

    /// True for every malformed-datagram error; false for the
    /// bad-critical-option case, where the message itself parsed.
    pub fn is_format_error(&self) -> bool {
        self.kind != DecodeErrorKind::BadOptions
    }
}

impl Message {
    pub fn new() -> Message {
        Message::default()
    }

    /// An empty acknowledgement for the given message-id.
    pub fn ack(message_id: u16) -> Message {
        Message {
            message_type: MessageType::Acknowledgement,
            message_id,
            ..Message::default()
        }
    }

    /// A reset for the given message-id.
    pub fn rst(message_id: u16) -> Message {
        Message { message_type: MessageType::Reset, message_id, ..Message::default() }
    }

    /// Serializes the message to its wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        if self.token.len() > 8 {
            return Err(EncodeError::TokenTooLong(self.token.len()));
        }

        let mut buf = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);
        buf.push(0x40 | self.message_type.bits() << 4 | self.token.len() as u8);
        buf.push(self.code.0);
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(&self.token);

        let mut prev = 0u16;
        for opt in self.options.sorted() {
            let value = opt.value.to_bytes();
            let delta = (opt.id - prev) as usize;
            let (delta_nibble, delta_ext) = encode_ext(delta)
                .ok_or(EncodeError::OptionTooLong(opt.id, value.len()))?;
            let (len_nibble, len_ext) = encode_ext(value.len())
                .ok_or(EncodeError::OptionTooLong(opt.id, value.len()))?;
            buf.push(delta_nibble << 4 | len_nibble);
            buf.extend_from_slice(&delta_ext);
            buf.extend_from_slice(&len_ext);
            buf.extend_from_slice(&value);
            prev = opt.id;
        }

        if !self.payload.is_empty() {
            buf.push(0xff);
            buf.extend_from_slice(&self.payload);
        }
        Ok(buf)
    }

    /// Parses a datagram.
    ///
    /// Unrecognized elective options are skipped. An unrecognized
    /// critical option keeps parsing to the end and then fails with
    /// [`DecodeErrorKind::BadOptions`] wrapping the otherwise-parsed
    /// message.
    pub fn from_bytes(data: &[u8]) -> Result<Message, DecodeError> {
        let mut m = Message::default();
        if data.len() < 4 {
            return Err(DecodeError::new(DecodeErrorKind::ShortPacket, m));
        }

        let flags = data[0];
        m.message_type = MessageType::from_bits(flags >> 4);
        m.code = Code(data[1]);
        m.message_id = u16::from_be_bytes([data[2], data[3]]);

        let version = flags >> 6;
        if version != 1 {
            return Err(DecodeError::new(DecodeErrorKind::InvalidVersion(version), m));
        }
        let tkl = (flags & 0x0f) as usize;
        if tkl > 8 {
            return Err(DecodeError::new(DecodeErrorKind::TokenLength(tkl), m));
        }
        if data.len() < 4 + tkl {
            return Err(DecodeError::new(DecodeErrorKind::TokenTruncated, m));
        }
        m.token = data[4..4 + tkl].to_vec();

        let mut idx = 4 + tkl;
        let mut id = 0u16;
        let mut repeat = 0usize;
        let mut unrecognized = false;
        while idx < data.len() {
            let flag = data[idx];
            idx += 1;
            if flag == 0xff {
                if idx == data.len() {
                    return Err(DecodeError::new(DecodeErrorKind::MissingPayload, m));
                }
                m.payload = data[idx..].to_vec();
                break;
            }

            let delta = match decode_ext(flag >> 4, data, &mut idx) {
                Ok(v) => v,
                Err(kind) => return Err(DecodeError::new(kind, m)),
            };
            let length = match decode_ext(flag & 0x0f, data, &mut idx) {
                Ok(v) => v,
                Err(kind) => return Err(DecodeError::new(kind, m)),
            };
            if delta == 0 {
                repeat += 1;
            } else {
                repeat = 1;
                id = id.wrapping_add(delta as u16);
            }

            if idx + length > data.len() {
                return Err(DecodeError::new(DecodeErrorKind::OptionTruncated, m));
            }
            let raw = &data[idx..idx + length];
            idx += length;

            if !option_def::recognize(id, raw.len(), repeat) {
                if !option_def::critical(id) {
                    continue;
                }
                unrecognized = true;
            }
            m.options.add(id, decode_value(id, raw));
        }

        if unrecognized {
            return Err(DecodeError::new(DecodeErrorKind::BadOptions, m));
        }
        Ok(m)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.message_type, self.code, self.message_id)?;
        if !self.token.is_empty() {
            f.write_str(",")?;
            for b in &self.token {
                write!(f, "{:02x}", b)?;
            }
        }
        Ok(())
    }
}

fn encode_ext(v: usize) -> Option<(u8, Vec<u8>)> {
    if v < 13 {
        Some((v as u8, Vec::new()))
    } else if v < 269 {
        Some((13, vec![(v - 13) as u8]))
    } else if v < 269 + 65536 {
        Some((14, ((v - 269) as u16).to_be_bytes().to_vec()))
    } else {
        None
    }
}

fn decode_ext(nibble: u8, data: &[u8], idx: &mut usize) -> Result<usize, DecodeErrorKind> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            if *idx >= data.len() {
                return Err(DecodeErrorKind::OptionTruncated);
            }
            let v = 13 + data[*idx] as usize;
            *idx += 1;
            Ok(v)
        }
        14 => {
            if *idx + 1 >= data.len() {
                return Err(DecodeErrorKind::OptionTruncated);
            }
            let v = 269 + u16::from_be_bytes([data[*idx], data[*idx + 1]]) as usize;
            *idx += 2;
            Ok(v)
        }
        _ => Err(DecodeErrorKind::ReservedOptionHeader),
    }
}

fn decode_value(id: u16, raw: &[u8]) -> OptionValue {
    use option_def::OptionFormat;
    let format = option_def::lookup(id).map(|d| d.format).unwrap_or(OptionFormat::Opaque);
    match format {
        OptionFormat::Empty => OptionValue::Empty,
        OptionFormat::Uint => OptionValue::Uint(decode_uint(raw)),
        OptionFormat::String => OptionValue::String(String::from_utf8_lossy(raw).into_owned()),
        OptionFormat::Opaque => OptionValue::Opaque(raw.to_vec()),
    }
}
