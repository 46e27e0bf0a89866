//! Diameter message codec.
//!
//! A framed message is a 20-byte header followed by a sequence of AVPs
//! (RFC 3588 section 3):
//!
//! ```text
//! [version:1][length:3][flags:1][command:3][application_id:4]
//! [hop_by_hop:4][end_to_end:4][avps...]
//! ```
//!
//! Transport drivers frame on `version` + `length` and hand complete
//! messages to the protocol engine; `Message` carries the decoded header
//! and the ordered AVP list.

pub mod avp;
pub mod constants;

pub use avp::{failed_avp, Avp, VendorSpecificApplicationId};

use bytes::{Buf, BufMut, BytesMut};
use constants::{DIAMETER_VERSION, HEADER_SIZE};
use thiserror::Error;

/// Request flag (R bit).
pub const HDR_FLAG_REQUEST: u8 = 0x80;
/// Proxiable flag (P bit).
pub const HDR_FLAG_PROXIABLE: u8 = 0x40;
/// Error flag (E bit).
pub const HDR_FLAG_ERROR: u8 = 0x20;
/// Potentially-retransmitted flag (T bit).
pub const HDR_FLAG_RETRANSMIT: u8 = 0x10;

/// Largest message the node will frame or decode.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Errors from decoding a Diameter frame or interpreting an AVP.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported diameter version {0}")]
    BadVersion(u8),

    #[error("message length {0} out of bounds")]
    BadMessageLength(usize),

    #[error("buffer shorter than encoded length")]
    Truncated,

    #[error("invalid length for avp {code}")]
    InvalidAvpLength { code: u32 },

    #[error("invalid value for avp {code}")]
    InvalidAvpValue { code: u32 },
}

/// Decoded message header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub flags: u8,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop_identifier: u32,
    pub end_to_end_identifier: u32,
}

impl MessageHeader {
    pub fn is_request(&self) -> bool {
        self.flags & HDR_FLAG_REQUEST != 0
    }

    pub fn is_proxiable(&self) -> bool {
        self.flags & HDR_FLAG_PROXIABLE != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & HDR_FLAG_ERROR != 0
    }

    pub fn set_request(&mut self, value: bool) {
        if value {
            self.flags |= HDR_FLAG_REQUEST;
        } else {
            self.flags &= !HDR_FLAG_REQUEST;
        }
    }

    pub fn set_error(&mut self, value: bool) {
        if value {
            self.flags |= HDR_FLAG_ERROR;
        } else {
            self.flags &= !HDR_FLAG_ERROR;
        }
    }
}

/// A Diameter message: header plus ordered AVPs.
#[derive(Clone, Debug)]
pub struct Message {
    pub header: MessageHeader,
    pub avps: Vec<Avp>,
}

impl Message {
    /// Create an empty non-request message on the given command and
    /// application.
    pub fn new(command_code: u32, application_id: u32) -> Self {
        Self {
            header: MessageHeader {
                flags: 0,
                command_code,
                application_id,
                hop_by_hop_identifier: 0,
                end_to_end_identifier: 0,
            },
            avps: Vec::new(),
        }
    }

    /// Create a request message.
    pub fn request(command_code: u32, application_id: u32) -> Self {
        let mut msg = Self::new(command_code, application_id);
        msg.header.set_request(true);
        msg
    }

    /// Prepare an answer to a request: same command, application and
    /// identifiers, R bit cleared, P bit copied.
    pub fn answer_to(request: &Message) -> Self {
        Self {
            header: MessageHeader {
                flags: request.header.flags & HDR_FLAG_PROXIABLE,
                command_code: request.header.command_code,
                application_id: request.header.application_id,
                hop_by_hop_identifier: request.header.hop_by_hop_identifier,
                end_to_end_identifier: request.header.end_to_end_identifier,
            },
            avps: Vec::new(),
        }
    }

    pub fn add(&mut self, avp: Avp) {
        self.avps.push(avp);
    }

    /// First AVP with the given code, if any.
    pub fn find(&self, code: u32) -> Option<&Avp> {
        self.avps.iter().find(|a| a.code == code)
    }

    /// All AVPs with the given code, in message order.
    pub fn subset(&self, code: u32) -> impl Iterator<Item = &Avp> {
        self.avps.iter().filter(move |a| a.code == code)
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.avps.iter().map(Avp::padded_len).sum::<usize>()
    }

    /// Encode the full frame.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.encoded_len();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u32((u32::from(DIAMETER_VERSION) << 24) | (len as u32 & 0x00FF_FFFF));
        buf.put_u32((u32::from(self.header.flags) << 24) | (self.header.command_code & 0x00FF_FFFF));
        buf.put_u32(self.header.application_id);
        buf.put_u32(self.header.hop_by_hop_identifier);
        buf.put_u32(self.header.end_to_end_identifier);
        for avp in &self.avps {
            avp.encode(&mut buf);
        }
        buf.to_vec()
    }

    /// Decode a complete frame. The slice must contain exactly one
    /// message (the framing layer guarantees this).
    pub fn decode(raw: &[u8]) -> Result<Message, CodecError> {
        if raw.len() < HEADER_SIZE {
            return Err(CodecError::Truncated);
        }
        let mut cur = raw;
        let version_len = cur.get_u32();
        let version = (version_len >> 24) as u8;
        if version != DIAMETER_VERSION {
            return Err(CodecError::BadVersion(version));
        }
        let msg_len = (version_len & 0x00FF_FFFF) as usize;
        if msg_len < HEADER_SIZE || msg_len % 4 != 0 || msg_len > MAX_MESSAGE_SIZE {
            return Err(CodecError::BadMessageLength(msg_len));
        }
        if msg_len > raw.len() {
            return Err(CodecError::Truncated);
        }
        let flags_cmd = cur.get_u32();
        let header = MessageHeader {
            flags: (flags_cmd >> 24) as u8,
            command_code: flags_cmd & 0x00FF_FFFF,
            application_id: cur.get_u32(),
            hop_by_hop_identifier: cur.get_u32(),
            end_to_end_identifier: cur.get_u32(),
        };
        let mut avps = Vec::new();
        let mut body = &raw[HEADER_SIZE..msg_len];
        while !body.is_empty() {
            let (avp, consumed) = Avp::decode(body)?;
            avps.push(avp);
            body = &body[consumed..];
        }
        Ok(Message { header, avps })
    }

    /// Peek at a frame prefix: returns the declared message length once
    /// four bytes are available, after validating version and bounds.
    pub fn peek_length(prefix: &[u8]) -> Result<Option<usize>, CodecError> {
        if prefix.len() < 4 {
            return Ok(None);
        }
        if prefix[0] != DIAMETER_VERSION {
            return Err(CodecError::BadVersion(prefix[0]));
        }
        let len = (usize::from(prefix[1]) << 16) | (usize::from(prefix[2]) << 8) | usize::from(prefix[3]);
        if len < HEADER_SIZE || len % 4 != 0 || len > MAX_MESSAGE_SIZE {
            return Err(CodecError::BadMessageLength(len));
        }
        Ok(Some(len))
    }

    /// Copy every Proxy-Info AVP from a request into this answer.
    pub fn copy_proxy_info(&mut self, request: &Message) {
        for avp in request.subset(constants::avp::PROXY_INFO) {
            self.avps.push(avp.clone());
        }
    }
}
