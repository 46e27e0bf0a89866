//! Attribute-Value Pairs.
//!
//! An AVP is the TLV unit of Diameter (RFC 3588 section 4):
//!
//! ```text
//! [code:4][flags:1][length:3][vendor_id:4 if V][payload][pad to 4]
//! ```
//!
//! The node produces every AVP with the M (mandatory) bit set, per the
//! base-protocol command ABNFs. Typed accessors validate payload shape
//! and report `CodecError` on malformed length or value.

use super::constants::avp as avp_code;
use super::CodecError;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::net::IpAddr;

/// Vendor-specific flag (V bit).
pub const AVP_FLAG_VENDOR: u8 = 0x80;
/// Mandatory flag (M bit).
pub const AVP_FLAG_MANDATORY: u8 = 0x40;
/// End-to-end encryption flag (P bit). Never set by this node.
pub const AVP_FLAG_PRIVATE: u8 = 0x20;

/// Address family numbers for the Address derived type (RFC 3588 4.3).
const ADDRESS_FAMILY_IP4: u16 = 1;
const ADDRESS_FAMILY_IP6: u16 = 2;

/// A single decoded or under-construction AVP.
#[derive(Clone, PartialEq, Eq)]
pub struct Avp {
    pub code: u32,
    pub flags: u8,
    pub vendor_id: Option<u32>,
    pub payload: Vec<u8>,
}

impl Avp {
    /// Create an AVP with raw payload bytes. The M bit is set.
    pub fn new(code: u32, payload: Vec<u8>) -> Self {
        Self {
            code,
            flags: AVP_FLAG_MANDATORY,
            vendor_id: None,
            payload,
        }
    }

    /// Create an Unsigned32 AVP.
    pub fn u32(code: u32, value: u32) -> Self {
        Self::new(code, value.to_be_bytes().to_vec())
    }

    /// Create a UTF8String / DiameterIdentity AVP.
    pub fn utf8(code: u32, value: &str) -> Self {
        Self::new(code, value.as_bytes().to_vec())
    }

    /// Create an Address AVP (family prefix + raw address bytes).
    pub fn address(code: u32, addr: IpAddr) -> Self {
        let mut payload = Vec::with_capacity(18);
        match addr {
            IpAddr::V4(v4) => {
                payload.extend_from_slice(&ADDRESS_FAMILY_IP4.to_be_bytes());
                payload.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                payload.extend_from_slice(&ADDRESS_FAMILY_IP6.to_be_bytes());
                payload.extend_from_slice(&v6.octets());
            }
        }
        Self::new(code, payload)
    }

    /// Create a Grouped AVP from member AVPs.
    pub fn grouped(code: u32, members: &[Avp]) -> Self {
        let mut buf = BytesMut::new();
        for m in members {
            m.encode(&mut buf);
        }
        Self::new(code, buf.to_vec())
    }

    /// Set the vendor id (sets the V bit).
    pub fn with_vendor(mut self, vendor_id: u32) -> Self {
        self.flags |= AVP_FLAG_VENDOR;
        self.vendor_id = Some(vendor_id);
        self
    }

    /// Length on the wire, excluding padding.
    pub fn wire_len(&self) -> usize {
        8 + if self.vendor_id.is_some() { 4 } else { 0 } + self.payload.len()
    }

    /// Length on the wire including the pad to a 4-byte boundary.
    pub fn padded_len(&self) -> usize {
        (self.wire_len() + 3) & !3
    }

    pub fn is_mandatory(&self) -> bool {
        self.flags & AVP_FLAG_MANDATORY != 0
    }

    /// Interpret the payload as Unsigned32.
    pub fn as_u32(&self) -> Result<u32, CodecError> {
        if self.payload.len() != 4 {
            return Err(CodecError::InvalidAvpLength { code: self.code });
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.payload);
        Ok(u32::from_be_bytes(b))
    }

    /// Interpret the payload as a UTF-8 string.
    pub fn as_utf8(&self) -> Result<&str, CodecError> {
        std::str::from_utf8(&self.payload).map_err(|_| CodecError::InvalidAvpValue { code: self.code })
    }

    /// Interpret the payload as a sequence of member AVPs.
    pub fn as_grouped(&self) -> Result<Vec<Avp>, CodecError> {
        let mut members = Vec::new();
        let mut buf = &self.payload[..];
        while !buf.is_empty() {
            let (avp, consumed) = Avp::decode(buf)?;
            members.push(avp);
            buf = &buf[consumed..];
        }
        Ok(members)
    }

    /// Encode onto a buffer, including padding.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.code);
        let len = self.wire_len() as u32;
        buf.put_u32((u32::from(self.flags) << 24) | (len & 0x00FF_FFFF));
        if let Some(vendor) = self.vendor_id {
            buf.put_u32(vendor);
        }
        buf.put_slice(&self.payload);
        for _ in self.wire_len()..self.padded_len() {
            buf.put_u8(0);
        }
    }

    /// Decode one AVP from the front of `buf`.
    ///
    /// Returns the AVP and the number of bytes consumed (padding included).
    pub fn decode(buf: &[u8]) -> Result<(Avp, usize), CodecError> {
        if buf.len() < 8 {
            return Err(CodecError::Truncated);
        }
        let mut cur = buf;
        let code = cur.get_u32();
        let flags_len = cur.get_u32();
        let flags = (flags_len >> 24) as u8;
        let wire_len = (flags_len & 0x00FF_FFFF) as usize;
        let header_len = 8 + if flags & AVP_FLAG_VENDOR != 0 { 4 } else { 0 };
        if wire_len < header_len || wire_len > buf.len() {
            return Err(CodecError::InvalidAvpLength { code });
        }
        let vendor_id = if flags & AVP_FLAG_VENDOR != 0 {
            Some(cur.get_u32())
        } else {
            None
        };
        let payload = buf[header_len..wire_len].to_vec();
        let padded = (wire_len + 3) & !3;
        let consumed = padded.min(buf.len());
        Ok((
            Avp {
                code,
                flags,
                vendor_id,
                payload,
            },
            consumed,
        ))
    }
}

impl fmt::Debug for Avp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Avp")
            .field("code", &self.code)
            .field("flags", &format_args!("{:#04x}", self.flags))
            .field("vendor_id", &self.vendor_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Typed view over a Vendor-Specific-Application-Id grouped AVP.
///
/// The group must contain a Vendor-Id and at least one of
/// Auth-Application-Id / Acct-Application-Id; anything else is an
/// invalid value per RFC 3588 section 6.11.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VendorSpecificApplicationId {
    pub vendor_id: u32,
    pub auth_app_id: Option<u32>,
    pub acct_app_id: Option<u32>,
}

impl VendorSpecificApplicationId {
    /// Parse and validate the grouped AVP.
    pub fn from_avp(avp: &Avp) -> Result<Self, CodecError> {
        let members = avp.as_grouped()?;
        if members.len() < 2 {
            return Err(CodecError::InvalidAvpValue { code: avp.code });
        }
        let mut vendor_id = None;
        let mut auth_app_id = None;
        let mut acct_app_id = None;
        for m in &members {
            match m.code {
                avp_code::VENDOR_ID => vendor_id = Some(m.as_u32()?),
                avp_code::AUTH_APPLICATION_ID => auth_app_id = Some(m.as_u32()?),
                avp_code::ACCT_APPLICATION_ID => acct_app_id = Some(m.as_u32()?),
                // Tolerate non-compliant extra members.
                _ => {}
            }
        }
        match (vendor_id, auth_app_id.or(acct_app_id)) {
            (Some(vendor_id), Some(_)) => Ok(Self {
                vendor_id,
                auth_app_id,
                acct_app_id,
            }),
            _ => Err(CodecError::InvalidAvpValue { code: avp.code }),
        }
    }

    /// Build the grouped AVP for a CER/CEA capability block.
    pub fn to_avp(self) -> Avp {
        let mut members = vec![Avp::u32(avp_code::VENDOR_ID, self.vendor_id)];
        if let Some(auth) = self.auth_app_id {
            members.push(Avp::u32(avp_code::AUTH_APPLICATION_ID, auth));
        } else if let Some(acct) = self.acct_app_id {
            members.push(Avp::u32(avp_code::ACCT_APPLICATION_ID, acct));
        }
        Avp::grouped(avp_code::VENDOR_SPECIFIC_APPLICATION_ID, &members)
    }
}

/// Build a Failed-AVP grouped AVP wrapping the offending AVP, for
/// MISSING_AVP / INVALID_AVP_* answers.
pub fn failed_avp(offender: &Avp) -> Avp {
    Avp::grouped(avp_code::FAILED_AVP, std::slice::from_ref(offender))
}
