// Copyright (C) 2026 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! STUN attributes.
//!
//! The generic TLV encoding lives in [`RawAttribute`]; the typed wrappers
//! cover the attributes exchanged during ICE connectivity checks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};

use crate::stun::message::{TransactionId, MAGIC_COOKIE};
use crate::stun::StunParseError;

pub const USERNAME: AttributeType = AttributeType(0x0006);
pub const MESSAGE_INTEGRITY: AttributeType = AttributeType(0x0008);
pub const ERROR_CODE: AttributeType = AttributeType(0x0009);
pub const XOR_MAPPED_ADDRESS: AttributeType = AttributeType(0x0020);
pub const PRIORITY: AttributeType = AttributeType(0x0024);
pub const USE_CANDIDATE: AttributeType = AttributeType(0x0025);
pub const ICE_CONTROLLED: AttributeType = AttributeType(0x0029);
pub const ICE_CONTROLLING: AttributeType = AttributeType(0x002A);
pub const SOFTWARE: AttributeType = AttributeType(0x8022);
pub const FINGERPRINT: AttributeType = AttributeType(0x8028);

/// The type of a STUN attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeType(pub u16);

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AttributeType({:#x}: {})", self.0, self.name())
    }
}

impl AttributeType {
    pub fn new(val: u16) -> Self {
        Self(val)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    pub fn name(self) -> &'static str {
        match self {
            USERNAME => "USERNAME",
            MESSAGE_INTEGRITY => "MESSAGE-INTEGRITY",
            ERROR_CODE => "ERROR-CODE",
            XOR_MAPPED_ADDRESS => "XOR-MAPPED-ADDRESS",
            PRIORITY => "PRIORITY",
            USE_CANDIDATE => "USE-CANDIDATE",
            ICE_CONTROLLED => "ICE-CONTROLLED",
            ICE_CONTROLLING => "ICE-CONTROLLING",
            SOFTWARE => "SOFTWARE",
            FINGERPRINT => "FINGERPRINT",
            _ => "unknown",
        }
    }

    /// Attribute types below 0x8000 must be understood by the receiver for
    /// the message to be processed.
    pub fn comprehension_required(self) -> bool {
        self.0 < 0x8000
    }
}

impl From<u16> for AttributeType {
    fn from(f: u16) -> Self {
        Self::new(f)
    }
}

/// A STUN attribute in its raw TLV form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    atype: AttributeType,
    value: Vec<u8>,
}

impl std::fmt::Display for RawAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawAttribute(type: {}, len: {})", self.atype, self.value.len())
    }
}

impl RawAttribute {
    pub fn new(atype: AttributeType, data: &[u8]) -> Self {
        Self {
            atype,
            value: data.to_vec(),
        }
    }

    pub fn get_type(&self) -> AttributeType {
        self.atype
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// The length of the value portion, excluding header and padding.
    pub fn length(&self) -> u16 {
        self.value.len() as u16
    }

    /// The total encoded size including header and padding to a 4-byte
    /// boundary.
    pub fn padded_len(&self) -> usize {
        let len = self.value.len();
        if len % 4 == 0 {
            4 + len
        } else {
            4 + len + 4 - len % 4
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(self.padded_len());
        ret.resize(4, 0);
        BigEndian::write_u16(&mut ret[0..2], self.atype.0);
        BigEndian::write_u16(&mut ret[2..4], self.value.len() as u16);
        ret.extend(&self.value);
        ret.resize(self.padded_len(), 0);
        ret
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StunParseError> {
        if data.len() < 4 {
            return Err(StunParseError::NotEnoughData);
        }
        let atype = AttributeType::new(BigEndian::read_u16(&data[0..2]));
        let len = BigEndian::read_u16(&data[2..4]) as usize;
        if data.len() < 4 + len {
            return Err(StunParseError::NotEnoughData);
        }
        Ok(Self {
            atype,
            value: data[4..4 + len].to_vec(),
        })
    }
}

fn check_type_and_len(
    raw: &RawAttribute,
    atype: AttributeType,
    len: std::ops::RangeInclusive<usize>,
) -> Result<(), StunParseError> {
    if raw.atype != atype {
        return Err(StunParseError::WrongImplementation);
    }
    if raw.value.len() < *len.start() {
        return Err(StunParseError::NotEnoughData);
    }
    if raw.value.len() > *len.end() {
        return Err(StunParseError::TooBig);
    }
    Ok(())
}

/// An address encoded in the XOR-MAPPED-ADDRESS wire form.  Stored XOR-ed;
/// the transaction id is needed to recover the original value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorMappedAddress {
    addr: SocketAddr,
}

impl XorMappedAddress {
    pub fn new(addr: SocketAddr, transaction: TransactionId) -> Self {
        Self {
            addr: xor_addr(addr, transaction),
        }
    }

    pub fn addr(&self, transaction: TransactionId) -> SocketAddr {
        xor_addr(self.addr, transaction)
    }

    pub fn to_raw(&self) -> RawAttribute {
        match self.addr {
            SocketAddr::V4(addr) => {
                let mut buf = [0; 8];
                buf[1] = 0x1;
                BigEndian::write_u16(&mut buf[2..4], addr.port());
                BigEndian::write_u32(&mut buf[4..8], u32::from(*addr.ip()));
                RawAttribute::new(XOR_MAPPED_ADDRESS, &buf)
            }
            SocketAddr::V6(addr) => {
                let mut buf = [0; 20];
                buf[1] = 0x2;
                BigEndian::write_u16(&mut buf[2..4], addr.port());
                BigEndian::write_u128(&mut buf[4..20], u128::from(*addr.ip()));
                RawAttribute::new(XOR_MAPPED_ADDRESS, &buf)
            }
        }
    }

    pub fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        check_type_and_len(raw, XOR_MAPPED_ADDRESS, 8..=20)?;
        let port = BigEndian::read_u16(&raw.value[2..4]);
        let addr = match raw.value[1] {
            0x1 => {
                if raw.value.len() != 8 {
                    return Err(StunParseError::Malformed);
                }
                IpAddr::V4(Ipv4Addr::from(BigEndian::read_u32(&raw.value[4..8])))
            }
            0x2 => {
                if raw.value.len() != 20 {
                    return Err(StunParseError::Malformed);
                }
                IpAddr::V6(Ipv6Addr::from(BigEndian::read_u128(&raw.value[4..20])))
            }
            _ => return Err(StunParseError::Malformed),
        };
        Ok(Self {
            addr: SocketAddr::new(addr, port),
        })
    }
}

/// XOR an address with the magic cookie (and, for IPv6, the transaction id).
/// Applying the operation twice recovers the input.
fn xor_addr(addr: SocketAddr, transaction: TransactionId) -> SocketAddr {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr {
        SocketAddr::V4(addr) => {
            let ip = u32::from(*addr.ip()) ^ MAGIC_COOKIE;
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)
        }
        SocketAddr::V6(addr) => {
            let mask = (MAGIC_COOKIE as u128) << 96 | transaction;
            let ip = u128::from(*addr.ip()) ^ mask;
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)
        }
    }
}

/// The PRIORITY attribute, RFC 8445 §7.1.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Priority {
    priority: u32,
}

impl Priority {
    pub fn new(priority: u32) -> Self {
        Self { priority }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn to_raw(&self) -> RawAttribute {
        let mut buf = [0; 4];
        BigEndian::write_u32(&mut buf, self.priority);
        RawAttribute::new(PRIORITY, &buf)
    }

    pub fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        check_type_and_len(raw, PRIORITY, 4..=4)?;
        Ok(Self {
            priority: BigEndian::read_u32(&raw.value[0..4]),
        })
    }
}

/// The USE-CANDIDATE attribute, RFC 8445 §7.1.2.  Carries no value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UseCandidate {}

impl UseCandidate {
    pub fn new() -> Self {
        Self {}
    }

    pub fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(USE_CANDIDATE, &[])
    }

    pub fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        check_type_and_len(raw, USE_CANDIDATE, 0..=0)?;
        Ok(Self {})
    }
}

/// The ICE-CONTROLLED attribute, RFC 8445 §7.1.3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceControlled {
    tie_breaker: u64,
}

impl IceControlled {
    pub fn new(tie_breaker: u64) -> Self {
        Self { tie_breaker }
    }

    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    pub fn to_raw(&self) -> RawAttribute {
        let mut buf = [0; 8];
        BigEndian::write_u64(&mut buf, self.tie_breaker);
        RawAttribute::new(ICE_CONTROLLED, &buf)
    }

    pub fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        check_type_and_len(raw, ICE_CONTROLLED, 8..=8)?;
        Ok(Self {
            tie_breaker: BigEndian::read_u64(&raw.value[0..8]),
        })
    }
}

/// The ICE-CONTROLLING attribute, RFC 8445 §7.1.3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceControlling {
    tie_breaker: u64,
}

impl IceControlling {
    pub fn new(tie_breaker: u64) -> Self {
        Self { tie_breaker }
    }

    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    pub fn to_raw(&self) -> RawAttribute {
        let mut buf = [0; 8];
        BigEndian::write_u64(&mut buf, self.tie_breaker);
        RawAttribute::new(ICE_CONTROLLING, &buf)
    }

    pub fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        check_type_and_len(raw, ICE_CONTROLLING, 8..=8)?;
        Ok(Self {
            tie_breaker: BigEndian::read_u64(&raw.value[0..8]),
        })
    }
}

/// The USERNAME attribute.  For connectivity checks the value is
/// `remote-ufrag:local-ufrag` of the sending agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Username {
    user: String,
}

impl Username {
    pub fn new(user: &str) -> Result<Self, StunParseError> {
        if user.len() > 513 {
            return Err(StunParseError::TooBig);
        }
        Ok(Self {
            user: user.to_owned(),
        })
    }

    pub fn username(&self) -> &str {
        &self.user
    }

    pub fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(USERNAME, self.user.as_bytes())
    }

    pub fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        check_type_and_len(raw, USERNAME, 0..=513)?;
        Ok(Self {
            user: std::str::from_utf8(&raw.value)
                .map_err(|_| StunParseError::Malformed)?
                .to_owned(),
        })
    }
}

/// The ERROR-CODE attribute for error responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    code: u16,
    reason: String,
}

impl ErrorCode {
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const ROLE_CONFLICT: u16 = 487;

    pub fn new(code: u16, reason: &str) -> Result<Self, StunParseError> {
        if !(300..700).contains(&code) {
            return Err(StunParseError::Malformed);
        }
        Ok(Self {
            code,
            reason: reason.to_owned(),
        })
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn default_reason_for_code(code: u16) -> &'static str {
        match code {
            400 => "Bad Request",
            401 => "Unauthorized",
            420 => "Unknown Attribute",
            487 => "Role Conflict",
            500 => "Server Error",
            _ => "Unknown",
        }
    }

    pub fn to_raw(&self) -> RawAttribute {
        let mut buf = vec![0; 4 + self.reason.len()];
        buf[2] = (self.code / 100) as u8;
        buf[3] = (self.code % 100) as u8;
        buf[4..].copy_from_slice(self.reason.as_bytes());
        RawAttribute::new(ERROR_CODE, &buf)
    }

    pub fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        check_type_and_len(raw, ERROR_CODE, 4..=4 + 763)?;
        let code = (raw.value[2] & 0x7) as u16 * 100 + raw.value[3] as u16;
        if !(300..700).contains(&code) {
            return Err(StunParseError::Malformed);
        }
        let reason = std::str::from_utf8(&raw.value[4..])
            .map_err(|_| StunParseError::Malformed)?
            .to_owned();
        Ok(Self { code, reason })
    }
}

/// The SOFTWARE attribute, a free-form description of the sending agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Software {
    software: String,
}

impl Software {
    pub fn new(software: &str) -> Result<Self, StunParseError> {
        if software.len() > 763 {
            return Err(StunParseError::TooBig);
        }
        Ok(Self {
            software: software.to_owned(),
        })
    }

    pub fn software(&self) -> &str {
        &self.software
    }

    pub fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(SOFTWARE, self.software.as_bytes())
    }

    pub fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        check_type_and_len(raw, SOFTWARE, 0..=763)?;
        Ok(Self {
            software: std::str::from_utf8(&raw.value)
                .map_err(|_| StunParseError::Malformed)?
                .to_owned(),
        })
    }
}

/// The MESSAGE-INTEGRITY attribute, an HMAC-SHA1 over the preceding message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIntegrity {
    hmac: [u8; 20],
}

impl MessageIntegrity {
    pub fn new(hmac: [u8; 20]) -> Self {
        Self { hmac }
    }

    pub fn hmac(&self) -> &[u8; 20] {
        &self.hmac
    }

    pub fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(MESSAGE_INTEGRITY, &self.hmac)
    }

    pub fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        check_type_and_len(raw, MESSAGE_INTEGRITY, 20..=20)?;
        let mut hmac = [0; 20];
        hmac.copy_from_slice(&raw.value);
        Ok(Self { hmac })
    }
}

/// The FINGERPRINT attribute, a CRC-32 of the preceding message XOR-ed with
/// the constant `"STUN"`.  Stored un-XOR-ed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    fingerprint: [u8; 4],
}

impl Fingerprint {
    const XOR_CONSTANT: [u8; 4] = [0x53, 0x54, 0x55, 0x4E];

    pub fn new(fingerprint: [u8; 4]) -> Self {
        Self { fingerprint }
    }

    pub fn fingerprint(&self) -> &[u8; 4] {
        &self.fingerprint
    }

    fn xor(val: [u8; 4]) -> [u8; 4] {
        let mut out = [0; 4];
        for i in 0..4 {
            out[i] = val[i] ^ Self::XOR_CONSTANT[i];
        }
        out
    }

    pub fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(FINGERPRINT, &Self::xor(self.fingerprint))
    }

    pub fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        check_type_and_len(raw, FINGERPRINT, 4..=4)?;
        let mut val = [0; 4];
        val.copy_from_slice(&raw.value);
        Ok(Self {
            fingerprint: Self::xor(val),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        crate::tests::test_init_log();
    }

    #[test]
    fn raw_attribute_padding() {
        init();
        let attr = RawAttribute::new(PRIORITY, &[1, 2, 3]);
        let bytes = attr.to_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[4..7], &[1, 2, 3]);
        assert_eq!(bytes[7], 0);
        let parsed = RawAttribute::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.length(), 3);
        assert_eq!(parsed, attr);
    }

    #[test]
    fn xor_mapped_address_v4() {
        init();
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let transaction = 0x123456789abc0123456789ab;
        let mapped = XorMappedAddress::new(addr, transaction);
        assert_eq!(mapped.addr(transaction), addr);
        let raw = mapped.to_raw();
        let parsed = XorMappedAddress::from_raw(&raw).unwrap();
        assert_eq!(parsed.addr(transaction), addr);
    }

    #[test]
    fn xor_mapped_address_v6() {
        init();
        let addr: SocketAddr = "[2001:db8::1]:32853".parse().unwrap();
        let transaction = 0x123456789abc0123456789ab;
        let mapped = XorMappedAddress::new(addr, transaction);
        assert_eq!(mapped.addr(transaction), addr);
        let raw = mapped.to_raw();
        let parsed = XorMappedAddress::from_raw(&raw).unwrap();
        assert_eq!(parsed.addr(transaction), addr);
    }

    #[test]
    fn priority_roundtrip() {
        init();
        let raw = Priority::new(0x7e_00_ff_ff).to_raw();
        assert_eq!(Priority::from_raw(&raw).unwrap().priority(), 0x7e_00_ff_ff);
    }

    #[test]
    fn tie_breaker_roundtrip() {
        init();
        let raw = IceControlling::new(u64::MAX).to_raw();
        assert_eq!(
            IceControlling::from_raw(&raw).unwrap().tie_breaker(),
            u64::MAX
        );
        let raw = IceControlled::new(1).to_raw();
        assert_eq!(IceControlled::from_raw(&raw).unwrap().tie_breaker(), 1);
    }

    #[test]
    fn error_code_roundtrip() {
        init();
        let err = ErrorCode::new(
            ErrorCode::ROLE_CONFLICT,
            ErrorCode::default_reason_for_code(ErrorCode::ROLE_CONFLICT),
        )
        .unwrap();
        let parsed = ErrorCode::from_raw(&err.to_raw()).unwrap();
        assert_eq!(parsed.code(), 487);
        assert_eq!(parsed.reason(), "Role Conflict");
    }

    #[test]
    fn username_roundtrip() {
        init();
        let user = Username::new("remote:local").unwrap();
        let parsed = Username::from_raw(&user.to_raw()).unwrap();
        assert_eq!(parsed.username(), "remote:local");
    }

    #[test]
    fn wrong_type_rejected() {
        init();
        let raw = Priority::new(100).to_raw();
        assert!(matches!(
            Username::from_raw(&raw),
            Err(StunParseError::WrongImplementation)
        ));
    }
}
