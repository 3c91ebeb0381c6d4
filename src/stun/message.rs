// Copyright (C) 2026 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! STUN messages.
//!
//! Generating, parsing and authenticating STUN messages as specified in
//! RFC 5389, restricted to the Binding method and short-term credentials.

use byteorder::{BigEndian, ByteOrder};
use hmac::{Hmac, Mac, NewMac};

use crate::stun::attribute::*;
use crate::stun::StunParseError;

/// The value of the magic cookie (in network byte order) as specified in
/// RFC 5389.
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// The Binding method, usable in any message class.
pub const BINDING: u16 = 0x0001;

/// A 96-bit STUN transaction id stored in the low bits of a `u128`.
pub type TransactionId = u128;

/// Short-term credentials used to sign or verify a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortTermCredentials {
    pub password: String,
}

impl ShortTermCredentials {
    pub fn new(password: &str) -> Self {
        Self {
            password: password.to_owned(),
        }
    }

    fn make_hmac_key(&self) -> Vec<u8> {
        self.password.clone().into()
    }
}

/// The class of a [`Message`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    Success,
    Error,
}

impl MessageClass {
    /// Whether this class is either [`MessageClass::Success`] or
    /// [`MessageClass::Error`].
    pub fn is_response(self) -> bool {
        matches!(self, MessageClass::Success | MessageClass::Error)
    }

    fn to_bits(self) -> u16 {
        match self {
            MessageClass::Request => 0x000,
            MessageClass::Indication => 0x010,
            MessageClass::Success => 0x100,
            MessageClass::Error => 0x110,
        }
    }
}

/// The type of a [`Message`]: a [`MessageClass`] and a STUN method.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageType(u16);

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MessageType(class: {:?}, method: {:#x})",
            self.class(),
            self.method()
        )
    }
}

impl MessageType {
    pub fn from_class_method(class: MessageClass, method: u16) -> Self {
        let class_bits = class.to_bits();
        let method_bits = method & 0xf | (method & 0x70) << 1 | (method & 0xf80) << 2;
        Self(class_bits | method_bits)
    }

    pub fn class(self) -> MessageClass {
        match (self.0 & 0x10) >> 4 | (self.0 & 0x100) >> 7 {
            0x0 => MessageClass::Request,
            0x1 => MessageClass::Indication,
            0x2 => MessageClass::Success,
            0x3 => MessageClass::Error,
            _ => unreachable!(),
        }
    }

    pub fn has_class(self, cls: MessageClass) -> bool {
        self.class() == cls
    }

    pub fn is_response(self) -> bool {
        self.class().is_response()
    }

    pub fn method(self) -> u16 {
        self.0 & 0xf | (self.0 & 0xe0) >> 1 | (self.0 & 0x3e00) >> 2
    }

    pub fn has_method(self, method: u16) -> bool {
        self.method() == method
    }

    pub fn to_bytes(self) -> [u8; 2] {
        let mut ret = [0; 2];
        BigEndian::write_u16(&mut ret, self.0);
        ret
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StunParseError> {
        let data = BigEndian::read_u16(data);
        if data & 0xc000 != 0x0 {
            // the two highest bits are always zero in a STUN message
            return Err(StunParseError::NotStun);
        }
        Ok(Self(data))
    }
}

/// A STUN message: a [`MessageType`], a transaction id, and a list of
/// attributes.
#[derive(Debug, Clone)]
pub struct Message {
    msg_type: MessageType,
    transaction: TransactionId,
    attributes: Vec<RawAttribute>,
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message(class: {:?}, method: {:#x}, transaction: {:#x}, attributes: [",
            self.class(),
            self.method(),
            self.transaction_id()
        )?;
        for (i, a) in self.attributes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", a)?;
        }
        write!(f, "])")
    }
}

impl Message {
    pub fn new(mtype: MessageType, transaction: TransactionId) -> Self {
        Self {
            msg_type: mtype,
            transaction,
            attributes: vec![],
        }
    }

    /// Create a new request [`Message`] of the provided method with a fresh
    /// transaction id.
    pub fn new_request(method: u16) -> Self {
        Message::new(
            MessageType::from_class_method(MessageClass::Request, method),
            Message::generate_transaction(),
        )
    }

    /// Create a new indication [`Message`] of the provided method.
    pub fn new_indication(method: u16) -> Self {
        Message::new(
            MessageType::from_class_method(MessageClass::Indication, method),
            Message::generate_transaction(),
        )
    }

    /// Create a new success response matching the provided request.
    pub fn new_success(orig: &Message) -> Self {
        Message::new(
            MessageType::from_class_method(MessageClass::Success, orig.method()),
            orig.transaction_id(),
        )
    }

    /// Create a new error response matching the provided request.
    pub fn new_error(orig: &Message) -> Self {
        Message::new(
            MessageType::from_class_method(MessageClass::Error, orig.method()),
            orig.transaction_id(),
        )
    }

    pub fn get_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn class(&self) -> MessageClass {
        self.msg_type.class()
    }

    pub fn has_class(&self, cls: MessageClass) -> bool {
        self.class() == cls
    }

    pub fn is_response(&self) -> bool {
        self.class().is_response()
    }

    pub fn method(&self) -> u16 {
        self.msg_type.method()
    }

    pub fn has_method(&self, method: u16) -> bool {
        self.method() == method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction
    }

    pub fn generate_transaction() -> TransactionId {
        use rand::{thread_rng, Rng};
        let mut rng = thread_rng();
        rng.gen::<u128>() & 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff
    }

    /// A cheap check whether `data` can possibly be a STUN message: the
    /// two zero bits, a plausible length, and the magic cookie.
    pub fn is_stun(data: &[u8]) -> bool {
        data.len() >= 20
            && data[0] & 0xc0 == 0
            && BigEndian::read_u32(&data[4..8]) == MAGIC_COOKIE
    }

    /// Serialize to network bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut attr_size = 0;
        for attr in &self.attributes {
            attr_size += attr.padded_len();
        }
        let mut ret = Vec::with_capacity(20 + attr_size);
        ret.extend(self.msg_type.to_bytes());
        ret.resize(20, 0);
        let tid = (MAGIC_COOKIE as u128) << 96 | self.transaction & 0xffff_ffff_ffff_ffff_ffff_ffff;
        BigEndian::write_u128(&mut ret[4..20], tid);
        BigEndian::write_u16(&mut ret[2..4], attr_size as u16);
        for attr in &self.attributes {
            ret.extend(attr.to_bytes());
        }
        ret
    }

    /// Deserialize a [`Message`], validating the header, the advertised
    /// length and, when present, the FINGERPRINT attribute.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StunParseError> {
        let orig_data = data;

        if data.len() < 20 {
            return Err(StunParseError::NotEnoughData);
        }
        let mtype = MessageType::from_bytes(data)?;
        let mlength = BigEndian::read_u16(&data[2..]) as usize;
        if mlength + 20 > data.len() {
            warn!(
                "advertised size {} larger than data size {}",
                mlength + 20,
                data.len()
            );
            return Err(StunParseError::Malformed);
        }
        let tid = BigEndian::read_u128(&data[4..]);
        let cookie = (tid >> 96) as u32;
        if cookie != MAGIC_COOKIE {
            return Err(StunParseError::NotStun);
        }
        let tid = tid & 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff;
        let mut ret = Self::new(mtype, tid);

        let mut data_offset = 20;
        let mut data = &orig_data[20..20 + mlength];
        let mut seen_message_integrity = false;
        while !data.is_empty() {
            let attr = RawAttribute::from_bytes(data)?;
            let padded_len = attr.padded_len();
            if padded_len > data.len() {
                return Err(StunParseError::NotEnoughData);
            }

            if seen_message_integrity && attr.get_type() != FINGERPRINT {
                // only FINGERPRINT may follow MESSAGE-INTEGRITY
                warn!(
                    "unexpected attribute {} after MESSAGE-INTEGRITY",
                    attr.get_type()
                );
                return Err(StunParseError::Malformed);
            }

            if attr.get_type() == MESSAGE_INTEGRITY {
                seen_message_integrity = true;
            }
            if attr.get_type() == FINGERPRINT {
                let f = Fingerprint::from_raw(&attr)?;
                // CRC is computed over the data up to this attribute, with
                // the length field covering up to the end of it
                let mut fingerprint_data = orig_data[..data_offset].to_vec();
                BigEndian::write_u16(
                    &mut fingerprint_data[2..4],
                    (data_offset + padded_len - 20) as u16,
                );
                let calculated = crc::crc32::checksum_ieee(&fingerprint_data).to_be_bytes();
                if &calculated != f.fingerprint() {
                    warn!(
                        "fingerprint mismatch {:?} != {:?}",
                        calculated,
                        f.fingerprint()
                    );
                    return Err(StunParseError::IntegrityCheckFailed);
                }
            }
            ret.attributes.push(attr);
            data = &data[padded_len..];
            data_offset += padded_len;
        }
        Ok(ret)
    }

    /// Validate the MESSAGE-INTEGRITY attribute with the provided
    /// credentials.  The original network data the message was parsed from
    /// must be provided.
    pub fn validate_integrity(
        &self,
        orig_data: &[u8],
        credentials: &ShortTermCredentials,
    ) -> Result<(), StunParseError> {
        let raw = self
            .get_attribute(MESSAGE_INTEGRITY)
            .ok_or(StunParseError::ResourceNotFound)?;
        let integrity = MessageIntegrity::from_raw(raw)?;
        let msg_hmac = integrity.hmac();

        // locate the attribute in the original data
        if orig_data.len() < 20 {
            return Err(StunParseError::NotEnoughData);
        }
        let mut data = &orig_data[20..];
        let mut data_offset = 20;
        while !data.is_empty() {
            let attr = RawAttribute::from_bytes(data)?;
            if attr.get_type() == MESSAGE_INTEGRITY {
                // the HMAC covers all data up to (exclusive of) this
                // attribute, with the length field including it
                let key = credentials.make_hmac_key();
                let mut hmac = Hmac::<sha1::Sha1>::new_varkey(&key)
                    .map_err(|_| StunParseError::Malformed)?;
                let mut hmac_data = orig_data[..data_offset].to_vec();
                BigEndian::write_u16(&mut hmac_data[2..4], data_offset as u16 + 24 - 20);
                hmac.update(&hmac_data);
                return hmac
                    .verify(msg_hmac)
                    .map_err(|_| StunParseError::IntegrityCheckFailed);
            }
            let padded_len = attr.padded_len();
            if padded_len > data.len() {
                return Err(StunParseError::NotEnoughData);
            }
            data = &data[padded_len..];
            data_offset += padded_len;
        }
        Err(StunParseError::ResourceNotFound)
    }

    /// Append a MESSAGE-INTEGRITY attribute computed with the provided
    /// credentials.  Must be called after all regular attributes have been
    /// added and before [`Message::add_fingerprint`].
    pub fn add_message_integrity(
        &mut self,
        credentials: &ShortTermCredentials,
    ) -> Result<(), StunParseError> {
        if self.has_attribute(MESSAGE_INTEGRITY) || self.has_attribute(FINGERPRINT) {
            return Err(StunParseError::AlreadyExists);
        }

        // the HMAC is computed with the length field already counting the
        // MESSAGE-INTEGRITY attribute itself
        let mut bytes = self.to_bytes();
        let existing_len = BigEndian::read_u16(&bytes[2..4]);
        BigEndian::write_u16(&mut bytes[2..4], existing_len + 24);
        let key = credentials.make_hmac_key();
        let mut hmac =
            Hmac::<sha1::Sha1>::new_varkey(&key).map_err(|_| StunParseError::Malformed)?;
        hmac.update(&bytes);
        let integrity = hmac.finalize().into_bytes();
        let mut hmac_value = [0; 20];
        hmac_value.copy_from_slice(&integrity);
        self.attributes.push(MessageIntegrity::new(hmac_value).to_raw());
        Ok(())
    }

    /// Append a FINGERPRINT attribute.  Must be the final attribute added.
    pub fn add_fingerprint(&mut self) -> Result<(), StunParseError> {
        if self.has_attribute(FINGERPRINT) {
            return Err(StunParseError::AlreadyExists);
        }
        // as with MESSAGE-INTEGRITY, the length field counts the
        // FINGERPRINT attribute itself
        let mut bytes = self.to_bytes();
        let existing_len = BigEndian::read_u16(&bytes[2..4]);
        BigEndian::write_u16(&mut bytes[2..4], existing_len + 8);
        let fingerprint = crc::crc32::checksum_ieee(&bytes).to_be_bytes();
        self.attributes.push(Fingerprint::new(fingerprint).to_raw());
        Ok(())
    }

    /// Add an attribute.  At most one attribute of each type may exist in a
    /// message, and no attribute may be added after MESSAGE-INTEGRITY or
    /// FINGERPRINT.
    pub fn add_attribute(&mut self, attr: RawAttribute) -> Result<(), StunParseError> {
        if attr.get_type() == MESSAGE_INTEGRITY || attr.get_type() == FINGERPRINT {
            return Err(StunParseError::WrongImplementation);
        }
        if self.has_attribute(attr.get_type())
            || self.has_attribute(MESSAGE_INTEGRITY)
            || self.has_attribute(FINGERPRINT)
        {
            return Err(StunParseError::AlreadyExists);
        }
        self.attributes.push(attr);
        Ok(())
    }

    pub fn get_attribute(&self, atype: AttributeType) -> Option<&RawAttribute> {
        self.attributes.iter().find(|attr| attr.get_type() == atype)
    }

    pub fn has_attribute(&self, atype: AttributeType) -> bool {
        self.get_attribute(atype).is_some()
    }

    pub fn iter_attributes(&self) -> impl Iterator<Item = &RawAttribute> {
        self.attributes.iter()
    }

    /// Generate an error response to `src` with the provided code and its
    /// default reason phrase.
    pub fn error_response(src: &Message, code: u16) -> Result<Message, StunParseError> {
        let mut out = Message::new_error(src);
        out.add_attribute(Software::new(crate::agent::SOFTWARE_NAME)?.to_raw())?;
        out.add_attribute(
            ErrorCode::new(code, ErrorCode::default_reason_for_code(code))?.to_raw(),
        )?;
        Ok(out)
    }

    /// Generate a 400 (Bad Request) error response to `src`.
    pub fn bad_request(src: &Message) -> Result<Message, StunParseError> {
        Self::error_response(src, ErrorCode::BAD_REQUEST)
    }
}

impl From<Message> for Vec<u8> {
    fn from(f: Message) -> Self {
        f.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        crate::tests::test_init_log();
    }

    #[test]
    fn msg_type_roundtrip() {
        init();
        for m in (0x001..0xfff).step_by(0x10f) {
            for c in [
                MessageClass::Request,
                MessageClass::Indication,
                MessageClass::Success,
                MessageClass::Error,
            ] {
                let mtype = MessageType::from_class_method(c, m);
                assert_eq!(mtype.class(), c);
                assert_eq!(mtype.method(), m);
            }
        }
    }

    #[test]
    fn msg_roundtrip() {
        init();
        let mut msg = Message::new_request(BINDING);
        msg.add_attribute(Priority::new(100).to_raw()).unwrap();
        let bytes = msg.to_bytes();
        assert!(Message::is_stun(&bytes));
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.transaction_id(), msg.transaction_id());
        assert!(parsed.has_class(MessageClass::Request));
        assert!(parsed.has_method(BINDING));
        let priority = Priority::from_raw(parsed.get_attribute(PRIORITY).unwrap()).unwrap();
        assert_eq!(priority.priority(), 100);
    }

    #[test]
    fn not_stun() {
        init();
        assert!(!Message::is_stun(b"hello world, this is not stun"));
        assert!(Message::from_bytes(b"hello world, this is not stun").is_err());
    }

    #[test]
    fn integrity_roundtrip() {
        init();
        let credentials = ShortTermCredentials::new("pass");
        let mut msg = Message::new_request(BINDING);
        msg.add_message_integrity(&credentials).unwrap();
        let data = msg.to_bytes();
        let parsed = Message::from_bytes(&data).unwrap();
        assert!(parsed.validate_integrity(&data, &credentials).is_ok());

        let wrong = ShortTermCredentials::new("wrong");
        assert!(matches!(
            parsed.validate_integrity(&data, &wrong),
            Err(StunParseError::IntegrityCheckFailed)
        ));

        // duplicate MESSAGE-INTEGRITY is an error
        assert!(msg.add_message_integrity(&credentials).is_err());
    }

    #[test]
    fn fingerprint_validates() {
        init();
        let mut msg = Message::new_request(BINDING);
        msg.add_fingerprint().unwrap();
        let mut data = msg.to_bytes();
        assert!(Message::from_bytes(&data).is_ok());
        // corrupt a byte covered by the CRC
        data[1] ^= 0x1;
        assert!(Message::from_bytes(&data).is_err());
    }

    #[test]
    fn integrity_then_fingerprint() {
        init();
        let credentials = ShortTermCredentials::new("pass");
        let mut msg = Message::new_success(&Message::new_request(BINDING));
        msg.add_attribute(XorMappedAddress::new("127.0.0.1:1000".parse().unwrap(), msg.transaction_id()).to_raw())
            .unwrap();
        msg.add_message_integrity(&credentials).unwrap();
        msg.add_fingerprint().unwrap();
        let data = msg.to_bytes();
        let parsed = Message::from_bytes(&data).unwrap();
        assert!(parsed.validate_integrity(&data, &credentials).is_ok());
        // no attribute may follow MESSAGE-INTEGRITY other than FINGERPRINT
        assert!(msg.add_attribute(Priority::new(1).to_raw()).is_err());
    }

    #[test]
    fn error_response() {
        init();
        let req = Message::new_request(BINDING);
        let resp = Message::error_response(&req, ErrorCode::ROLE_CONFLICT).unwrap();
        assert!(resp.has_class(MessageClass::Error));
        assert_eq!(resp.transaction_id(), req.transaction_id());
        let code = ErrorCode::from_raw(resp.get_attribute(ERROR_CODE).unwrap()).unwrap();
        assert_eq!(code.code(), 487);
    }
}
