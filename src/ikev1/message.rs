use std::{error, fmt};

use log::debug;

pub const HEADER_LENGTH: usize = 28;
pub const COOKIE_LENGTH: usize = 8;

pub const ISAKMP_VERSION: u8 = 0x10;

// IPsec DOI from RFC 2407, with the identity-only situation.
pub const DOI_IPSEC: u32 = 1;
pub const SITUATION_IDENTITY_ONLY: u32 = 1;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ExchangeType(u8);

impl ExchangeType {
    pub const BASE: ExchangeType = ExchangeType(1);
    pub const IDENTITY_PROTECTION: ExchangeType = ExchangeType(2);
    pub const AUTHENTICATION_ONLY: ExchangeType = ExchangeType(3);
    pub const AGGRESSIVE: ExchangeType = ExchangeType(4);
    pub const INFORMATIONAL: ExchangeType = ExchangeType(5);
    pub const QUICK_MODE: ExchangeType = ExchangeType(32);
    pub const NEW_GROUP_MODE: ExchangeType = ExchangeType(33);

    fn from_u8(value: u8) -> Result<ExchangeType, FormatError> {
        if (value >= Self::BASE.0 && value <= Self::INFORMATIONAL.0)
            || value == Self::QUICK_MODE.0
            || value == Self::NEW_GROUP_MODE.0
        {
            Ok(ExchangeType(value))
        } else {
            debug!("Unsupported ISAKMP Exchange Type {}", value);
            Err("Unsupported ISAKMP Exchange Type".into())
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::BASE => write!(f, "Base")?,
            Self::IDENTITY_PROTECTION => write!(f, "Identity Protection")?,
            Self::AUTHENTICATION_ONLY => write!(f, "Authentication Only")?,
            Self::AGGRESSIVE => write!(f, "Aggressive")?,
            Self::INFORMATIONAL => write!(f, "Informational")?,
            Self::QUICK_MODE => write!(f, "Quick Mode")?,
            Self::NEW_GROUP_MODE => write!(f, "New Group Mode")?,
            _ => write!(f, "Unknown exchange type {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const ENCRYPTION: Flags = Flags(1);
    pub const COMMIT: Flags = Flags(1 << 1);
    pub const AUTH_ONLY: Flags = Flags(1 << 2);

    fn from_u8(value: u8) -> Result<Flags, FormatError> {
        const RESERVED_MASK: u8 =
            0xff & !Flags::ENCRYPTION.0 & !Flags::COMMIT.0 & !Flags::AUTH_ONLY.0;
        if value & RESERVED_MASK != 0x00 {
            debug!("ISAKMP reserved flags are set {}", value & RESERVED_MASK);
            return Err("ISAKMP reserved flags are set".into());
        }
        Ok(Flags(value))
    }

    pub fn with(self, flag: Flags) -> Flags {
        Flags(self.0 | flag.0)
    }

    pub fn has(&self, flag: Flags) -> bool {
        self.0 & flag.0 != 0
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has(Flags::ENCRYPTION) {
            f.write_str("Encryption ")?;
        }
        if self.has(Flags::COMMIT) {
            f.write_str("Commit ")?;
        }
        if self.has(Flags::AUTH_ONLY) {
            f.write_str("Auth-Only ")?;
        }
        Ok(())
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
pub struct PayloadType(u8);

impl PayloadType {
    pub const NONE: PayloadType = PayloadType(0);
    pub const SECURITY_ASSOCIATION: PayloadType = PayloadType(1);
    pub const PROPOSAL: PayloadType = PayloadType(2);
    pub const TRANSFORM: PayloadType = PayloadType(3);
    pub const KEY_EXCHANGE: PayloadType = PayloadType(4);
    pub const IDENTIFICATION: PayloadType = PayloadType(5);
    pub const CERTIFICATE: PayloadType = PayloadType(6);
    pub const CERTIFICATE_REQUEST: PayloadType = PayloadType(7);
    pub const HASH: PayloadType = PayloadType(8);
    pub const SIGNATURE: PayloadType = PayloadType(9);
    pub const NONCE: PayloadType = PayloadType(10);
    pub const NOTIFICATION: PayloadType = PayloadType(11);
    pub const DELETE: PayloadType = PayloadType(12);
    pub const VENDOR_ID: PayloadType = PayloadType(13);

    fn from_u8(value: u8) -> Result<PayloadType, FormatError> {
        if value <= Self::VENDOR_ID.0 {
            Ok(PayloadType(value))
        } else {
            debug!("Unsupported ISAKMP Payload Type {}", value);
            Err("Unsupported ISAKMP Payload Type".into())
        }
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::NONE => write!(f, "No Next Payload")?,
            Self::SECURITY_ASSOCIATION => write!(f, "Security Association")?,
            Self::PROPOSAL => write!(f, "Proposal")?,
            Self::TRANSFORM => write!(f, "Transform")?,
            Self::KEY_EXCHANGE => write!(f, "Key Exchange")?,
            Self::IDENTIFICATION => write!(f, "Identification")?,
            Self::CERTIFICATE => write!(f, "Certificate")?,
            Self::CERTIFICATE_REQUEST => write!(f, "Certificate Request")?,
            Self::HASH => write!(f, "Hash")?,
            Self::SIGNATURE => write!(f, "Signature")?,
            Self::NONCE => write!(f, "Nonce")?,
            Self::NOTIFICATION => write!(f, "Notification")?,
            Self::DELETE => write!(f, "Delete")?,
            Self::VENDOR_ID => write!(f, "Vendor ID")?,
            _ => write!(f, "Unknown payload type {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct ProtocolId(u8);

impl ProtocolId {
    pub const ISAKMP: ProtocolId = ProtocolId(1);
    pub const AH: ProtocolId = ProtocolId(2);
    pub const ESP: ProtocolId = ProtocolId(3);
    pub const IPCOMP: ProtocolId = ProtocolId(4);

    pub fn from_u8(value: u8) -> Result<ProtocolId, FormatError> {
        if value >= Self::ISAKMP.0 && value <= Self::IPCOMP.0 {
            Ok(ProtocolId(value))
        } else {
            debug!("Unsupported ISAKMP Protocol ID {}", value);
            Err("Unsupported ISAKMP Protocol ID".into())
        }
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }

    // SPI length mandated by the DOI for each protocol.
    pub fn spi_size(&self) -> usize {
        match *self {
            Self::ISAKMP => 16,
            Self::IPCOMP => 2,
            _ => 4,
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::ISAKMP => write!(f, "ISAKMP")?,
            Self::AH => write!(f, "AH")?,
            Self::ESP => write!(f, "ESP")?,
            Self::IPCOMP => write!(f, "IPComp")?,
            _ => write!(f, "Unknown Protocol ID {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct NotifyMessageType(u16);

impl NotifyMessageType {
    pub const INVALID_PAYLOAD_TYPE: NotifyMessageType = NotifyMessageType(1);
    pub const DOI_NOT_SUPPORTED: NotifyMessageType = NotifyMessageType(2);
    pub const SITUATION_NOT_SUPPORTED: NotifyMessageType = NotifyMessageType(3);
    pub const INVALID_COOKIE: NotifyMessageType = NotifyMessageType(4);
    pub const INVALID_MAJOR_VERSION: NotifyMessageType = NotifyMessageType(5);
    pub const INVALID_MINOR_VERSION: NotifyMessageType = NotifyMessageType(6);
    pub const INVALID_EXCHANGE_TYPE: NotifyMessageType = NotifyMessageType(7);
    pub const INVALID_FLAGS: NotifyMessageType = NotifyMessageType(8);
    pub const INVALID_MESSAGE_ID: NotifyMessageType = NotifyMessageType(9);
    pub const INVALID_PROTOCOL_ID: NotifyMessageType = NotifyMessageType(10);
    pub const INVALID_SPI: NotifyMessageType = NotifyMessageType(11);
    pub const INVALID_TRANSFORM_ID: NotifyMessageType = NotifyMessageType(12);
    pub const ATTRIBUTES_NOT_SUPPORTED: NotifyMessageType = NotifyMessageType(13);
    pub const NO_PROPOSAL_CHOSEN: NotifyMessageType = NotifyMessageType(14);
    pub const BAD_PROPOSAL_SYNTAX: NotifyMessageType = NotifyMessageType(15);
    pub const PAYLOAD_MALFORMED: NotifyMessageType = NotifyMessageType(16);
    pub const INVALID_KEY_INFORMATION: NotifyMessageType = NotifyMessageType(17);
    pub const INVALID_ID_INFORMATION: NotifyMessageType = NotifyMessageType(18);
    pub const INVALID_CERT_ENCODING: NotifyMessageType = NotifyMessageType(19);
    pub const INVALID_CERTIFICATE: NotifyMessageType = NotifyMessageType(20);
    pub const CERT_TYPE_UNSUPPORTED: NotifyMessageType = NotifyMessageType(21);
    pub const INVALID_CERT_AUTHORITY: NotifyMessageType = NotifyMessageType(22);
    pub const INVALID_HASH_INFORMATION: NotifyMessageType = NotifyMessageType(23);
    pub const AUTHENTICATION_FAILED: NotifyMessageType = NotifyMessageType(24);
    pub const INVALID_SIGNATURE: NotifyMessageType = NotifyMessageType(25);
    pub const ADDRESS_NOTIFICATION: NotifyMessageType = NotifyMessageType(26);
    pub const NOTIFY_SA_LIFETIME: NotifyMessageType = NotifyMessageType(27);
    pub const CERTIFICATE_UNAVAILABLE: NotifyMessageType = NotifyMessageType(28);
    pub const UNSUPPORTED_EXCHANGE_TYPE: NotifyMessageType = NotifyMessageType(29);
    pub const UNEQUAL_PAYLOAD_LENGTHS: NotifyMessageType = NotifyMessageType(30);

    pub const CONNECTED: NotifyMessageType = NotifyMessageType(16384);

    pub const RESPONDER_LIFETIME: NotifyMessageType = NotifyMessageType(24576);
    pub const REPLAY_STATUS: NotifyMessageType = NotifyMessageType(24577);
    pub const INITIAL_CONTACT: NotifyMessageType = NotifyMessageType(24578);

    pub const R_U_THERE: NotifyMessageType = NotifyMessageType(36136);
    pub const R_U_THERE_ACK: NotifyMessageType = NotifyMessageType(36137);

    pub fn from_u16(value: u16) -> NotifyMessageType {
        NotifyMessageType(value)
    }

    pub fn type_id(&self) -> u16 {
        self.0
    }

    pub fn is_error(&self) -> bool {
        self.0 < Self::CONNECTED.0
    }
}

impl fmt::Display for NotifyMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::INVALID_PAYLOAD_TYPE => write!(f, "INVALID-PAYLOAD-TYPE")?,
            Self::DOI_NOT_SUPPORTED => write!(f, "DOI-NOT-SUPPORTED")?,
            Self::SITUATION_NOT_SUPPORTED => write!(f, "SITUATION-NOT-SUPPORTED")?,
            Self::INVALID_COOKIE => write!(f, "INVALID-COOKIE")?,
            Self::INVALID_MAJOR_VERSION => write!(f, "INVALID-MAJOR-VERSION")?,
            Self::INVALID_MINOR_VERSION => write!(f, "INVALID-MINOR-VERSION")?,
            Self::INVALID_EXCHANGE_TYPE => write!(f, "INVALID-EXCHANGE-TYPE")?,
            Self::INVALID_FLAGS => write!(f, "INVALID-FLAGS")?,
            Self::INVALID_MESSAGE_ID => write!(f, "INVALID-MESSAGE-ID")?,
            Self::INVALID_PROTOCOL_ID => write!(f, "INVALID-PROTOCOL-ID")?,
            Self::INVALID_SPI => write!(f, "INVALID-SPI")?,
            Self::INVALID_TRANSFORM_ID => write!(f, "INVALID-TRANSFORM-ID")?,
            Self::ATTRIBUTES_NOT_SUPPORTED => write!(f, "ATTRIBUTES-NOT-SUPPORTED")?,
            Self::NO_PROPOSAL_CHOSEN => write!(f, "NO-PROPOSAL-CHOSEN")?,
            Self::BAD_PROPOSAL_SYNTAX => write!(f, "BAD-PROPOSAL-SYNTAX")?,
            Self::PAYLOAD_MALFORMED => write!(f, "PAYLOAD-MALFORMED")?,
            Self::INVALID_KEY_INFORMATION => write!(f, "INVALID-KEY-INFORMATION")?,
            Self::INVALID_ID_INFORMATION => write!(f, "INVALID-ID-INFORMATION")?,
            Self::INVALID_CERT_ENCODING => write!(f, "INVALID-CERT-ENCODING")?,
            Self::INVALID_CERTIFICATE => write!(f, "INVALID-CERTIFICATE")?,
            Self::CERT_TYPE_UNSUPPORTED => write!(f, "CERT-TYPE-UNSUPPORTED")?,
            Self::INVALID_CERT_AUTHORITY => write!(f, "INVALID-CERT-AUTHORITY")?,
            Self::INVALID_HASH_INFORMATION => write!(f, "INVALID-HASH-INFORMATION")?,
            Self::AUTHENTICATION_FAILED => write!(f, "AUTHENTICATION-FAILED")?,
            Self::INVALID_SIGNATURE => write!(f, "INVALID-SIGNATURE")?,
            Self::ADDRESS_NOTIFICATION => write!(f, "ADDRESS-NOTIFICATION")?,
            Self::NOTIFY_SA_LIFETIME => write!(f, "NOTIFY-SA-LIFETIME")?,
            Self::CERTIFICATE_UNAVAILABLE => write!(f, "CERTIFICATE-UNAVAILABLE")?,
            Self::UNSUPPORTED_EXCHANGE_TYPE => write!(f, "UNSUPPORTED-EXCHANGE-TYPE")?,
            Self::UNEQUAL_PAYLOAD_LENGTHS => write!(f, "UNEQUAL-PAYLOAD-LENGTHS")?,
            Self::CONNECTED => write!(f, "CONNECTED")?,
            Self::RESPONDER_LIFETIME => write!(f, "RESPONDER-LIFETIME")?,
            Self::REPLAY_STATUS => write!(f, "REPLAY-STATUS")?,
            Self::INITIAL_CONTACT => write!(f, "INITIAL-CONTACT")?,
            Self::R_U_THERE => write!(f, "R-U-THERE")?,
            Self::R_U_THERE_ACK => write!(f, "R-U-THERE-ACK")?,
            _ => write!(f, "Unknown Notify Message Type {}", self.0)?,
        }
        Ok(())
    }
}

pub struct InputMessage<'a> {
    data: &'a [u8],
}

// Parse and validate using spec from RFC 2408, Section 3.
impl InputMessage<'_> {
    pub fn from_datagram(p: &[u8]) -> Result<InputMessage, FormatError> {
        if p.len() < HEADER_LENGTH {
            debug!("Not enough data in message");
            Err("Not enough data in message".into())
        } else {
            Ok(InputMessage { data: p })
        }
    }

    pub fn header(&self) -> [u8; HEADER_LENGTH] {
        let mut result = [0u8; HEADER_LENGTH];
        result.copy_from_slice(&self.data[..HEADER_LENGTH]);
        result
    }

    pub fn body(&self) -> &[u8] {
        &self.data[HEADER_LENGTH..]
    }

    pub fn read_initiator_cookie(&self) -> [u8; COOKIE_LENGTH] {
        let mut result = [0u8; COOKIE_LENGTH];
        result.copy_from_slice(&self.data[0..8]);
        result
    }

    pub fn read_responder_cookie(&self) -> [u8; COOKIE_LENGTH] {
        let mut result = [0u8; COOKIE_LENGTH];
        result.copy_from_slice(&self.data[8..16]);
        result
    }

    pub fn read_next_payload(&self) -> u8 {
        self.data[16]
    }

    fn read_version(&self) -> (u8, u8) {
        let version = self.data[17];
        (version >> 4 & 0x0f, version & 0x0f)
    }

    pub fn read_exchange_type(&self) -> Result<ExchangeType, FormatError> {
        ExchangeType::from_u8(self.data[18])
    }

    pub fn read_flags(&self) -> Result<Flags, FormatError> {
        Flags::from_u8(self.data[19])
    }

    pub fn read_message_id(&self) -> u32 {
        let mut result = [0u8; 4];
        result.copy_from_slice(&self.data[20..24]);
        u32::from_be_bytes(result)
    }

    pub fn read_length(&self) -> u32 {
        let mut result = [0u8; 4];
        result.copy_from_slice(&self.data[24..28]);
        u32::from_be_bytes(result)
    }

    pub fn is_valid(&self) -> bool {
        let mut valid = true;
        if self.read_initiator_cookie() == [0u8; COOKIE_LENGTH] {
            debug!("Empty initiator cookie");
            valid = false;
        }
        {
            let (major_version, minor_version) = self.read_version();
            if major_version != 1 {
                debug!(
                    "Unsupported major version {}.{}",
                    major_version, minor_version
                );
                valid = false;
            }
        }
        if let Err(err) = self.read_exchange_type() {
            debug!("Error parsing exchange type {}", err);
            valid = false;
        }
        if let Err(err) = self.read_flags() {
            debug!("Error parsing flags {}", err);
            valid = false;
        }
        {
            let client_length = self.read_length();
            if self.data.len() != client_length as usize {
                debug!(
                    "Packet length mismatch (received {} bytes, client specified {} bytes)",
                    self.data.len(),
                    client_length
                );
                valid = false;
            }
        }
        valid
    }

    pub fn iter_payloads(&self) -> PayloadIter {
        PayloadIter {
            next_payload: self.read_next_payload(),
            data: &self.data[HEADER_LENGTH..],
        }
    }
}

pub struct PayloadIter<'a> {
    next_payload: u8,
    data: &'a [u8],
}

impl<'a> PayloadIter<'a> {
    // Used after in-place decryption replaces the original message body.
    pub fn new(next_payload: u8, data: &'a [u8]) -> PayloadIter<'a> {
        PayloadIter { next_payload, data }
    }
}

impl<'a> Iterator for PayloadIter<'a> {
    type Item = Result<Payload<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_payload == 0 {
            // Encrypted messages are padded to the cipher block size.
            return None;
        }
        if self.data.len() < 4 {
            debug!("Not enough data in payload generic header");
            return None;
        }
        let next_payload = self.data[0];
        let reserved = self.data[1];
        let mut payload_length = [0u8; 2];
        payload_length.copy_from_slice(&self.data[2..4]);
        let payload_length = u16::from_be_bytes(payload_length) as usize;
        if payload_length < 4 || self.data.len() < payload_length {
            debug!("Payload overflow");
            self.next_payload = 0;
            return Some(Err("Payload length overflows message".into()));
        }
        let payload_type = self.next_payload;
        let payload_data = &self.data[4..payload_length];
        self.next_payload = next_payload;
        self.data = &self.data[payload_length..];
        if reserved != 0 {
            debug!("Payload {} reserved byte is set", payload_type);
            return Some(Err("Payload reserved byte is set".into()));
        }
        let payload_type = match PayloadType::from_u8(payload_type) {
            Ok(payload_type) => payload_type,
            Err(err) => return Some(Err(err)),
        };
        Some(Payload::from_raw(payload_type, payload_data))
    }
}

pub enum Payload<'a> {
    SecurityAssociation(PayloadSecurityAssociation<'a>),
    KeyExchange(&'a [u8]),
    Identification(PayloadIdentification<'a>),
    Certificate(PayloadCertificate<'a>),
    CertificateRequest(PayloadCertificate<'a>),
    Hash(&'a [u8]),
    Signature(&'a [u8]),
    Nonce(&'a [u8]),
    Notification(PayloadNotification<'a>),
    Delete(PayloadDelete<'a>),
    VendorId(&'a [u8]),
}

impl<'a> Payload<'a> {
    fn from_raw(payload_type: PayloadType, data: &'a [u8]) -> Result<Payload<'a>, FormatError> {
        match payload_type {
            PayloadType::SECURITY_ASSOCIATION => Ok(Payload::SecurityAssociation(
                PayloadSecurityAssociation::from_payload(data)?,
            )),
            PayloadType::KEY_EXCHANGE => Ok(Payload::KeyExchange(data)),
            PayloadType::IDENTIFICATION => Ok(Payload::Identification(
                PayloadIdentification::from_payload(data)?,
            )),
            PayloadType::CERTIFICATE => {
                Ok(Payload::Certificate(PayloadCertificate::from_payload(data)?))
            }
            PayloadType::CERTIFICATE_REQUEST => Ok(Payload::CertificateRequest(
                PayloadCertificate::from_payload(data)?,
            )),
            PayloadType::HASH => Ok(Payload::Hash(data)),
            PayloadType::SIGNATURE => Ok(Payload::Signature(data)),
            PayloadType::NONCE => Ok(Payload::Nonce(data)),
            PayloadType::NOTIFICATION => Ok(Payload::Notification(
                PayloadNotification::from_payload(data)?,
            )),
            PayloadType::DELETE => Ok(Payload::Delete(PayloadDelete::from_payload(data)?)),
            PayloadType::VENDOR_ID => Ok(Payload::VendorId(data)),
            PayloadType::PROPOSAL | PayloadType::TRANSFORM => {
                // Valid only nested inside a Security Association payload.
                debug!("Standalone {} payload", payload_type);
                Err("Proposal or transform sent outside SA payload".into())
            }
            _ => {
                debug!("Unsupported payload type {}", payload_type);
                Err("Unsupported payload type".into())
            }
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::SecurityAssociation(_) => PayloadType::SECURITY_ASSOCIATION,
            Payload::KeyExchange(_) => PayloadType::KEY_EXCHANGE,
            Payload::Identification(_) => PayloadType::IDENTIFICATION,
            Payload::Certificate(_) => PayloadType::CERTIFICATE,
            Payload::CertificateRequest(_) => PayloadType::CERTIFICATE_REQUEST,
            Payload::Hash(_) => PayloadType::HASH,
            Payload::Signature(_) => PayloadType::SIGNATURE,
            Payload::Nonce(_) => PayloadType::NONCE,
            Payload::Notification(_) => PayloadType::NOTIFICATION,
            Payload::Delete(_) => PayloadType::DELETE,
            Payload::VendorId(_) => PayloadType::VENDOR_ID,
        }
    }
}

pub struct PayloadSecurityAssociation<'a> {
    doi: u32,
    situation: u32,
    data: &'a [u8],
}

impl<'a> PayloadSecurityAssociation<'a> {
    fn from_payload(data: &'a [u8]) -> Result<PayloadSecurityAssociation<'a>, FormatError> {
        if data.len() < 8 {
            debug!("Not enough data in security association payload");
            return Err("Not enough data in security association payload".into());
        }
        let mut doi = [0u8; 4];
        doi.copy_from_slice(&data[0..4]);
        let mut situation = [0u8; 4];
        situation.copy_from_slice(&data[4..8]);
        Ok(PayloadSecurityAssociation {
            doi: u32::from_be_bytes(doi),
            situation: u32::from_be_bytes(situation),
            data: &data[8..],
        })
    }

    pub fn doi(&self) -> u32 {
        self.doi
    }

    pub fn situation(&self) -> u32 {
        self.situation
    }

    // Proposal and transform substructures, to be decoded by the proposal model.
    pub fn proposals_data(&self) -> &'a [u8] {
        self.data
    }

    pub fn iter_proposals(&self) -> ProposalIter<'a> {
        ProposalIter {
            next_payload: PayloadType::PROPOSAL.0,
            data: self.data,
        }
    }
}

pub struct ProposalIter<'a> {
    next_payload: u8,
    data: &'a [u8],
}

impl<'a> Iterator for ProposalIter<'a> {
    type Item = Result<RawProposal<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_payload == 0 || self.data.is_empty() {
            return None;
        }
        if self.next_payload != PayloadType::PROPOSAL.0 {
            debug!("Unexpected payload {} in proposal chain", self.next_payload);
            self.next_payload = 0;
            return Some(Err("Unexpected payload in proposal chain".into()));
        }
        if self.data.len() < 8 {
            debug!("Not enough data in proposal payload");
            self.next_payload = 0;
            return Some(Err("Not enough data in proposal payload".into()));
        }
        let next_payload = self.data[0];
        let mut payload_length = [0u8; 2];
        payload_length.copy_from_slice(&self.data[2..4]);
        let payload_length = u16::from_be_bytes(payload_length) as usize;
        if payload_length < 8 || self.data.len() < payload_length {
            debug!("Proposal overflow");
            self.next_payload = 0;
            return Some(Err("Proposal length overflows SA payload".into()));
        }
        let proposal_num = self.data[4];
        let protocol_id = self.data[5];
        let spi_size = self.data[6] as usize;
        let num_transforms = self.data[7] as usize;
        if payload_length < 8 + spi_size {
            debug!("Proposal SPI overflow");
            self.next_payload = 0;
            return Some(Err("Proposal SPI overflows proposal".into()));
        }
        let item = RawProposal {
            proposal_num,
            protocol_id,
            num_transforms,
            spi: &self.data[8..8 + spi_size],
            data: &self.data[8 + spi_size..payload_length],
        };
        self.next_payload = next_payload;
        self.data = &self.data[payload_length..];
        Some(Ok(item))
    }
}

pub struct RawProposal<'a> {
    pub proposal_num: u8,
    pub protocol_id: u8,
    pub num_transforms: usize,
    pub spi: &'a [u8],
    data: &'a [u8],
}

impl<'a> RawProposal<'a> {
    pub fn iter_transforms(&self) -> TransformIter<'a> {
        TransformIter {
            next_payload: PayloadType::TRANSFORM.0,
            num_transforms: self.num_transforms,
            data: self.data,
        }
    }
}

pub struct TransformIter<'a> {
    next_payload: u8,
    num_transforms: usize,
    data: &'a [u8],
}

impl<'a> Iterator for TransformIter<'a> {
    type Item = Result<RawTransform<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_payload == 0 || self.data.is_empty() {
            if self.num_transforms != 0 {
                debug!("Proposal is missing {} transforms", self.num_transforms);
            }
            return None;
        }
        if self.next_payload != PayloadType::TRANSFORM.0 {
            debug!(
                "Unexpected payload {} in transform chain",
                self.next_payload
            );
            self.next_payload = 0;
            return Some(Err("Unexpected payload in transform chain".into()));
        }
        if self.data.len() < 8 {
            debug!("Not enough data in transform payload");
            self.next_payload = 0;
            return Some(Err("Not enough data in transform payload".into()));
        }
        let next_payload = self.data[0];
        let mut payload_length = [0u8; 2];
        payload_length.copy_from_slice(&self.data[2..4]);
        let payload_length = u16::from_be_bytes(payload_length) as usize;
        if payload_length < 8 || self.data.len() < payload_length {
            debug!("Transform overflow");
            self.next_payload = 0;
            return Some(Err("Transform length overflows proposal".into()));
        }
        let item = RawTransform {
            transform_num: self.data[4],
            transform_id: self.data[5],
            data: &self.data[8..payload_length],
        };
        self.next_payload = next_payload;
        self.data = &self.data[payload_length..];
        if self.num_transforms == 0 {
            debug!("Proposal has unaccounted transforms");
        } else {
            self.num_transforms -= 1;
        }
        Some(Ok(item))
    }
}

pub struct RawTransform<'a> {
    pub transform_num: u8,
    pub transform_id: u8,
    data: &'a [u8],
}

impl<'a> RawTransform<'a> {
    pub fn iter_attributes(&self) -> AttributeIter<'a> {
        AttributeIter { data: self.data }
    }
}

pub const ATTRIBUTE_FORMAT_TV: u16 = 1 << 15;
const ATTRIBUTE_TYPE_MASK: u16 = !ATTRIBUTE_FORMAT_TV;

pub struct Attribute<'a> {
    pub attribute_type: u16,
    pub fixed_width: bool,
    data: &'a [u8],
}

impl<'a> Attribute<'a> {
    pub fn value(&self) -> &'a [u8] {
        self.data
    }

    pub fn value_u16(&self) -> Option<u16> {
        if self.data.len() == 2 {
            let mut value = [0u8; 2];
            value.copy_from_slice(self.data);
            Some(u16::from_be_bytes(value))
        } else {
            None
        }
    }

    // Variable-width lifetime values up to 4 bytes are accepted.
    pub fn value_u32(&self) -> Option<u32> {
        if self.data.is_empty() || self.data.len() > 4 {
            return None;
        }
        let mut value = 0u32;
        for b in self.data {
            value = value << 8 | *b as u32;
        }
        Some(value)
    }
}

pub struct AttributeIter<'a> {
    data: &'a [u8],
}

impl<'a> AttributeIter<'a> {
    // Notification data (e.g. RESPONDER-LIFETIME) reuses the transform
    // attribute encoding.
    pub fn new(data: &'a [u8]) -> AttributeIter<'a> {
        AttributeIter { data }
    }
}

impl<'a> Iterator for AttributeIter<'a> {
    type Item = Result<Attribute<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < 4 {
            debug!("Not enough data in transform attribute");
            self.data = &[];
            return Some(Err("Not enough data in transform attribute".into()));
        }
        let mut attribute_type = [0u8; 2];
        attribute_type.copy_from_slice(&self.data[0..2]);
        let attribute_type = u16::from_be_bytes(attribute_type);
        if attribute_type & ATTRIBUTE_FORMAT_TV != 0 {
            let item = Attribute {
                attribute_type: attribute_type & ATTRIBUTE_TYPE_MASK,
                fixed_width: true,
                data: &self.data[2..4],
            };
            self.data = &self.data[4..];
            Some(Ok(item))
        } else {
            let mut attribute_length = [0u8; 2];
            attribute_length.copy_from_slice(&self.data[2..4]);
            let attribute_length = u16::from_be_bytes(attribute_length) as usize;
            if self.data.len() < 4 + attribute_length {
                debug!("Transform attribute overflow");
                self.data = &[];
                return Some(Err("Transform attribute overflows transform".into()));
            }
            let item = Attribute {
                attribute_type,
                fixed_width: false,
                data: &self.data[4..4 + attribute_length],
            };
            self.data = &self.data[4 + attribute_length..];
            Some(Ok(item))
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct IdentificationType(u8);

impl IdentificationType {
    pub const IPV4_ADDR: IdentificationType = IdentificationType(1);
    pub const FQDN: IdentificationType = IdentificationType(2);
    pub const USER_FQDN: IdentificationType = IdentificationType(3);
    pub const IPV4_ADDR_SUBNET: IdentificationType = IdentificationType(4);
    pub const IPV6_ADDR: IdentificationType = IdentificationType(5);
    pub const IPV6_ADDR_SUBNET: IdentificationType = IdentificationType(6);
    pub const IPV4_ADDR_RANGE: IdentificationType = IdentificationType(7);
    pub const IPV6_ADDR_RANGE: IdentificationType = IdentificationType(8);
    pub const DER_ASN1_DN: IdentificationType = IdentificationType(9);
    pub const KEY_ID: IdentificationType = IdentificationType(11);

    pub fn from_u8(value: u8) -> IdentificationType {
        IdentificationType(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for IdentificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::IPV4_ADDR => write!(f, "IPv4 address")?,
            Self::FQDN => write!(f, "FQDN")?,
            Self::USER_FQDN => write!(f, "User FQDN")?,
            Self::IPV4_ADDR_SUBNET => write!(f, "IPv4 subnet")?,
            Self::IPV6_ADDR => write!(f, "IPv6 address")?,
            Self::IPV6_ADDR_SUBNET => write!(f, "IPv6 subnet")?,
            Self::IPV4_ADDR_RANGE => write!(f, "IPv4 range")?,
            Self::IPV6_ADDR_RANGE => write!(f, "IPv6 range")?,
            Self::DER_ASN1_DN => write!(f, "DER ASN.1 DN")?,
            Self::KEY_ID => write!(f, "Key ID")?,
            _ => write!(f, "Unknown ID type {}", self.0)?,
        }
        Ok(())
    }
}

pub struct PayloadIdentification<'a> {
    id_type: IdentificationType,
    protocol: u8,
    port: u16,
    data: &'a [u8],
}

impl<'a> PayloadIdentification<'a> {
    fn from_payload(data: &'a [u8]) -> Result<PayloadIdentification<'a>, FormatError> {
        if data.len() < 4 {
            debug!("Not enough data in identification payload");
            return Err("Not enough data in identification payload".into());
        }
        let mut port = [0u8; 2];
        port.copy_from_slice(&data[2..4]);
        Ok(PayloadIdentification {
            id_type: IdentificationType::from_u8(data[0]),
            protocol: data[1],
            port: u16::from_be_bytes(port),
            data: &data[4..],
        })
    }

    pub fn id_type(&self) -> IdentificationType {
        self.id_type
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn raw_value(&self) -> &'a [u8] {
        self.data
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
pub struct CertificateEncoding(u8);

impl CertificateEncoding {
    pub const PKCS7: CertificateEncoding = CertificateEncoding(1);
    pub const PGP: CertificateEncoding = CertificateEncoding(2);
    pub const DNS_SIGNED_KEY: CertificateEncoding = CertificateEncoding(3);
    pub const X509_SIGNATURE: CertificateEncoding = CertificateEncoding(4);
    pub const KERBEROS: CertificateEncoding = CertificateEncoding(6);
    pub const CRL: CertificateEncoding = CertificateEncoding(7);
    pub const ARL: CertificateEncoding = CertificateEncoding(8);
    pub const SPKI: CertificateEncoding = CertificateEncoding(9);
    pub const X509_ATTRIBUTE: CertificateEncoding = CertificateEncoding(10);

    pub fn from_u8(value: u8) -> CertificateEncoding {
        CertificateEncoding(value)
    }
}

impl fmt::Display for CertificateEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::PKCS7 => write!(f, "PKCS #7")?,
            Self::PGP => write!(f, "PGP")?,
            Self::DNS_SIGNED_KEY => write!(f, "DNS Signed Key")?,
            Self::X509_SIGNATURE => write!(f, "X.509 Signature")?,
            Self::KERBEROS => write!(f, "Kerberos")?,
            Self::CRL => write!(f, "CRL")?,
            Self::ARL => write!(f, "ARL")?,
            Self::SPKI => write!(f, "SPKI")?,
            Self::X509_ATTRIBUTE => write!(f, "X.509 Attribute")?,
            _ => write!(f, "Unknown Certificate Encoding {}", self.0)?,
        }
        Ok(())
    }
}

pub struct PayloadCertificate<'a> {
    encoding: CertificateEncoding,
    data: &'a [u8],
}

impl<'a> PayloadCertificate<'a> {
    fn from_payload(data: &'a [u8]) -> Result<PayloadCertificate<'a>, FormatError> {
        if data.is_empty() {
            debug!("Not enough data in certificate payload");
            return Err("Not enough data in certificate payload".into());
        }
        Ok(PayloadCertificate {
            encoding: CertificateEncoding::from_u8(data[0]),
            data: &data[1..],
        })
    }

    pub fn encoding(&self) -> CertificateEncoding {
        self.encoding
    }

    pub fn raw_value(&self) -> &'a [u8] {
        self.data
    }
}

pub struct PayloadNotification<'a> {
    doi: u32,
    protocol_id: u8,
    message_type: NotifyMessageType,
    spi: &'a [u8],
    data: &'a [u8],
}

impl<'a> PayloadNotification<'a> {
    fn from_payload(data: &'a [u8]) -> Result<PayloadNotification<'a>, FormatError> {
        if data.len() < 8 {
            debug!("Not enough data in notification payload");
            return Err("Not enough data in notification payload".into());
        }
        let mut doi = [0u8; 4];
        doi.copy_from_slice(&data[0..4]);
        let protocol_id = data[4];
        let spi_size = data[5] as usize;
        let mut message_type = [0u8; 2];
        message_type.copy_from_slice(&data[6..8]);
        if data.len() < 8 + spi_size {
            debug!("Notification SPI overflow");
            return Err("Notification SPI overflows payload".into());
        }
        Ok(PayloadNotification {
            doi: u32::from_be_bytes(doi),
            protocol_id,
            message_type: NotifyMessageType::from_u16(u16::from_be_bytes(message_type)),
            spi: &data[8..8 + spi_size],
            data: &data[8 + spi_size..],
        })
    }

    pub fn doi(&self) -> u32 {
        self.doi
    }

    pub fn protocol_id(&self) -> u8 {
        self.protocol_id
    }

    pub fn message_type(&self) -> NotifyMessageType {
        self.message_type
    }

    pub fn spi(&self) -> &'a [u8] {
        self.spi
    }

    pub fn raw_value(&self) -> &'a [u8] {
        self.data
    }
}

pub struct PayloadDelete<'a> {
    doi: u32,
    protocol_id: u8,
    spi_size: usize,
    data: &'a [u8],
}

impl<'a> PayloadDelete<'a> {
    fn from_payload(data: &'a [u8]) -> Result<PayloadDelete<'a>, FormatError> {
        if data.len() < 8 {
            debug!("Not enough data in delete payload");
            return Err("Not enough data in delete payload".into());
        }
        let mut doi = [0u8; 4];
        doi.copy_from_slice(&data[0..4]);
        let protocol_id = data[4];
        let spi_size = data[5] as usize;
        let mut num_spis = [0u8; 2];
        num_spis.copy_from_slice(&data[6..8]);
        let num_spis = u16::from_be_bytes(num_spis) as usize;
        let spi_data = &data[8..];
        if spi_size == 0 || spi_data.len() != num_spis * spi_size {
            debug!(
                "Delete payload SPI list length mismatch ({} SPIs of size {}, {} bytes)",
                num_spis,
                spi_size,
                spi_data.len()
            );
            return Err("Delete payload SPI list length mismatch".into());
        }
        Ok(PayloadDelete {
            doi: u32::from_be_bytes(doi),
            protocol_id,
            spi_size,
            data: spi_data,
        })
    }

    pub fn doi(&self) -> u32 {
        self.doi
    }

    pub fn protocol_id(&self) -> u8 {
        self.protocol_id
    }

    pub fn spi_size(&self) -> usize {
        self.spi_size
    }

    pub fn iter_spis(&self) -> impl Iterator<Item = &'a [u8]> {
        self.data.chunks_exact(self.spi_size)
    }
}

impl fmt::Debug for InputMessage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ISAKMP message")?;
        writeln!(
            f,
            "  Initiator cookie {:x}",
            u64::from_be_bytes(self.read_initiator_cookie())
        )?;
        writeln!(
            f,
            "  Responder cookie {:x}",
            u64::from_be_bytes(self.read_responder_cookie())
        )?;
        {
            let version = self.read_version();
            writeln!(f, "  Version {}.{}", version.0, version.1)?;
        }
        match self.read_exchange_type() {
            Ok(t) => writeln!(f, "  Exchange type {}", t),
            Err(err) => writeln!(f, "  Exchange type {}", err),
        }?;
        match self.read_flags() {
            Ok(t) => writeln!(f, "  Flags {}", t),
            Err(err) => writeln!(f, "  Flags {}", err),
        }?;
        writeln!(f, "  Message ID {:x}", self.read_message_id())?;
        writeln!(f, "  Length {}", self.read_length())?;
        if self
            .read_flags()
            .map(|flags| flags.has(Flags::ENCRYPTION))
            .unwrap_or(false)
        {
            return writeln!(f, "  Encrypted body ({} bytes)", self.body().len());
        }
        for pl in self.iter_payloads() {
            let pl = match pl {
                Ok(pl) => pl,
                Err(err) => {
                    writeln!(f, "  Payload data invalid {}", err)?;
                    continue;
                }
            };
            writeln!(f, "  Payload type {}", pl.payload_type())?;
            if let Payload::SecurityAssociation(ref pl_sa) = pl {
                writeln!(f, "    DOI {} situation {}", pl_sa.doi(), pl_sa.situation())?;
                for prop in pl_sa.iter_proposals() {
                    let prop = match prop {
                        Ok(prop) => prop,
                        Err(err) => {
                            writeln!(f, "    Proposal invalid {}", err)?;
                            continue;
                        }
                    };
                    writeln!(
                        f,
                        "    Proposal {} protocol ID {} SPI {:?}",
                        prop.proposal_num, prop.protocol_id, prop.spi
                    )?;
                    for tf in prop.iter_transforms() {
                        let tf = match tf {
                            Ok(tf) => tf,
                            Err(err) => {
                                writeln!(f, "      Transform invalid {}", err)?;
                                continue;
                            }
                        };
                        writeln!(
                            f,
                            "      Transform {} ID {}",
                            tf.transform_num, tf.transform_id
                        )?;
                        for attr in tf.iter_attributes() {
                            match attr {
                                Ok(attr) => writeln!(
                                    f,
                                    "        Attribute {} value {:?}",
                                    attr.attribute_type,
                                    attr.value()
                                )?,
                                Err(err) => writeln!(f, "        Attribute invalid {}", err)?,
                            }
                        }
                    }
                }
            } else if let Payload::Notification(ref pl_notify) = pl {
                writeln!(
                    f,
                    "    Notify protocol ID {} SPI {:?} type {} value {:?}",
                    pl_notify.protocol_id(),
                    pl_notify.spi(),
                    pl_notify.message_type(),
                    pl_notify.raw_value(),
                )?;
            } else if let Payload::Delete(ref pl_delete) = pl {
                writeln!(
                    f,
                    "    Delete protocol ID {} SPIs {:?}",
                    pl_delete.protocol_id(),
                    pl_delete.iter_spis().collect::<Vec<_>>(),
                )?;
            } else if let Payload::Identification(ref pl_id) = pl {
                writeln!(
                    f,
                    "    ID type {} protocol {} port {} value {:?}",
                    pl_id.id_type(),
                    pl_id.protocol(),
                    pl_id.port(),
                    pl_id.raw_value(),
                )?;
            }
        }
        Ok(())
    }
}

pub struct MessageWriter<'a> {
    dest: &'a mut [u8],
    first_payload: Option<u8>,
    last_payload_links: Vec<usize>,
    cursor: usize,
}

impl<'a> MessageWriter<'a> {
    pub fn new(dest: &'a mut [u8]) -> Result<MessageWriter<'a>, NotEnoughSpaceError> {
        if dest.len() < HEADER_LENGTH {
            return Err(NotEnoughSpaceError {});
        }
        Ok(MessageWriter {
            dest,
            first_payload: None,
            last_payload_links: vec![],
            cursor: HEADER_LENGTH,
        })
    }

    pub fn write_header(
        &mut self,
        initiator_cookie: [u8; COOKIE_LENGTH],
        responder_cookie: [u8; COOKIE_LENGTH],
        exchange_type: ExchangeType,
        flags: Flags,
        message_id: u32,
    ) -> Result<(), NotEnoughSpaceError> {
        self.dest[0..8].copy_from_slice(&initiator_cookie);
        self.dest[8..16].copy_from_slice(&responder_cookie);
        self.dest[16] = PayloadType::NONE.0;
        self.dest[17] = ISAKMP_VERSION;
        self.dest[18] = exchange_type.0;
        self.dest[19] = flags.0;
        self.dest[20..24].copy_from_slice(&message_id.to_be_bytes());
        self.dest[24..28].fill(0);
        self.first_payload = None;
        self.last_payload_links = vec![];
        self.cursor = HEADER_LENGTH;
        Ok(())
    }

    pub fn write_payload(
        &mut self,
        payload_type: PayloadType,
        data: &[u8],
    ) -> Result<(), NotEnoughSpaceError> {
        let next_data = self.next_payload_slice(payload_type, 4 + data.len())?;
        next_data[4..].copy_from_slice(data);
        Ok(())
    }

    // Reserves a payload slice for in-place construction; the 4-byte generic
    // header is filled in, the rest is zeroed.
    pub fn next_payload_slice(
        &mut self,
        payload_type: PayloadType,
        payload_length: usize,
    ) -> Result<&mut [u8], NotEnoughSpaceError> {
        if payload_length > u16::MAX as usize || self.cursor + payload_length > self.dest.len() {
            return Err(NotEnoughSpaceError {});
        }
        if self.first_payload.is_none() {
            self.first_payload = Some(payload_type.0);
        }
        if let Some(last_link) = self.last_payload_links.last() {
            self.dest[*last_link] = payload_type.0;
        }
        self.last_payload_links.push(self.cursor);
        let next_data = &mut self.dest[self.cursor..self.cursor + payload_length];
        next_data.fill(0);
        next_data[2..4].copy_from_slice(&(payload_length as u16).to_be_bytes());
        self.cursor += payload_length;
        Ok(next_data)
    }

    pub fn write_notification_payload(
        &mut self,
        protocol_id: ProtocolId,
        spi: &[u8],
        message_type: NotifyMessageType,
        data: &[u8],
    ) -> Result<(), NotEnoughSpaceError> {
        let payload_length = 4 + 8 + spi.len() + data.len();
        let next_data = self.next_payload_slice(PayloadType::NOTIFICATION, payload_length)?;
        next_data[4..8].copy_from_slice(&DOI_IPSEC.to_be_bytes());
        next_data[8] = protocol_id.0;
        next_data[9] = spi.len() as u8;
        next_data[10..12].copy_from_slice(&message_type.0.to_be_bytes());
        next_data[12..12 + spi.len()].copy_from_slice(spi);
        next_data[12 + spi.len()..].copy_from_slice(data);
        Ok(())
    }

    pub fn write_delete_payload(
        &mut self,
        protocol_id: ProtocolId,
        spi_size: usize,
        spis: &[&[u8]],
    ) -> Result<(), NotEnoughSpaceError> {
        let payload_length = 4 + 8 + spi_size * spis.len();
        let next_data = self.next_payload_slice(PayloadType::DELETE, payload_length)?;
        next_data[4..8].copy_from_slice(&DOI_IPSEC.to_be_bytes());
        next_data[8] = protocol_id.0;
        next_data[9] = spi_size as u8;
        next_data[10..12].copy_from_slice(&(spis.len() as u16).to_be_bytes());
        for (i, spi) in spis.iter().enumerate() {
            if spi.len() != spi_size {
                return Err(NotEnoughSpaceError {});
            }
            next_data[12 + i * spi_size..12 + (i + 1) * spi_size].copy_from_slice(spi);
        }
        Ok(())
    }

    pub fn write_identification_payload(
        &mut self,
        id_type: IdentificationType,
        protocol: u8,
        port: u16,
        data: &[u8],
    ) -> Result<(), NotEnoughSpaceError> {
        let next_data = self.next_payload_slice(PayloadType::IDENTIFICATION, 4 + 4 + data.len())?;
        next_data[4] = id_type.0;
        next_data[5] = protocol;
        next_data[6..8].copy_from_slice(&port.to_be_bytes());
        next_data[8..].copy_from_slice(data);
        Ok(())
    }

    pub fn write_security_association_payload(
        &mut self,
        proposals_data: &[u8],
    ) -> Result<(), NotEnoughSpaceError> {
        let next_data =
            self.next_payload_slice(PayloadType::SECURITY_ASSOCIATION, 4 + 8 + proposals_data.len())?;
        next_data[4..8].copy_from_slice(&DOI_IPSEC.to_be_bytes());
        next_data[8..12].copy_from_slice(&SITUATION_IDENTITY_ONLY.to_be_bytes());
        next_data[12..].copy_from_slice(proposals_data);
        Ok(())
    }

    // Zero-pads the body to a multiple of the cipher block size before
    // in-place encryption; returns the padded body.
    pub fn pad_message(&mut self, block_length: usize) -> Result<&mut [u8], NotEnoughSpaceError> {
        let body_length = self.cursor - HEADER_LENGTH;
        let padded_length = body_length.div_ceil(block_length) * block_length;
        if HEADER_LENGTH + padded_length > self.dest.len() {
            return Err(NotEnoughSpaceError {});
        }
        self.dest[self.cursor..HEADER_LENGTH + padded_length].fill(0);
        self.cursor = HEADER_LENGTH + padded_length;
        Ok(&mut self.dest[HEADER_LENGTH..self.cursor])
    }

    // Patches the header chain and total length; returns the full message length.
    pub fn complete_message(&mut self) -> usize {
        self.dest[16] = self.first_payload.unwrap_or(PayloadType::NONE.0);
        self.dest[24..28].copy_from_slice(&(self.cursor as u32).to_be_bytes());
        self.cursor
    }

    // Extends the message to the padded length after in-place encryption of the body.
    pub fn complete_encrypted_message(&mut self, encrypted_body_length: usize) -> usize {
        self.dest[16] = self.first_payload.unwrap_or(PayloadType::NONE.0);
        let full_length = HEADER_LENGTH + encrypted_body_length;
        self.dest[19] |= Flags::ENCRYPTION.0;
        self.dest[24..28].copy_from_slice(&(full_length as u32).to_be_bytes());
        full_length
    }

    pub fn payloads_data(&self) -> &[u8] {
        &self.dest[HEADER_LENGTH..self.cursor]
    }

    pub fn payloads_data_mut(&mut self) -> &mut [u8] {
        &mut self.dest[HEADER_LENGTH..self.cursor]
    }

}

#[derive(Debug)]
pub struct FormatError {
    msg: &'static str,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl error::Error for FormatError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

impl From<&'static str> for FormatError {
    fn from(msg: &'static str) -> FormatError {
        FormatError { msg }
    }
}

#[derive(Debug)]
pub struct NotEnoughSpaceError {}

impl fmt::Display for NotEnoughSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Not enough space in buffer")
    }
}

impl error::Error for NotEnoughSpaceError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_test_message(dest: &mut [u8]) -> usize {
        let mut writer = MessageWriter::new(dest).unwrap();
        writer
            .write_header(
                [1, 2, 3, 4, 5, 6, 7, 8],
                [0; 8],
                ExchangeType::IDENTITY_PROTECTION,
                Flags::NONE,
                0,
            )
            .unwrap();
        writer
            .write_notification_payload(
                ProtocolId::ISAKMP,
                &[],
                NotifyMessageType::NO_PROPOSAL_CHOSEN,
                &[],
            )
            .unwrap();
        writer.write_payload(PayloadType::NONCE, &[0xaa; 16]).unwrap();
        writer.complete_message()
    }

    #[test]
    fn write_and_reparse_payload_chain() {
        let mut dest = [0u8; 256];
        let length = build_test_message(&mut dest);
        let msg = InputMessage::from_datagram(&dest[..length]).unwrap();
        assert!(msg.is_valid());
        assert_eq!(msg.read_initiator_cookie(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(msg.read_next_payload(), PayloadType::NOTIFICATION.0);
        let payloads = msg
            .iter_payloads()
            .collect::<Result<Vec<_>, _>>()
            .expect("valid payloads");
        assert_eq!(payloads.len(), 2);
        match &payloads[0] {
            Payload::Notification(notify) => {
                assert_eq!(notify.message_type(), NotifyMessageType::NO_PROPOSAL_CHOSEN);
                assert_eq!(notify.protocol_id(), ProtocolId::ISAKMP.type_id());
                assert!(notify.spi().is_empty());
            }
            _ => panic!("First payload is not a notification"),
        }
        match &payloads[1] {
            Payload::Nonce(nonce) => assert_eq!(*nonce, &[0xaa; 16]),
            _ => panic!("Second payload is not a nonce"),
        }
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(InputMessage::from_datagram(&[0u8; 27]).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut dest = [0u8; 256];
        let length = build_test_message(&mut dest);
        // Claim a payload length larger than the remaining data.
        dest[HEADER_LENGTH + 2..HEADER_LENGTH + 4].copy_from_slice(&1000u16.to_be_bytes());
        let msg = InputMessage::from_datagram(&dest[..length]).unwrap();
        assert!(msg.iter_payloads().any(|pl| pl.is_err()));
    }

    #[test]
    fn reserved_payload_byte_is_rejected() {
        let mut dest = [0u8; 256];
        let length = build_test_message(&mut dest);
        dest[HEADER_LENGTH + 1] = 0x55;
        let msg = InputMessage::from_datagram(&dest[..length]).unwrap();
        let payloads = msg.iter_payloads().collect::<Vec<_>>();
        assert!(payloads[0].is_err());
        // The chain is still walkable past the bad payload.
        assert!(payloads[1].is_ok());
    }

    #[test]
    fn delete_payload_spi_count_must_match() {
        let mut dest = [0u8; 256];
        let mut writer = MessageWriter::new(&mut dest).unwrap();
        writer
            .write_header(
                [1; 8],
                [2; 8],
                ExchangeType::INFORMATIONAL,
                Flags::NONE,
                0x1234,
            )
            .unwrap();
        writer
            .write_delete_payload(ProtocolId::ESP, 4, &[&[0, 0, 0, 1], &[0, 0, 0, 2]])
            .unwrap();
        let length = writer.complete_message();
        let msg = InputMessage::from_datagram(&dest[..length]).unwrap();
        let payloads = msg
            .iter_payloads()
            .collect::<Result<Vec<_>, _>>()
            .expect("valid payloads");
        match &payloads[0] {
            Payload::Delete(delete) => {
                assert_eq!(delete.protocol_id(), ProtocolId::ESP.type_id());
                let spis = delete.iter_spis().collect::<Vec<_>>();
                assert_eq!(spis, vec![&[0, 0, 0, 1][..], &[0, 0, 0, 2][..]]);
            }
            _ => panic!("Payload is not a delete"),
        }
    }

    #[test]
    fn attribute_tv_and_tlv_forms() {
        // TV: type 1 value 7; TLV: type 12, 4-byte value.
        let data = [
            0x80, 0x01, 0x00, 0x07, 0x00, 0x0c, 0x00, 0x04, 0x00, 0x01, 0x51, 0x80,
        ];
        let transform = RawTransform {
            transform_num: 1,
            transform_id: 1,
            data: &data,
        };
        let attrs = transform
            .iter_attributes()
            .collect::<Result<Vec<_>, _>>()
            .expect("valid attributes");
        assert_eq!(attrs.len(), 2);
        assert!(attrs[0].fixed_width);
        assert_eq!(attrs[0].attribute_type, 1);
        assert_eq!(attrs[0].value_u16(), Some(7));
        assert!(!attrs[1].fixed_width);
        assert_eq!(attrs[1].attribute_type, 12);
        assert_eq!(attrs[1].value_u32(), Some(86400));
    }
}
