use std::{error, fmt};

use log::debug;

use super::crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm};
use super::message::{
    self, NotifyMessageType, PayloadSecurityAssociation, ProtocolId, RawTransform,
};
use super::policy::CheckLevel;

// Oakley (phase 1) transform attribute classes from RFC 2409 Appendix A.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct OakleyAttributeType(u16);

impl OakleyAttributeType {
    pub const ENCRYPTION_ALGORITHM: OakleyAttributeType = OakleyAttributeType(1);
    pub const HASH_ALGORITHM: OakleyAttributeType = OakleyAttributeType(2);
    pub const AUTHENTICATION_METHOD: OakleyAttributeType = OakleyAttributeType(3);
    pub const GROUP_DESCRIPTION: OakleyAttributeType = OakleyAttributeType(4);
    pub const GROUP_TYPE: OakleyAttributeType = OakleyAttributeType(5);
    pub const LIFE_TYPE: OakleyAttributeType = OakleyAttributeType(11);
    pub const LIFE_DURATION: OakleyAttributeType = OakleyAttributeType(12);
    pub const PRF: OakleyAttributeType = OakleyAttributeType(13);
    pub const KEY_LENGTH: OakleyAttributeType = OakleyAttributeType(14);

    fn from_u16(value: u16) -> OakleyAttributeType {
        OakleyAttributeType(value)
    }

    // RFC 2409 mandates the basic (fixed-width) encoding for these classes.
    fn requires_fixed_width(&self) -> bool {
        matches!(
            *self,
            Self::ENCRYPTION_ALGORITHM
                | Self::HASH_ALGORITHM
                | Self::AUTHENTICATION_METHOD
                | Self::GROUP_DESCRIPTION
                | Self::GROUP_TYPE
                | Self::LIFE_TYPE
                | Self::PRF
                | Self::KEY_LENGTH
        )
    }
}

// IPsec DOI (phase 2) transform attribute classes from RFC 2407, Section 4.5.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct IpsecAttributeType(u16);

impl IpsecAttributeType {
    pub const LIFE_TYPE: IpsecAttributeType = IpsecAttributeType(1);
    pub const LIFE_DURATION: IpsecAttributeType = IpsecAttributeType(2);
    pub const GROUP_DESCRIPTION: IpsecAttributeType = IpsecAttributeType(3);
    pub const ENCAPSULATION_MODE: IpsecAttributeType = IpsecAttributeType(4);
    pub const AUTH_ALGORITHM: IpsecAttributeType = IpsecAttributeType(5);
    pub const KEY_LENGTH: IpsecAttributeType = IpsecAttributeType(6);

    fn from_u16(value: u16) -> IpsecAttributeType {
        IpsecAttributeType(value)
    }

    fn requires_fixed_width(&self) -> bool {
        matches!(
            *self,
            Self::LIFE_TYPE
                | Self::GROUP_DESCRIPTION
                | Self::ENCAPSULATION_MODE
                | Self::AUTH_ALGORITHM
                | Self::KEY_LENGTH
        )
    }
}

const LIFE_TYPE_SECONDS: u16 = 1;
const LIFE_TYPE_KILOBYTES: u16 = 2;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct AuthenticationMethod(u16);

impl AuthenticationMethod {
    pub const PRE_SHARED_KEY: AuthenticationMethod = AuthenticationMethod(1);
    pub const DSS_SIGNATURE: AuthenticationMethod = AuthenticationMethod(2);
    pub const RSA_SIGNATURE: AuthenticationMethod = AuthenticationMethod(3);
    pub const RSA_ENCRYPTION: AuthenticationMethod = AuthenticationMethod(4);
    pub const RSA_ENCRYPTION_REVISED: AuthenticationMethod = AuthenticationMethod(5);

    pub fn from_u16(value: u16) -> AuthenticationMethod {
        AuthenticationMethod(value)
    }

    pub fn type_id(&self) -> u16 {
        self.0
    }

    pub fn is_signature(&self) -> bool {
        matches!(*self, Self::DSS_SIGNATURE | Self::RSA_SIGNATURE)
    }

    pub fn is_encryption(&self) -> bool {
        matches!(*self, Self::RSA_ENCRYPTION | Self::RSA_ENCRYPTION_REVISED)
    }
}

impl fmt::Display for AuthenticationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::PRE_SHARED_KEY => write!(f, "pre-shared key")?,
            Self::DSS_SIGNATURE => write!(f, "DSS signature")?,
            Self::RSA_SIGNATURE => write!(f, "RSA signature")?,
            Self::RSA_ENCRYPTION => write!(f, "RSA encryption")?,
            Self::RSA_ENCRYPTION_REVISED => write!(f, "revised RSA encryption")?,
            _ => write!(f, "Unknown authentication method {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct AuthAlgorithm(u16);

impl AuthAlgorithm {
    pub const HMAC_MD5: AuthAlgorithm = AuthAlgorithm(1);
    pub const HMAC_SHA1: AuthAlgorithm = AuthAlgorithm(2);
    pub const DES_MAC: AuthAlgorithm = AuthAlgorithm(3);
    pub const KPDK: AuthAlgorithm = AuthAlgorithm(4);
    pub const HMAC_SHA2_256: AuthAlgorithm = AuthAlgorithm(5);

    pub fn from_u16(value: u16) -> AuthAlgorithm {
        AuthAlgorithm(value)
    }

    pub fn type_id(&self) -> u16 {
        self.0
    }

    pub fn key_length(&self) -> usize {
        match *self {
            Self::HMAC_MD5 => 128 / 8,
            Self::HMAC_SHA1 => 160 / 8,
            Self::HMAC_SHA2_256 => 256 / 8,
            _ => 0,
        }
    }
}

impl fmt::Display for AuthAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::HMAC_MD5 => write!(f, "HMAC-MD5")?,
            Self::HMAC_SHA1 => write!(f, "HMAC-SHA1")?,
            Self::DES_MAC => write!(f, "DES-MAC")?,
            Self::KPDK => write!(f, "KPDK")?,
            Self::HMAC_SHA2_256 => write!(f, "HMAC-SHA2-256")?,
            _ => write!(f, "Unknown auth algorithm {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct EncapsulationMode(u16);

impl EncapsulationMode {
    pub const TUNNEL: EncapsulationMode = EncapsulationMode(1);
    pub const TRANSPORT: EncapsulationMode = EncapsulationMode(2);

    pub fn from_u16(value: u16) -> EncapsulationMode {
        EncapsulationMode(value)
    }

    pub fn type_id(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for EncapsulationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::TUNNEL => write!(f, "tunnel")?,
            Self::TRANSPORT => write!(f, "transport")?,
            _ => write!(f, "Unknown encapsulation mode {}", self.0)?,
        }
        Ok(())
    }
}

// IPsec DOI transform identifiers, per protocol (RFC 2407, Section 4.4).
const ISAKMP_TRANSFORM_KEY_IKE: u8 = 1;
pub const ESP_TRANSFORM_DES: u8 = 2;
pub const ESP_TRANSFORM_3DES: u8 = 3;
pub const ESP_TRANSFORM_NULL: u8 = 11;
pub const ESP_TRANSFORM_AES: u8 = 12;
pub const AH_TRANSFORM_MD5: u8 = 2;
pub const AH_TRANSFORM_SHA: u8 = 3;
pub const AH_TRANSFORM_SHA2_256: u8 = 5;
pub const IPCOMP_TRANSFORM_OUI: u8 = 1;
pub const IPCOMP_TRANSFORM_DEFLATE: u8 = 2;
pub const IPCOMP_TRANSFORM_LZS: u8 = 3;

fn valid_transform_id(protocol: ProtocolId, transform_id: u8) -> bool {
    match protocol {
        ProtocolId::AH => matches!(
            transform_id,
            AH_TRANSFORM_MD5 | AH_TRANSFORM_SHA | AH_TRANSFORM_SHA2_256
        ),
        ProtocolId::ESP => matches!(
            transform_id,
            ESP_TRANSFORM_DES | ESP_TRANSFORM_3DES | ESP_TRANSFORM_NULL | ESP_TRANSFORM_AES
        ),
        ProtocolId::IPCOMP => matches!(
            transform_id,
            IPCOMP_TRANSFORM_OUI | IPCOMP_TRANSFORM_DEFLATE | IPCOMP_TRANSFORM_LZS
        ),
        _ => false,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Lifetime {
    pub seconds: Option<u32>,
    pub kilobytes: Option<u32>,
}

impl Lifetime {
    pub fn seconds(seconds: u32) -> Lifetime {
        Lifetime {
            seconds: Some(seconds),
            kilobytes: None,
        }
    }
}

// One complete phase-1 algorithm set, as offered by a peer or configured locally.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IsakmpTransform {
    pub number: u8,
    pub encryption: EncryptionAlgorithm,
    pub key_length: Option<u16>,
    pub hash: HashAlgorithm,
    pub auth_method: AuthenticationMethod,
    pub group: DhGroup,
    pub life: Lifetime,
}

// One phase-2 algorithm choice within a protocol.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IpsecTransform {
    pub number: u8,
    pub transform_id: u8,
    pub auth: Option<AuthAlgorithm>,
    pub encapsulation: EncapsulationMode,
    pub key_length: Option<u16>,
    pub group: Option<DhGroup>,
    pub life: Lifetime,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ProtocolProposal {
    pub protocol: ProtocolId,
    pub spi: Vec<u8>,
    pub transforms: Vec<IpsecTransform>,
}

// All protocols sharing one proposal number form a single SA bundle offer.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SaProposal {
    pub number: u8,
    pub protocols: Vec<ProtocolProposal>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IsakmpProposal {
    pub number: u8,
    pub transforms: Vec<IsakmpTransform>,
}

// The negotiated phase-1 algorithm set; immutable once selected.
#[derive(Clone, Debug)]
pub struct Phase1Approval {
    pub encryption: EncryptionAlgorithm,
    pub key_length: Option<u16>,
    pub hash: HashAlgorithm,
    pub auth_method: AuthenticationMethod,
    pub group: DhGroup,
    pub life: Lifetime,
    // Set when the peer requested a longer lifetime that was narrowed locally.
    pub responder_lifetime: bool,
}

#[derive(Clone, Debug)]
pub struct ApprovedProtocol {
    pub protocol: ProtocolId,
    pub transform_id: u8,
    pub auth: Option<AuthAlgorithm>,
    pub encapsulation: EncapsulationMode,
    pub key_length: Option<u16>,
    pub local_spi: Vec<u8>,
    pub peer_spi: Vec<u8>,
}

// The negotiated phase-2 bundle, combining the peer's algorithm choice with
// SPI values taken one from each side.
#[derive(Clone, Debug)]
pub struct Phase2Approval {
    pub number: u8,
    pub protocols: Vec<ApprovedProtocol>,
    pub group: Option<DhGroup>,
    pub life: Lifetime,
    pub responder_lifetime: bool,
}

fn check_doi_situation(sa: &PayloadSecurityAssociation) -> Result<(), ProposalError> {
    if sa.doi() != message::DOI_IPSEC {
        debug!("Unsupported DOI {}", sa.doi());
        return Err(ProposalError::DoiNotSupported(sa.doi()));
    }
    if sa.situation() != message::SITUATION_IDENTITY_ONLY {
        debug!("Unsupported situation {}", sa.situation());
        return Err(ProposalError::SituationNotSupported(sa.situation()));
    }
    Ok(())
}

fn parse_lifetime_attribute(
    life: &mut Lifetime,
    life_type: &mut Option<u16>,
    attribute_type_is_life_type: bool,
    value: Option<u32>,
) -> Result<(), ProposalError> {
    if attribute_type_is_life_type {
        if life_type.is_some() {
            debug!("Life type attribute sent twice without a duration");
            return Err(ProposalError::AttributesNotSupported);
        }
        *life_type = value.map(|value| value as u16);
        Ok(())
    } else {
        let duration = value.ok_or(ProposalError::AttributesNotSupported)?;
        match life_type.take() {
            Some(LIFE_TYPE_SECONDS) => life.seconds = Some(duration),
            Some(LIFE_TYPE_KILOBYTES) => life.kilobytes = Some(duration),
            _ => {
                debug!("Life duration attribute without a preceding life type");
                return Err(ProposalError::AttributesNotSupported);
            }
        }
        Ok(())
    }
}

// RESPONDER-LIFETIME notification data reuses the transform attribute
// encoding for the life type and duration pair.
pub fn parse_notify_lifetime(data: &[u8]) -> Result<Lifetime, ProposalError> {
    let mut life = Lifetime::default();
    let mut life_type = None;
    for attr in message::AttributeIter::new(data) {
        let attr = attr.map_err(|_| ProposalError::AttributesNotSupported)?;
        match IpsecAttributeType::from_u16(attr.attribute_type) {
            IpsecAttributeType::LIFE_TYPE => {
                parse_lifetime_attribute(&mut life, &mut life_type, true, attr.value_u32())?
            }
            IpsecAttributeType::LIFE_DURATION => {
                parse_lifetime_attribute(&mut life, &mut life_type, false, attr.value_u32())?
            }
            _ => {}
        }
    }
    Ok(life)
}

// Serializes a narrowed lifetime for a RESPONDER-LIFETIME notification.
pub fn serialize_notify_lifetime(life: &Lifetime) -> Vec<u8> {
    let mut attrs = AttributeWriter::new();
    attrs.write_lifetime(
        life,
        IpsecAttributeType::LIFE_TYPE.0,
        IpsecAttributeType::LIFE_DURATION.0,
    );
    attrs.data
}

fn parse_isakmp_transform(raw: &RawTransform) -> Result<IsakmpTransform, ProposalError> {
    if raw.transform_id != ISAKMP_TRANSFORM_KEY_IKE {
        debug!("Unsupported ISAKMP transform ID {}", raw.transform_id);
        return Err(ProposalError::InvalidTransformId(raw.transform_id));
    }
    let mut encryption = None;
    let mut key_length = None;
    let mut hash = None;
    let mut auth_method = None;
    let mut group = None;
    let mut life = Lifetime::default();
    let mut life_type = None;
    for attr in raw.iter_attributes() {
        let attr = attr.map_err(|_| ProposalError::BadProposalSyntax)?;
        let attribute_type = OakleyAttributeType::from_u16(attr.attribute_type);
        if attribute_type.requires_fixed_width() && !attr.fixed_width {
            debug!(
                "Attribute {} sent as variable-width, fixed-width is mandated",
                attr.attribute_type
            );
            return Err(ProposalError::AttributesNotSupported);
        }
        match attribute_type {
            OakleyAttributeType::ENCRYPTION_ALGORITHM => {
                encryption = attr.value_u16().map(EncryptionAlgorithm::from_u16)
            }
            OakleyAttributeType::HASH_ALGORITHM => {
                hash = attr.value_u16().map(HashAlgorithm::from_u16)
            }
            OakleyAttributeType::AUTHENTICATION_METHOD => {
                auth_method = attr.value_u16().map(AuthenticationMethod::from_u16)
            }
            OakleyAttributeType::GROUP_DESCRIPTION => {
                group = attr.value_u16().map(DhGroup::from_u16)
            }
            OakleyAttributeType::KEY_LENGTH => key_length = attr.value_u16(),
            OakleyAttributeType::LIFE_TYPE => {
                parse_lifetime_attribute(&mut life, &mut life_type, true, attr.value_u32())?
            }
            OakleyAttributeType::LIFE_DURATION => {
                parse_lifetime_attribute(&mut life, &mut life_type, false, attr.value_u32())?
            }
            _ => {
                debug!("Ignoring unknown Oakley attribute {}", attr.attribute_type);
            }
        }
    }
    let encryption = encryption.ok_or(ProposalError::AttributesNotSupported)?;
    let hash = hash.ok_or(ProposalError::AttributesNotSupported)?;
    let auth_method = auth_method.ok_or(ProposalError::AttributesNotSupported)?;
    let group = group.ok_or(ProposalError::AttributesNotSupported)?;
    Ok(IsakmpTransform {
        number: raw.transform_num,
        encryption,
        key_length,
        hash,
        auth_method,
        group,
        life,
    })
}

// Decodes a phase-1 SA payload into per-proposal-number transform sets.
// Transforms that fail to decode are dropped; proposals left with no valid
// transforms are dropped; an offer with no surviving proposal is an error.
pub fn parse_phase1(
    sa: &PayloadSecurityAssociation,
) -> Result<Vec<IsakmpProposal>, ProposalError> {
    check_doi_situation(sa)?;
    let mut proposals: Vec<IsakmpProposal> = vec![];
    for prop in sa.iter_proposals() {
        let prop = prop.map_err(|_| ProposalError::BadProposalSyntax)?;
        let protocol = ProtocolId::from_u8(prop.protocol_id)
            .map_err(|_| ProposalError::InvalidProtocolId(prop.protocol_id))?;
        if protocol != ProtocolId::ISAKMP {
            debug!("Phase 1 proposal offers protocol {}", protocol);
            return Err(ProposalError::InvalidProtocolId(prop.protocol_id));
        }
        // Either an empty SPI or the full cookie pair is accepted here.
        if !prop.spi.is_empty() && prop.spi.len() != ProtocolId::ISAKMP.spi_size() {
            debug!("Phase 1 proposal SPI size {}", prop.spi.len());
            return Err(ProposalError::InvalidSpi);
        }
        let mut transforms = vec![];
        for raw in prop.iter_transforms() {
            let raw = raw.map_err(|_| ProposalError::BadProposalSyntax)?;
            match parse_isakmp_transform(&raw) {
                Ok(transform) => transforms.push(transform),
                Err(err) => {
                    debug!(
                        "Dropping phase 1 transform {} from proposal {}: {}",
                        raw.transform_num, prop.proposal_num, err
                    );
                }
            }
        }
        if transforms.is_empty() {
            debug!(
                "Dropping phase 1 proposal {} with no valid transforms",
                prop.proposal_num
            );
            continue;
        }
        proposals.push(IsakmpProposal {
            number: prop.proposal_num,
            transforms,
        });
    }
    if proposals.is_empty() {
        Err(ProposalError::NoProposalChosen)
    } else {
        Ok(proposals)
    }
}

fn parse_ipsec_transform(
    protocol: ProtocolId,
    raw: &RawTransform,
) -> Result<IpsecTransform, ProposalError> {
    if !valid_transform_id(protocol, raw.transform_id) {
        debug!(
            "Unsupported transform ID {} for protocol {}",
            raw.transform_id, protocol
        );
        return Err(ProposalError::InvalidTransformId(raw.transform_id));
    }
    let mut auth = None;
    let mut encapsulation = EncapsulationMode::TUNNEL;
    let mut key_length = None;
    let mut group = None;
    let mut life = Lifetime::default();
    let mut life_type = None;
    for attr in raw.iter_attributes() {
        let attr = attr.map_err(|_| ProposalError::BadProposalSyntax)?;
        let attribute_type = IpsecAttributeType::from_u16(attr.attribute_type);
        if attribute_type.requires_fixed_width() && !attr.fixed_width {
            debug!(
                "Attribute {} sent as variable-width, fixed-width is mandated",
                attr.attribute_type
            );
            return Err(ProposalError::AttributesNotSupported);
        }
        match attribute_type {
            IpsecAttributeType::AUTH_ALGORITHM => {
                auth = attr.value_u16().map(AuthAlgorithm::from_u16)
            }
            IpsecAttributeType::ENCAPSULATION_MODE => {
                encapsulation = attr
                    .value_u16()
                    .map(EncapsulationMode::from_u16)
                    .ok_or(ProposalError::AttributesNotSupported)?
            }
            IpsecAttributeType::KEY_LENGTH => key_length = attr.value_u16(),
            IpsecAttributeType::GROUP_DESCRIPTION => {
                group = attr.value_u16().map(DhGroup::from_u16)
            }
            IpsecAttributeType::LIFE_TYPE => {
                parse_lifetime_attribute(&mut life, &mut life_type, true, attr.value_u32())?
            }
            IpsecAttributeType::LIFE_DURATION => {
                parse_lifetime_attribute(&mut life, &mut life_type, false, attr.value_u32())?
            }
            _ => {
                debug!("Ignoring unknown IPsec attribute {}", attr.attribute_type);
            }
        }
    }
    // AH is nothing but authentication; ESP-NULL has no confidentiality to
    // contribute either. Both mandate an explicit auth attribute.
    if protocol == ProtocolId::AH && auth.is_none() {
        debug!("AH transform without an auth algorithm attribute");
        return Err(ProposalError::AttributesNotSupported);
    }
    if protocol == ProtocolId::ESP && raw.transform_id == ESP_TRANSFORM_NULL && auth.is_none() {
        debug!("ESP-NULL transform without an auth algorithm attribute");
        return Err(ProposalError::AttributesNotSupported);
    }
    Ok(IpsecTransform {
        number: raw.transform_num,
        transform_id: raw.transform_id,
        auth,
        encapsulation,
        key_length,
        group,
        life,
    })
}

fn valid_phase2_spi_size(protocol: ProtocolId, spi_size: usize) -> bool {
    match protocol {
        // Both CPI sizes seen in the wild are accepted.
        ProtocolId::IPCOMP => spi_size == 2 || spi_size == 4,
        ProtocolId::AH | ProtocolId::ESP => spi_size == 4,
        _ => false,
    }
}

// Decodes a phase-2 SA payload, grouping protocols by proposal number while
// preserving protocol order within each proposal.
pub fn parse_phase2(sa: &PayloadSecurityAssociation) -> Result<Vec<SaProposal>, ProposalError> {
    check_doi_situation(sa)?;
    let mut proposals: Vec<SaProposal> = vec![];
    for prop in sa.iter_proposals() {
        let prop = prop.map_err(|_| ProposalError::BadProposalSyntax)?;
        let protocol = ProtocolId::from_u8(prop.protocol_id)
            .map_err(|_| ProposalError::InvalidProtocolId(prop.protocol_id))?;
        if protocol == ProtocolId::ISAKMP {
            debug!("Phase 2 proposal offers protocol {}", protocol);
            return Err(ProposalError::InvalidProtocolId(prop.protocol_id));
        }
        if !valid_phase2_spi_size(protocol, prop.spi.len()) {
            debug!(
                "Phase 2 proposal SPI size {} for protocol {}",
                prop.spi.len(),
                protocol
            );
            return Err(ProposalError::InvalidSpi);
        }
        let mut transforms = vec![];
        for raw in prop.iter_transforms() {
            let raw = raw.map_err(|_| ProposalError::BadProposalSyntax)?;
            match parse_ipsec_transform(protocol, &raw) {
                Ok(transform) => transforms.push(transform),
                Err(err) => {
                    debug!(
                        "Dropping phase 2 transform {} from proposal {}: {}",
                        raw.transform_num, prop.proposal_num, err
                    );
                }
            }
        }
        if transforms.is_empty() {
            debug!(
                "Dropping phase 2 protocol {} from proposal {} with no valid transforms",
                protocol, prop.proposal_num
            );
            continue;
        }
        let protocol_proposal = ProtocolProposal {
            protocol,
            spi: prop.spi.to_vec(),
            transforms,
        };
        match proposals
            .iter_mut()
            .find(|existing| existing.number == prop.proposal_num)
        {
            Some(existing) => existing.protocols.push(protocol_proposal),
            None => proposals.push(SaProposal {
                number: prop.proposal_num,
                protocols: vec![protocol_proposal],
            }),
        }
    }
    // A bundle that lost one of its protocols to transform filtering is no
    // longer the offer the peer made.
    proposals.retain(|proposal| {
        if proposal.protocols.is_empty() {
            debug!("Dropping empty phase 2 proposal {}", proposal.number);
            false
        } else {
            true
        }
    });
    if proposals.is_empty() {
        Err(ProposalError::NoProposalChosen)
    } else {
        Ok(proposals)
    }
}

// Reconciles the peer's lifetime against the local maximum under the
// configured check level. Returns the approved value, plus whether a
// responder-lifetime notify needs to be flagged.
fn reconcile_lifetime(
    peer: &Lifetime,
    local: &Lifetime,
    check_level: CheckLevel,
) -> Option<(Lifetime, bool)> {
    let reconcile_value = |peer: Option<u32>, local: Option<u32>| -> Option<(Option<u32>, bool)> {
        let peer_value = match peer {
            Some(peer_value) => peer_value,
            None => return Some((local, false)),
        };
        let local_value = match local {
            Some(local_value) => local_value,
            None => return Some((Some(peer_value), false)),
        };
        match check_level {
            CheckLevel::Obey => Some((Some(peer_value), false)),
            CheckLevel::Strict => {
                if peer_value > local_value {
                    None
                } else {
                    Some((Some(peer_value), false))
                }
            }
            CheckLevel::Claim => {
                if peer_value > local_value {
                    Some((Some(local_value), true))
                } else {
                    Some((Some(peer_value), false))
                }
            }
            CheckLevel::Exact => {
                if peer_value != local_value {
                    None
                } else {
                    Some((Some(peer_value), false))
                }
            }
        }
    };
    let (seconds, claimed_seconds) = reconcile_value(peer.seconds, local.seconds)?;
    let (kilobytes, claimed_kilobytes) = reconcile_value(peer.kilobytes, local.kilobytes)?;
    Some((
        Lifetime { seconds, kilobytes },
        claimed_seconds || claimed_kilobytes,
    ))
}

// Phase-1 selection: first peer transform that matches a configured candidate
// on all algorithm fields wins; candidates are tried in configuration order.
pub fn match_phase1(
    peer_proposals: &[IsakmpProposal],
    local_candidates: &[IsakmpTransform],
    check_level: CheckLevel,
) -> Result<Phase1Approval, ProposalError> {
    for proposal in peer_proposals {
        for peer in &proposal.transforms {
            if !peer.encryption.is_supported()
                || !peer.hash.is_supported()
                || !peer.group.is_supported()
            {
                debug!(
                    "Skipping peer transform {} with unsupported algorithms ({}, {}, {})",
                    peer.number, peer.encryption, peer.hash, peer.group
                );
                continue;
            }
            for local in local_candidates {
                if peer.encryption != local.encryption {
                    debug!(
                        "Phase 1 candidate {}: encryption mismatch (peer {}, local {})",
                        local.number, peer.encryption, local.encryption
                    );
                    continue;
                }
                if peer.auth_method != local.auth_method {
                    debug!(
                        "Phase 1 candidate {}: auth method mismatch (peer {}, local {})",
                        local.number, peer.auth_method, local.auth_method
                    );
                    continue;
                }
                if peer.hash != local.hash {
                    debug!(
                        "Phase 1 candidate {}: hash mismatch (peer {}, local {})",
                        local.number, peer.hash, local.hash
                    );
                    continue;
                }
                if peer.group != local.group {
                    debug!(
                        "Phase 1 candidate {}: DH group mismatch (peer {}, local {})",
                        local.number, peer.group, local.group
                    );
                    continue;
                }
                if peer.key_length != local.key_length {
                    debug!(
                        "Phase 1 candidate {}: key length mismatch (peer {:?}, local {:?})",
                        local.number, peer.key_length, local.key_length
                    );
                    continue;
                }
                let (life, responder_lifetime) =
                    match reconcile_lifetime(&peer.life, &local.life, check_level) {
                        Some(reconciled) => reconciled,
                        None => {
                            debug!(
                                "Phase 1 candidate {}: lifetime rejected (peer {:?}, local {:?})",
                                local.number, peer.life, local.life
                            );
                            continue;
                        }
                    };
                return Ok(Phase1Approval {
                    encryption: peer.encryption,
                    key_length: peer.key_length,
                    hash: peer.hash,
                    auth_method: peer.auth_method,
                    group: peer.group,
                    life,
                    responder_lifetime,
                });
            }
        }
    }
    Err(ProposalError::NoProposalChosen)
}

fn match_ipsec_transform(
    peer: &IpsecTransform,
    local: &IpsecTransform,
    check_level: CheckLevel,
) -> Option<(Lifetime, bool)> {
    if peer.transform_id != local.transform_id {
        debug!(
            "Phase 2 transform mismatch (peer ID {}, local ID {})",
            peer.transform_id, local.transform_id
        );
        return None;
    }
    if peer.auth != local.auth {
        debug!(
            "Phase 2 auth algorithm mismatch (peer {:?}, local {:?})",
            peer.auth, local.auth
        );
        return None;
    }
    if peer.encapsulation != local.encapsulation {
        debug!(
            "Phase 2 encapsulation mismatch (peer {}, local {})",
            peer.encapsulation, local.encapsulation
        );
        return None;
    }
    if peer.key_length != local.key_length {
        debug!(
            "Phase 2 key length mismatch (peer {:?}, local {:?})",
            peer.key_length, local.key_length
        );
        return None;
    }
    if peer.group != local.group {
        debug!(
            "Phase 2 PFS group mismatch (peer {:?}, local {:?})",
            peer.group, local.group
        );
        return None;
    }
    reconcile_lifetime(&peer.life, &local.life, check_level)
}

// Phase-2 selection: peer and local proposals are compared per-protocol in
// protocol order; the approved bundle combines the peer's algorithm choice
// with the local SPI (to be filled by SPI allocation) and the peer's SPI.
pub fn match_phase2(
    peer_proposals: &[SaProposal],
    local_proposal: &SaProposal,
    check_level: CheckLevel,
) -> Result<Phase2Approval, ProposalError> {
    for peer_proposal in peer_proposals {
        if peer_proposal.protocols.len() != local_proposal.protocols.len() {
            debug!(
                "Phase 2 proposal {}: protocol count mismatch (peer {}, local {})",
                peer_proposal.number,
                peer_proposal.protocols.len(),
                local_proposal.protocols.len()
            );
            continue;
        }
        let mut protocols = Vec::with_capacity(peer_proposal.protocols.len());
        let mut life = Lifetime::default();
        let mut group = None;
        let mut responder_lifetime = false;
        let mut matches = true;
        for (peer_protocol, local_protocol) in peer_proposal
            .protocols
            .iter()
            .zip(local_proposal.protocols.iter())
        {
            if peer_protocol.protocol != local_protocol.protocol {
                debug!(
                    "Phase 2 proposal {}: protocol order mismatch (peer {}, local {})",
                    peer_proposal.number, peer_protocol.protocol, local_protocol.protocol
                );
                matches = false;
                break;
            }
            let mut approved = None;
            'transforms: for peer_transform in &peer_protocol.transforms {
                for local_transform in &local_protocol.transforms {
                    if let Some((approved_life, claimed)) =
                        match_ipsec_transform(peer_transform, local_transform, check_level)
                    {
                        approved = Some((peer_transform.clone(), approved_life, claimed));
                        break 'transforms;
                    }
                }
            }
            let (transform, approved_life, claimed) = match approved {
                Some(approved) => approved,
                None => {
                    debug!(
                        "Phase 2 proposal {}: no acceptable transform for protocol {}",
                        peer_proposal.number, peer_protocol.protocol
                    );
                    matches = false;
                    break;
                }
            };
            life = approved_life;
            group = transform.group;
            responder_lifetime = responder_lifetime || claimed;
            protocols.push(ApprovedProtocol {
                protocol: peer_protocol.protocol,
                transform_id: transform.transform_id,
                auth: transform.auth,
                encapsulation: transform.encapsulation,
                key_length: transform.key_length,
                local_spi: local_protocol.spi.clone(),
                peer_spi: peer_protocol.spi.clone(),
            });
        }
        if matches {
            return Ok(Phase2Approval {
                number: peer_proposal.number,
                protocols,
                group,
                life,
                responder_lifetime,
            });
        }
    }
    Err(ProposalError::NoProposalChosen)
}

struct AttributeWriter {
    data: Vec<u8>,
}

impl AttributeWriter {
    fn new() -> AttributeWriter {
        AttributeWriter { data: vec![] }
    }

    fn write_tv(&mut self, attribute_type: u16, value: u16) {
        self.data
            .extend_from_slice(&(attribute_type | message::ATTRIBUTE_FORMAT_TV).to_be_bytes());
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    fn write_tlv(&mut self, attribute_type: u16, value: &[u8]) {
        self.data.extend_from_slice(&attribute_type.to_be_bytes());
        self.data
            .extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.data.extend_from_slice(value);
    }

    fn write_lifetime(&mut self, life: &Lifetime, life_type_attr: u16, life_duration_attr: u16) {
        if let Some(seconds) = life.seconds {
            self.write_tv(life_type_attr, LIFE_TYPE_SECONDS);
            self.write_tlv(life_duration_attr, &seconds.to_be_bytes());
        }
        if let Some(kilobytes) = life.kilobytes {
            self.write_tv(life_type_attr, LIFE_TYPE_KILOBYTES);
            self.write_tlv(life_duration_attr, &kilobytes.to_be_bytes());
        }
    }
}

fn write_substructure_header(
    data: &mut Vec<u8>,
    next_payload: u8,
    body_length: usize,
) {
    data.push(next_payload);
    data.push(0);
    data.extend_from_slice(&((body_length + 4) as u16).to_be_bytes());
}

fn serialize_isakmp_transform(transform: &IsakmpTransform, last: bool) -> Vec<u8> {
    let mut attributes = AttributeWriter::new();
    attributes.write_tv(
        OakleyAttributeType::ENCRYPTION_ALGORITHM.0,
        transform.encryption.type_id(),
    );
    attributes.write_tv(OakleyAttributeType::HASH_ALGORITHM.0, transform.hash.type_id());
    attributes.write_tv(
        OakleyAttributeType::AUTHENTICATION_METHOD.0,
        transform.auth_method.type_id(),
    );
    attributes.write_tv(
        OakleyAttributeType::GROUP_DESCRIPTION.0,
        transform.group.type_id(),
    );
    if let Some(key_length) = transform.key_length {
        attributes.write_tv(OakleyAttributeType::KEY_LENGTH.0, key_length);
    }
    attributes.write_lifetime(
        &transform.life,
        OakleyAttributeType::LIFE_TYPE.0,
        OakleyAttributeType::LIFE_DURATION.0,
    );
    let mut data = vec![];
    let next_payload = if last {
        message::PayloadType::NONE.type_id()
    } else {
        message::PayloadType::TRANSFORM.type_id()
    };
    write_substructure_header(&mut data, next_payload, 4 + attributes.data.len());
    data.push(transform.number);
    data.push(ISAKMP_TRANSFORM_KEY_IKE);
    data.extend_from_slice(&[0, 0]);
    data.extend_from_slice(&attributes.data);
    data
}

// Encodes a phase-1 offer (or a selected single-transform approval) as SA
// payload proposal bytes.
pub fn serialize_phase1(proposal: &IsakmpProposal, spi: &[u8]) -> Vec<u8> {
    let mut transforms_data = vec![];
    for (i, transform) in proposal.transforms.iter().enumerate() {
        let last = i + 1 == proposal.transforms.len();
        transforms_data.extend_from_slice(&serialize_isakmp_transform(transform, last));
    }
    let mut data = vec![];
    write_substructure_header(
        &mut data,
        message::PayloadType::NONE.type_id(),
        4 + spi.len() + transforms_data.len(),
    );
    data.push(proposal.number);
    data.push(ProtocolId::ISAKMP.type_id());
    data.push(spi.len() as u8);
    data.push(proposal.transforms.len() as u8);
    data.extend_from_slice(spi);
    data.extend_from_slice(&transforms_data);
    data
}

pub fn approval_to_isakmp_proposal(approval: &Phase1Approval) -> IsakmpProposal {
    IsakmpProposal {
        number: 1,
        transforms: vec![IsakmpTransform {
            number: 1,
            encryption: approval.encryption,
            key_length: approval.key_length,
            hash: approval.hash,
            auth_method: approval.auth_method,
            group: approval.group,
            life: approval.life,
        }],
    }
}

fn serialize_ipsec_transform(transform: &IpsecTransform, last: bool) -> Vec<u8> {
    let mut attributes = AttributeWriter::new();
    attributes.write_lifetime(
        &transform.life,
        IpsecAttributeType::LIFE_TYPE.0,
        IpsecAttributeType::LIFE_DURATION.0,
    );
    attributes.write_tv(
        IpsecAttributeType::ENCAPSULATION_MODE.0,
        transform.encapsulation.type_id(),
    );
    if let Some(auth) = transform.auth {
        attributes.write_tv(IpsecAttributeType::AUTH_ALGORITHM.0, auth.type_id());
    }
    if let Some(key_length) = transform.key_length {
        attributes.write_tv(IpsecAttributeType::KEY_LENGTH.0, key_length);
    }
    if let Some(group) = transform.group {
        attributes.write_tv(IpsecAttributeType::GROUP_DESCRIPTION.0, group.type_id());
    }
    let mut data = vec![];
    let next_payload = if last {
        message::PayloadType::NONE.type_id()
    } else {
        message::PayloadType::TRANSFORM.type_id()
    };
    write_substructure_header(&mut data, next_payload, 4 + attributes.data.len());
    data.push(transform.number);
    data.push(transform.transform_id);
    data.extend_from_slice(&[0, 0]);
    data.extend_from_slice(&attributes.data);
    data
}

// Encodes a phase-2 proposal as SA payload proposal bytes. SPI fields are
// written as stored; a from-policy proposal carries zeroed SPIs until the
// SPI-allocation step fills them in.
pub fn serialize_phase2(proposal: &SaProposal) -> Vec<u8> {
    let mut data = vec![];
    for (i, protocol) in proposal.protocols.iter().enumerate() {
        let last = i + 1 == proposal.protocols.len();
        let mut transforms_data = vec![];
        for (j, transform) in protocol.transforms.iter().enumerate() {
            let transform_last = j + 1 == protocol.transforms.len();
            transforms_data.extend_from_slice(&serialize_ipsec_transform(transform, transform_last));
        }
        let next_payload = if last {
            message::PayloadType::NONE.type_id()
        } else {
            message::PayloadType::PROPOSAL.type_id()
        };
        write_substructure_header(
            &mut data,
            next_payload,
            4 + protocol.spi.len() + transforms_data.len(),
        );
        data.push(proposal.number);
        data.push(protocol.protocol.type_id());
        data.push(protocol.spi.len() as u8);
        data.push(protocol.transforms.len() as u8);
        data.extend_from_slice(&protocol.spi);
        data.extend_from_slice(&transforms_data);
    }
    data
}

pub fn approval_to_sa_proposal(approval: &Phase2Approval, use_local_spi: bool) -> SaProposal {
    SaProposal {
        number: approval.number,
        protocols: approval
            .protocols
            .iter()
            .map(|protocol| ProtocolProposal {
                protocol: protocol.protocol,
                spi: if use_local_spi {
                    protocol.local_spi.clone()
                } else {
                    protocol.peer_spi.clone()
                },
                transforms: vec![IpsecTransform {
                    number: 1,
                    transform_id: protocol.transform_id,
                    auth: protocol.auth,
                    encapsulation: protocol.encapsulation,
                    key_length: protocol.key_length,
                    group: approval.group,
                    life: approval.life,
                }],
            })
            .collect(),
    }
}

#[derive(Debug)]
pub enum ProposalError {
    DoiNotSupported(u32),
    SituationNotSupported(u32),
    InvalidProtocolId(u8),
    InvalidSpi,
    InvalidTransformId(u8),
    AttributesNotSupported,
    BadProposalSyntax,
    NoProposalChosen,
}

impl ProposalError {
    // Notify code reported to the peer for this failure.
    pub fn notify_type(&self) -> NotifyMessageType {
        match self {
            Self::DoiNotSupported(_) => NotifyMessageType::DOI_NOT_SUPPORTED,
            Self::SituationNotSupported(_) => NotifyMessageType::SITUATION_NOT_SUPPORTED,
            Self::InvalidProtocolId(_) => NotifyMessageType::INVALID_PROTOCOL_ID,
            Self::InvalidSpi => NotifyMessageType::INVALID_SPI,
            Self::InvalidTransformId(_) => NotifyMessageType::INVALID_TRANSFORM_ID,
            Self::AttributesNotSupported => NotifyMessageType::ATTRIBUTES_NOT_SUPPORTED,
            Self::BadProposalSyntax => NotifyMessageType::BAD_PROPOSAL_SYNTAX,
            Self::NoProposalChosen => NotifyMessageType::NO_PROPOSAL_CHOSEN,
        }
    }
}

impl fmt::Display for ProposalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::DoiNotSupported(doi) => write!(f, "Unsupported DOI {}", doi),
            Self::SituationNotSupported(situation) => {
                write!(f, "Unsupported situation {}", situation)
            }
            Self::InvalidProtocolId(protocol) => write!(f, "Invalid protocol ID {}", protocol),
            Self::InvalidSpi => write!(f, "Invalid SPI"),
            Self::InvalidTransformId(transform) => write!(f, "Invalid transform ID {}", transform),
            Self::AttributesNotSupported => write!(f, "Attributes not supported"),
            Self::BadProposalSyntax => write!(f, "Bad proposal syntax"),
            Self::NoProposalChosen => write!(f, "No acceptable proposal"),
        }
    }
}

impl error::Error for ProposalError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev1::message::{
        ExchangeType, Flags, InputMessage, MessageWriter, Payload, PayloadType,
    };

    fn sample_isakmp_transform() -> IsakmpTransform {
        IsakmpTransform {
            number: 1,
            encryption: EncryptionAlgorithm::AES_CBC,
            key_length: Some(128),
            hash: HashAlgorithm::SHA1,
            auth_method: AuthenticationMethod::PRE_SHARED_KEY,
            group: DhGroup::MODP_1024,
            life: Lifetime::seconds(28800),
        }
    }

    fn sample_esp_proposal(spi: &[u8]) -> SaProposal {
        SaProposal {
            number: 1,
            protocols: vec![ProtocolProposal {
                protocol: ProtocolId::ESP,
                spi: spi.to_vec(),
                transforms: vec![IpsecTransform {
                    number: 1,
                    transform_id: ESP_TRANSFORM_AES,
                    auth: Some(AuthAlgorithm::HMAC_SHA1),
                    encapsulation: EncapsulationMode::TUNNEL,
                    key_length: Some(128),
                    group: None,
                    life: Lifetime::seconds(3600),
                }],
            }],
        }
    }

    fn parse_sa_message<'a, T>(
        dest: &'a mut [u8],
        proposals_data: &[u8],
        parse: impl Fn(&PayloadSecurityAssociation) -> Result<T, ProposalError>,
    ) -> Result<T, ProposalError> {
        let length = {
            let mut writer = MessageWriter::new(dest).unwrap();
            writer
                .write_header(
                    [1; 8],
                    [0; 8],
                    ExchangeType::IDENTITY_PROTECTION,
                    Flags::NONE,
                    0,
                )
                .unwrap();
            writer
                .write_security_association_payload(proposals_data)
                .unwrap();
            writer.complete_message()
        };
        let msg = InputMessage::from_datagram(&dest[..length]).unwrap();
        let payload = msg.iter_payloads().next().unwrap().unwrap();
        match payload {
            Payload::SecurityAssociation(sa) => parse(&sa),
            _ => panic!("Not an SA payload"),
        }
    }

    #[test]
    fn phase1_roundtrip() {
        let proposal = IsakmpProposal {
            number: 1,
            transforms: vec![sample_isakmp_transform()],
        };
        let data = serialize_phase1(&proposal, &[]);
        let mut dest = [0u8; 512];
        let parsed = parse_sa_message(&mut dest, &data, parse_phase1).unwrap();
        assert_eq!(parsed, vec![proposal]);
    }

    #[test]
    fn phase2_roundtrip() {
        let proposal = sample_esp_proposal(&[0x11, 0x22, 0x33, 0x44]);
        let data = serialize_phase2(&proposal);
        let mut dest = [0u8; 512];
        let parsed = parse_sa_message(&mut dest, &data, parse_phase2).unwrap();
        assert_eq!(parsed, vec![proposal]);
    }

    #[test]
    fn phase2_roundtrip_with_zeroed_spi() {
        let proposal = sample_esp_proposal(&[0, 0, 0, 0]);
        let data = serialize_phase2(&proposal);
        let mut dest = [0u8; 512];
        let parsed = parse_sa_message(&mut dest, &data, parse_phase2).unwrap();
        assert_eq!(parsed[0].protocols[0].spi, vec![0, 0, 0, 0]);
    }

    #[test]
    fn phase1_match_exact_requires_equal_lifetime() {
        let peer = vec![IsakmpProposal {
            number: 1,
            transforms: vec![sample_isakmp_transform()],
        }];
        let mut local = sample_isakmp_transform();
        local.life = Lifetime::seconds(28800);
        assert!(match_phase1(&peer, &[local.clone()], CheckLevel::Exact).is_ok());
        local.life = Lifetime::seconds(3600);
        assert!(match_phase1(&peer, &[local], CheckLevel::Exact).is_err());
    }

    #[test]
    fn phase1_match_obey_accepts_peer_lifetime() {
        let peer = vec![IsakmpProposal {
            number: 1,
            transforms: vec![sample_isakmp_transform()],
        }];
        let mut local = sample_isakmp_transform();
        local.life = Lifetime::seconds(60);
        let approval = match_phase1(&peer, &[local], CheckLevel::Obey).unwrap();
        assert_eq!(approval.life.seconds, Some(28800));
        assert!(!approval.responder_lifetime);
    }

    #[test]
    fn phase1_match_strict_rejects_longer_peer_lifetime() {
        let peer = vec![IsakmpProposal {
            number: 1,
            transforms: vec![sample_isakmp_transform()],
        }];
        let mut local = sample_isakmp_transform();
        local.life = Lifetime::seconds(3600);
        assert!(match_phase1(&peer, &[local], CheckLevel::Strict).is_err());
    }

    #[test]
    fn phase1_match_claim_narrows_lifetime() {
        let peer = vec![IsakmpProposal {
            number: 1,
            transforms: vec![sample_isakmp_transform()],
        }];
        let mut local = sample_isakmp_transform();
        local.life = Lifetime::seconds(3600);
        let approval = match_phase1(&peer, &[local], CheckLevel::Claim).unwrap();
        assert_eq!(approval.life.seconds, Some(3600));
        assert!(approval.responder_lifetime);
    }

    #[test]
    fn phase1_match_first_candidate_wins() {
        let mut first = sample_isakmp_transform();
        first.hash = HashAlgorithm::SHA2_256;
        let second = sample_isakmp_transform();
        let peer = vec![IsakmpProposal {
            number: 1,
            transforms: vec![
                {
                    let mut t = sample_isakmp_transform();
                    t.hash = HashAlgorithm::SHA2_256;
                    t
                },
                sample_isakmp_transform(),
            ],
        }];
        let approval = match_phase1(&peer, &[first, second], CheckLevel::Obey).unwrap();
        assert_eq!(approval.hash, HashAlgorithm::SHA2_256);
    }

    #[test]
    fn phase1_algorithm_mismatch_is_rejected() {
        let peer = vec![IsakmpProposal {
            number: 1,
            transforms: vec![sample_isakmp_transform()],
        }];
        let mut local = sample_isakmp_transform();
        local.group = DhGroup::MODP_2048;
        match match_phase1(&peer, &[local], CheckLevel::Obey) {
            Err(ProposalError::NoProposalChosen) => {}
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn phase1_match_skips_unsupported_peer_algorithms() {
        let mut unsupported = sample_isakmp_transform();
        unsupported.encryption = EncryptionAlgorithm::TRIPLE_DES_CBC;
        unsupported.key_length = None;
        let peer = vec![IsakmpProposal {
            number: 1,
            transforms: vec![unsupported.clone()],
        }];
        // Even a perfectly matching candidate cannot select a cipher the
        // provider does not implement.
        assert!(match_phase1(&peer, &[unsupported], CheckLevel::Obey).is_err());
    }

    #[test]
    fn esp_null_without_auth_is_rejected() {
        let mut proposal = sample_esp_proposal(&[0x11, 0x22, 0x33, 0x44]);
        proposal.protocols[0].transforms[0].transform_id = ESP_TRANSFORM_NULL;
        proposal.protocols[0].transforms[0].auth = None;
        proposal.protocols[0].transforms[0].key_length = None;
        let data = serialize_phase2(&proposal);
        let mut dest = [0u8; 512];
        match parse_sa_message(&mut dest, &data, parse_phase2) {
            Err(ProposalError::NoProposalChosen) => {}
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn fixed_width_attribute_sent_as_tlv_is_rejected() {
        let proposal = sample_esp_proposal(&[0x11, 0x22, 0x33, 0x44]);
        let mut data = serialize_phase2(&proposal);
        // Rewrite the encapsulation mode attribute (first TV attribute after
        // the lifetime pair) from TV to TLV form in place.
        let needle = (IpsecAttributeType::ENCAPSULATION_MODE.0 | message::ATTRIBUTE_FORMAT_TV)
            .to_be_bytes();
        let pos = data
            .windows(2)
            .position(|window| window == needle)
            .expect("encapsulation attribute present");
        data[pos..pos + 2].copy_from_slice(&IpsecAttributeType::ENCAPSULATION_MODE.0.to_be_bytes());
        // TLV form reads the next 2 bytes as a length, making the attribute
        // list inconsistent; either syntax or filtering must reject it.
        let mut dest = [0u8; 512];
        assert!(parse_sa_message(&mut dest, &data, parse_phase2).is_err());
    }

    #[test]
    fn phase2_match_combines_spis() {
        let peer = vec![sample_esp_proposal(&[0xaa, 0xbb, 0xcc, 0xdd])];
        let local = sample_esp_proposal(&[0x01, 0x02, 0x03, 0x04]);
        let approval = match_phase2(&peer, &local, CheckLevel::Obey).unwrap();
        assert_eq!(approval.protocols.len(), 1);
        assert_eq!(approval.protocols[0].peer_spi, vec![0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(approval.protocols[0].local_spi, vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(approval.protocols[0].transform_id, ESP_TRANSFORM_AES);
    }

    #[test]
    fn phase2_match_rejects_different_bundles() {
        let peer = vec![sample_esp_proposal(&[0xaa, 0xbb, 0xcc, 0xdd])];
        let mut local = sample_esp_proposal(&[0x01, 0x02, 0x03, 0x04]);
        local.protocols[0].transforms[0].transform_id = ESP_TRANSFORM_3DES;
        local.protocols[0].transforms[0].key_length = None;
        match match_phase2(&peer, &local, CheckLevel::Obey) {
            Err(ProposalError::NoProposalChosen) => {}
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn ipcomp_spi_sizes_are_interchangeable() {
        // A 2-byte CPI must be accepted where a 4-byte one is configured.
        let make = |spi: &[u8]| SaProposal {
            number: 1,
            protocols: vec![ProtocolProposal {
                protocol: ProtocolId::IPCOMP,
                spi: spi.to_vec(),
                transforms: vec![IpsecTransform {
                    number: 1,
                    transform_id: IPCOMP_TRANSFORM_DEFLATE,
                    auth: None,
                    encapsulation: EncapsulationMode::TUNNEL,
                    key_length: None,
                    group: None,
                    life: Lifetime::seconds(3600),
                }],
            }],
        };
        let peer_proposal = make(&[0x12, 0x34]);
        let data = serialize_phase2(&peer_proposal);
        let mut dest = [0u8; 512];
        let parsed = parse_sa_message(&mut dest, &data, parse_phase2).unwrap();
        let local = make(&[0x00, 0x00, 0x43, 0x21]);
        let approval = match_phase2(&parsed, &local, CheckLevel::Obey).unwrap();
        assert_eq!(approval.protocols[0].peer_spi, vec![0x12, 0x34]);
    }
}
