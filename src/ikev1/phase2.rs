use std::net::SocketAddr;
use std::time::Instant;

use log::{debug, warn};
use rand::Rng;

use super::crypto::{Array, DhTransform, DhTransformType, KeyMaterial, Prf, MAX_DH_KEY_LENGTH,
    MAX_PRF_OUTPUT_LENGTH};
use super::message::{
    Flags, InputMessage, MessageWriter, NotifyMessageType, Payload, PayloadIter, PayloadType,
    ProtocolId,
};
use super::phase1::{CookiePair, NegotiationError, Phase1Session, Role, TimerKind};
use super::policy::Phase2Policy;
use super::proposal::{
    self, ApprovedProtocol, Phase2Approval, SaProposal, AH_TRANSFORM_MD5, AH_TRANSFORM_SHA,
    AH_TRANSFORM_SHA2_256, ESP_TRANSFORM_3DES, ESP_TRANSFORM_AES, ESP_TRANSFORM_DES,
    ESP_TRANSFORM_NULL,
};
use super::sadb::{SadbHandle, SaInstall, SaKeys};

const NONCE_LENGTH: usize = 16;

// Quick-Mode progress, named by what the handle is doing rather than by
// message ordinals.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase2State {
    Start,
    // Waiting for the SA/SPD store to hand out local SPIs.
    SpiRequested,
    SpiAcquired,
    Msg1Sent,
    HashVerified,
    // Peer set the commit bit; holding until its CONNECTED notify arrives.
    CommitWait,
    InstallingSa,
    Established,
    Expired,
}

impl std::fmt::Display for Phase2State {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::SpiRequested => "spi-requested",
            Self::SpiAcquired => "spi-acquired",
            Self::Msg1Sent => "msg1-sent",
            Self::HashVerified => "hash-verified",
            Self::CommitWait => "commit-wait",
            Self::InstallingSa => "installing-sa",
            Self::Established => "established",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}

pub enum Phase2Action {
    None,
    Reply(usize),
    // Keying material is ready; install these SAs, then send the reply
    // (reply_length may be 0 when nothing goes out).
    Install {
        outputs: Vec<SaInstall>,
        reply_length: usize,
    },
}

// HASH(1) = prf(SKEYID_a, M-ID | payloads after the hash payload).
pub fn hash1(prf: &Prf, message_id: u32, rest: &[u8]) -> Array<MAX_PRF_OUTPUT_LENGTH> {
    prf.digest(&[&message_id.to_be_bytes(), rest])
}

// HASH(2) additionally covers the initiator nonce.
pub fn hash2(
    prf: &Prf,
    message_id: u32,
    nonce_i: &[u8],
    rest: &[u8],
) -> Array<MAX_PRF_OUTPUT_LENGTH> {
    prf.digest(&[&message_id.to_be_bytes(), nonce_i, rest])
}

// HASH(3) closes the exchange over a zero byte and both nonces.
pub fn hash3(
    prf: &Prf,
    message_id: u32,
    nonce_i: &[u8],
    nonce_r: &[u8],
) -> Array<MAX_PRF_OUTPUT_LENGTH> {
    prf.digest(&[&[0u8], &message_id.to_be_bytes(), nonce_i, nonce_r])
}

// Length of the payload chain starting at `data`, derived from the generic
// headers. Trailing cipher padding is not part of the chain.
pub fn payloads_span(first_payload: u8, data: &[u8]) -> usize {
    let mut offset = 0;
    let mut next_payload = first_payload;
    while next_payload != 0 && data.len() >= offset + 4 {
        next_payload = data[offset];
        let payload_length =
            u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        if payload_length < 4 || offset + payload_length > data.len() {
            break;
        }
        offset += payload_length;
    }
    offset
}

// Total key material one protocol requires: cipher key plus auth key.
fn protocol_key_length(protocol: &ApprovedProtocol) -> usize {
    let encryption_length = match protocol.protocol {
        ProtocolId::ESP => match protocol.transform_id {
            ESP_TRANSFORM_DES => 8,
            ESP_TRANSFORM_3DES => 24,
            ESP_TRANSFORM_AES => protocol.key_length.unwrap_or(128) as usize / 8,
            ESP_TRANSFORM_NULL => 0,
            _ => 0,
        },
        _ => 0,
    };
    let auth_length = match protocol.protocol {
        ProtocolId::AH => match protocol.transform_id {
            AH_TRANSFORM_MD5 => 128 / 8,
            AH_TRANSFORM_SHA => 160 / 8,
            AH_TRANSFORM_SHA2_256 => 256 / 8,
            _ => 0,
        },
        ProtocolId::ESP => protocol
            .auth
            .map(|auth| auth.key_length())
            .unwrap_or(0),
        _ => 0,
    };
    encryption_length + auth_length
}

// KEYMAT = prf(SKEYID_d, [g(qm)^xy |] protocol | SPI | Ni_b | Nr_b), iterated
// until the protocol's key length is covered.
pub fn derive_keymat(
    prf: &Prf,
    pfs_shared: Option<&[u8]>,
    protocol: ProtocolId,
    spi: &[u8],
    nonce_i: &[u8],
    nonce_r: &[u8],
    length: usize,
) -> KeyMaterial {
    let protocol_id = [protocol.type_id()];
    match pfs_shared {
        Some(shared) => prf.expand(&[shared, &protocol_id, spi, nonce_i, nonce_r], length),
        None => prf.expand(&[&protocol_id, spi, nonce_i, nonce_r], length),
    }
}

fn split_keys(protocol: &ApprovedProtocol, keymat: &KeyMaterial) -> SaKeys {
    let total = protocol_key_length(protocol);
    let auth_length = protocol
        .auth
        .map(|auth| auth.key_length())
        .unwrap_or(match protocol.protocol {
            ProtocolId::AH => total,
            _ => 0,
        });
    let encryption_length = total - auth_length;
    SaKeys {
        encryption_key: keymat.as_slice()[..encryption_length].to_vec(),
        authentication_key: keymat.as_slice()[encryption_length..total].to_vec(),
    }
}

pub struct Phase2Session {
    sequence: u32,
    phase1: CookiePair,
    message_id: u32,
    role: Role,
    state: Phase2State,
    policy_id: u32,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    // Our side of the negotiation, SPIs filled in as the store answers.
    proposed: SaProposal,
    pending_spis: usize,
    peer_proposals: Vec<SaProposal>,
    approval: Option<Phase2Approval>,
    pfs: Option<DhTransformType>,
    pfs_peer_public: Option<Vec<u8>>,
    pfs_shared: Option<Array<MAX_DH_KEY_LENGTH>>,
    nonce_local: Vec<u8>,
    nonce_peer: Vec<u8>,
    sent_id_payloads: Vec<Vec<u8>>,
    iv: Vec<u8>,
    last_sent: Option<Vec<u8>>,
    retries_left: u32,
    timer: Option<TimerKind>,
    timer_generation: u64,
    created: Instant,
}

impl Phase2Session {
    pub fn new_initiator(
        sequence: u32,
        phase1: &Phase1Session,
        policy: &Phase2Policy,
    ) -> Phase2Session {
        let mut message_id: u32 = 0;
        while message_id == 0 {
            message_id = rand::thread_rng().gen();
        }
        let mut proposed = policy.proposal.clone();
        for protocol in proposed.protocols.iter_mut() {
            for transform in protocol.transforms.iter_mut() {
                if transform.life.seconds.is_none() {
                    transform.life = policy.lifetime;
                }
            }
        }
        Phase2Session {
            sequence,
            phase1: phase1.cookies(),
            message_id,
            role: Role::Initiator,
            state: Phase2State::Start,
            policy_id: policy.id,
            local_addr: phase1.local_addr(),
            remote_addr: phase1.remote_addr(),
            proposed,
            pending_spis: 0,
            peer_proposals: vec![],
            approval: None,
            pfs: None,
            pfs_peer_public: None,
            pfs_shared: None,
            nonce_local: random_nonce(),
            nonce_peer: vec![],
            sent_id_payloads: vec![],
            iv: vec![],
            last_sent: None,
            retries_left: phase1.policy().retransmit.max_retries,
            timer: None,
            timer_generation: 0,
            created: Instant::now(),
        }
    }

    pub fn new_responder(
        sequence: u32,
        phase1: &Phase1Session,
        message_id: u32,
        policy: &Phase2Policy,
    ) -> Phase2Session {
        let mut proposed = policy.proposal.clone();
        for protocol in proposed.protocols.iter_mut() {
            for transform in protocol.transforms.iter_mut() {
                if transform.life.seconds.is_none() {
                    transform.life = policy.lifetime;
                }
            }
        }
        Phase2Session {
            sequence,
            phase1: phase1.cookies(),
            message_id,
            role: Role::Responder,
            state: Phase2State::Start,
            policy_id: policy.id,
            local_addr: phase1.local_addr(),
            remote_addr: phase1.remote_addr(),
            proposed,
            pending_spis: 0,
            peer_proposals: vec![],
            approval: None,
            pfs: None,
            pfs_peer_public: None,
            pfs_shared: None,
            nonce_local: random_nonce(),
            nonce_peer: vec![],
            sent_id_payloads: vec![],
            iv: vec![],
            last_sent: None,
            retries_left: phase1.policy().retransmit.max_retries,
            timer: None,
            timer_generation: 0,
            created: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn phase1_cookies(&self) -> CookiePair {
        self.phase1
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> Phase2State {
        self.state
    }

    pub fn policy_id(&self) -> u32 {
        self.policy_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_established(&self) -> bool {
        self.state == Phase2State::Established
    }

    pub fn is_expired(&self) -> bool {
        self.state == Phase2State::Expired
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    pub fn expire(&mut self) {
        self.state = Phase2State::Expired;
        self.cancel_timer();
        self.pfs = None;
        self.pfs_shared = None;
    }

    // A handle stuck early with nothing scheduled and no retries left has
    // been abandoned by both sides.
    pub fn is_stalled(&self) -> bool {
        matches!(
            self.state,
            Phase2State::Start | Phase2State::SpiRequested | Phase2State::SpiAcquired
        ) && self.retries_left == 0
            && self.timer.is_none()
    }

    pub fn owns_spi(&self, protocol: ProtocolId, spi: &[u8]) -> bool {
        self.approval
            .as_ref()
            .map(|approval| {
                approval.protocols.iter().any(|approved| {
                    approved.protocol == protocol
                        && (approved.local_spi == spi || approved.peer_spi == spi)
                })
            })
            .unwrap_or(false)
    }

    pub fn approval(&self) -> Option<&Phase2Approval> {
        self.approval.as_ref()
    }

    // Timer ownership mirrors the phase-1 handle.

    pub fn arm_timer(&mut self, kind: TimerKind) -> u64 {
        self.timer_generation += 1;
        self.timer = Some(kind);
        self.timer_generation
    }

    pub fn cancel_timer(&mut self) {
        self.timer_generation += 1;
        self.timer = None;
    }

    pub fn active_timer(&self) -> Option<TimerKind> {
        self.timer
    }

    pub fn timer_is_current(&self, generation: u64) -> bool {
        self.timer.is_some() && self.timer_generation == generation
    }

    pub fn next_retransmission(&mut self) -> Option<Vec<u8>> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        self.last_sent.clone()
    }

    fn remember_sent(&mut self, data: &[u8], max_retries: u32) {
        self.last_sent = Some(data.to_vec());
        self.retries_left = max_retries;
    }

    fn pfs_group(&self) -> Option<super::crypto::DhGroup> {
        self.proposed
            .protocols
            .first()
            .and_then(|protocol| protocol.transforms.first())
            .and_then(|transform| transform.group)
    }

    // Issues SPI requests for every protocol in the proposal and suspends
    // until the store answers.
    pub fn request_spis(&mut self, sadb: &SadbHandle) -> Result<(), NegotiationError> {
        if self.state != Phase2State::Start && self.state != Phase2State::HashVerified {
            return Err(NegotiationError::new("Not ready to request SPIs"));
        }
        self.pending_spis = self.proposed.protocols.len();
        for protocol in &self.proposed.protocols {
            sadb.get_spi(
                self.sequence,
                protocol.protocol,
                self.remote_addr.ip(),
                self.local_addr.ip(),
            )
            .map_err(|_| NegotiationError::new("SA/SPD store request failed"))?;
        }
        self.state = Phase2State::SpiRequested;
        Ok(())
    }

    // Resume point for the store's asynchronous SPI reply. Once every
    // protocol has its SPI the first (or second) message goes out.
    pub fn spi_allocated(
        &mut self,
        phase1: &mut Phase1Session,
        protocol_id: ProtocolId,
        spi: &[u8],
        dest: &mut [u8],
    ) -> Result<Option<usize>, NegotiationError> {
        if self.state != Phase2State::SpiRequested {
            return Err(NegotiationError::new("No SPI request is pending"));
        }
        let mut filled = false;
        for protocol in self.proposed.protocols.iter_mut() {
            if protocol.protocol == protocol_id && protocol.spi.iter().all(|b| *b == 0) {
                protocol.spi = spi.to_vec();
                filled = true;
                break;
            }
        }
        if !filled {
            debug!("Ignoring SPI for protocol {} with no pending slot", protocol_id);
            return Ok(None);
        }
        self.pending_spis -= 1;
        if self.pending_spis > 0 {
            return Ok(None);
        }
        self.state = Phase2State::SpiAcquired;
        let length = match self.role {
            Role::Initiator => self.send_initiator_sa(phase1, dest)?,
            Role::Responder => self.send_responder_sa(phase1, dest)?,
        };
        Ok(Some(length))
    }

    // Quick Mode message 1: HASH(1), SA, Ni, [KE], [IDci, IDcr].
    fn send_initiator_sa(
        &mut self,
        phase1: &mut Phase1Session,
        dest: &mut [u8],
    ) -> Result<usize, NegotiationError> {
        let prf = self.auth_prf(phase1)?;
        let prf_length = prf.output_length();
        let mut writer = MessageWriter::new(dest)?;
        let cookies = phase1.cookies();
        writer.write_header(
            cookies.initiator,
            cookies.responder,
            super::message::ExchangeType::QUICK_MODE,
            Flags::NONE,
            self.message_id,
        )?;
        writer.write_payload(PayloadType::HASH, &vec![0u8; prf_length])?;
        let proposals_data = proposal::serialize_phase2(&self.proposed);
        writer.write_security_association_payload(&proposals_data)?;
        writer.write_payload(PayloadType::NONCE, &self.nonce_local)?;
        if let Some(group) = self.pfs_group() {
            let dh = DhTransformType::init(group)?;
            writer.write_payload(PayloadType::KEY_EXCHANGE, dh.read_public_key().as_slice())?;
            self.pfs = Some(dh);
        }
        self.write_selector_ids(phase1, &mut writer)?;
        self.patch_hash(&prf, &mut writer, prf_length, None);
        let length = self.seal(phase1, &mut writer)?;
        self.state = Phase2State::Msg1Sent;
        let max_retries = phase1.policy().retransmit.max_retries;
        self.remember_sent(&dest[..length], max_retries);
        Ok(length)
    }

    // Quick Mode message 2: HASH(2), SA, Nr, [KE], [IDci, IDcr].
    fn send_responder_sa(
        &mut self,
        phase1: &mut Phase1Session,
        dest: &mut [u8],
    ) -> Result<usize, NegotiationError> {
        let approval = self
            .approval
            .as_mut()
            .ok_or_else(|| NegotiationError::new("No approved phase 2 proposal"))?;
        // Our freshly allocated SPIs replace the zeroes in the approval.
        for (approved, protocol) in approval
            .protocols
            .iter_mut()
            .zip(self.proposed.protocols.iter())
        {
            approved.local_spi = protocol.spi.clone();
        }
        let reply = proposal::approval_to_sa_proposal(approval, true);
        let prf = self.auth_prf(phase1)?;
        let prf_length = prf.output_length();
        let mut writer = MessageWriter::new(dest)?;
        let cookies = phase1.cookies();
        writer.write_header(
            cookies.initiator,
            cookies.responder,
            super::message::ExchangeType::QUICK_MODE,
            Flags::NONE,
            self.message_id,
        )?;
        writer.write_payload(PayloadType::HASH, &vec![0u8; prf_length])?;
        let proposals_data = proposal::serialize_phase2(&reply);
        writer.write_security_association_payload(&proposals_data)?;
        writer.write_payload(PayloadType::NONCE, &self.nonce_local)?;
        if let Some(dh) = self.pfs.as_ref() {
            writer.write_payload(PayloadType::KEY_EXCHANGE, dh.read_public_key().as_slice())?;
        }
        self.write_selector_ids(phase1, &mut writer)?;
        let nonce_i = self.nonce_peer.clone();
        self.patch_hash(&prf, &mut writer, prf_length, Some(&nonce_i));
        let length = self.seal(phase1, &mut writer)?;
        self.state = Phase2State::Msg1Sent;
        let max_retries = phase1.policy().retransmit.max_retries;
        self.remember_sent(&dest[..length], max_retries);
        Ok(length)
    }

    fn write_selector_ids(
        &mut self,
        phase1: &Phase1Session,
        writer: &mut MessageWriter,
    ) -> Result<(), NegotiationError> {
        let policy = phase1
            .policy()
            .find_phase2_by_id(self.policy_id)
            .cloned()
            .ok_or_else(|| NegotiationError::new("Phase 2 policy disappeared"))?;
        // IDci describes the initiator's client, IDcr the responder's.
        let (first, second) = match self.role {
            Role::Initiator => (&policy.local, &policy.remote),
            Role::Responder => (&policy.remote, &policy.local),
        };
        self.sent_id_payloads.clear();
        for selector in [first, second] {
            let (id_type, data) = selector.to_identification();
            writer.write_identification_payload(id_type, 0, 0, &data)?;
            let mut body = Vec::with_capacity(4 + data.len());
            body.push(id_type.type_id());
            body.push(0);
            body.extend_from_slice(&[0, 0]);
            body.extend_from_slice(&data);
            self.sent_id_payloads.push(body);
        }
        Ok(())
    }

    fn auth_prf(&self, phase1: &Phase1Session) -> Result<Prf, NegotiationError> {
        let hash = phase1
            .hash_algorithm()
            .ok_or_else(|| NegotiationError::new("Phase 1 is not established"))?;
        let skeyid_a = phase1
            .skeyid_a()
            .ok_or_else(|| NegotiationError::new("Phase 1 keys are not derived"))?;
        Ok(Prf::init(hash, skeyid_a.as_slice())?)
    }

    fn keymat_prf(&self, phase1: &Phase1Session) -> Result<Prf, NegotiationError> {
        let hash = phase1
            .hash_algorithm()
            .ok_or_else(|| NegotiationError::new("Phase 1 is not established"))?;
        let skeyid_d = phase1
            .skeyid_d()
            .ok_or_else(|| NegotiationError::new("Phase 1 keys are not derived"))?;
        Ok(Prf::init(hash, skeyid_d.as_slice())?)
    }

    // Overwrites the leading hash payload in place once the rest of the
    // message is known.
    fn patch_hash(
        &self,
        prf: &Prf,
        writer: &mut MessageWriter,
        prf_length: usize,
        nonce_i: Option<&[u8]>,
    ) {
        let digest = {
            let data = writer.payloads_data();
            let rest = &data[4 + prf_length..];
            match nonce_i {
                Some(nonce_i) => hash2(prf, self.message_id, nonce_i, rest),
                None => hash1(prf, self.message_id, rest),
            }
        };
        let data = writer.payloads_data_mut();
        data[4..4 + prf_length].copy_from_slice(digest.as_slice());
    }

    fn seal(
        &mut self,
        phase1: &Phase1Session,
        writer: &mut MessageWriter,
    ) -> Result<usize, NegotiationError> {
        if self.iv.is_empty() {
            self.iv = phase1.message_iv(self.message_id)?;
        }
        let block_length = phase1.block_length();
        let body = writer.pad_message(block_length)?;
        phase1.encrypt_in_place(&self.iv, body)?;
        let padded_length = body.len();
        self.iv = body[padded_length - block_length..].to_vec();
        Ok(writer.complete_encrypted_message(padded_length))
    }

    fn decrypt_message(
        &mut self,
        phase1: &Phase1Session,
        msg: &InputMessage,
    ) -> Result<Vec<u8>, NegotiationError> {
        if !msg.read_flags()?.has(Flags::ENCRYPTION) {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_FLAGS,
                "Quick Mode message is not encrypted",
            ));
        }
        if self.iv.is_empty() {
            self.iv = phase1.message_iv(self.message_id)?;
        }
        let block_length = phase1.block_length();
        let body = msg.body();
        if body.is_empty() || body.len() % block_length != 0 {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::PAYLOAD_MALFORMED,
                "Encrypted body is not block-aligned",
            ));
        }
        let decrypted = phase1.decrypt(&self.iv, body)?;
        self.iv = body[body.len() - block_length..].to_vec();
        Ok(decrypted)
    }

    // Splits off and validates the mandatory leading hash payload, returning
    // the remaining payload chain.
    fn verify_leading_hash<'a>(
        &self,
        prf: &Prf,
        msg: &InputMessage,
        decrypted: &'a [u8],
        include_nonce_i: bool,
    ) -> Result<(u8, &'a [u8]), NegotiationError> {
        if msg.read_next_payload() != PayloadType::HASH.type_id() {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_HASH_INFORMATION,
                "Quick Mode message does not start with a hash payload",
            ));
        }
        if decrypted.len() < 4 {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::PAYLOAD_MALFORMED,
                "Truncated hash payload",
            ));
        }
        let next_payload = decrypted[0];
        let hash_length = u16::from_be_bytes([decrypted[2], decrypted[3]]) as usize;
        if hash_length < 4 || hash_length > decrypted.len() {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::PAYLOAD_MALFORMED,
                "Truncated hash payload",
            ));
        }
        let received_hash = &decrypted[4..hash_length];
        let rest_full = &decrypted[hash_length..];
        let rest = &rest_full[..payloads_span(next_payload, rest_full)];
        let expected = if include_nonce_i {
            let nonce_i = match self.role {
                Role::Initiator => &self.nonce_local,
                Role::Responder => &self.nonce_peer,
            };
            hash2(prf, self.message_id, nonce_i, rest)
        } else {
            hash1(prf, self.message_id, rest)
        };
        if expected.as_slice() != received_hash {
            warn!(
                "Quick Mode hash mismatch from {} (message ID {:x})",
                self.remote_addr, self.message_id
            );
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_HASH_INFORMATION,
                "Quick Mode hash mismatch",
            ));
        }
        Ok((next_payload, rest))
    }

    // Responder entry point: the peer's first Quick-Mode message.
    pub fn process_initial_message(
        &mut self,
        phase1: &mut Phase1Session,
        msg: &InputMessage,
        sadb: &SadbHandle,
    ) -> Result<Phase2Action, NegotiationError> {
        if self.role != Role::Responder || self.state != Phase2State::Start {
            return Err(NegotiationError::new("Message not valid in current state"));
        }
        let decrypted = self.decrypt_message(phase1, msg)?;
        let prf = self.auth_prf(phase1)?;
        let (next_payload, rest) = self.verify_leading_hash(&prf, msg, &decrypted, false)?;
        if msg.read_flags()?.has(Flags::COMMIT) {
            debug!("Peer {} requested commit-bit processing", self.remote_addr);
        }
        let mut peer_proposals = None;
        let mut nonce = None;
        let mut pfs_public = None;
        let mut peer_ids = vec![];
        for payload in PayloadIter::new(next_payload, rest) {
            match payload? {
                Payload::SecurityAssociation(sa) => {
                    peer_proposals = Some(proposal::parse_phase2(&sa)?)
                }
                Payload::Nonce(data) => nonce = Some(data.to_vec()),
                Payload::KeyExchange(data) => pfs_public = Some(data.to_vec()),
                Payload::Identification(id) => {
                    let mut body = Vec::with_capacity(4 + id.raw_value().len());
                    body.push(id.id_type().type_id());
                    body.push(id.protocol());
                    body.extend_from_slice(&id.port().to_be_bytes());
                    body.extend_from_slice(id.raw_value());
                    peer_ids.push(body);
                }
                _ => {}
            }
        }
        let peer_proposals = peer_proposals.ok_or_else(|| {
            NegotiationError::Protocol(
                NotifyMessageType::PAYLOAD_MALFORMED,
                "Quick Mode message carries no SA payload",
            )
        })?;
        let nonce = nonce.ok_or_else(|| {
            NegotiationError::Protocol(NotifyMessageType::PAYLOAD_MALFORMED, "Missing nonce payload")
        })?;
        self.nonce_peer = nonce;
        let check_level = phase1.policy().check_level;
        let approval = proposal::match_phase2(&peer_proposals, &self.proposed, check_level)?;
        // ID payloads, when present, must describe exactly the selectors this
        // policy covers.
        if !peer_ids.is_empty() {
            let expected = self.expected_peer_ids(phase1)?;
            if peer_ids != expected {
                return Err(NegotiationError::Protocol(
                    NotifyMessageType::INVALID_ID_INFORMATION,
                    "Quick Mode ID payloads do not match policy selectors",
                ));
            }
        }
        if approval.group.is_some() {
            let pfs_public = pfs_public.ok_or_else(|| {
                NegotiationError::Protocol(
                    NotifyMessageType::INVALID_KEY_INFORMATION,
                    "PFS negotiated but no key exchange payload sent",
                )
            })?;
            let group = approval.group.ok_or_else(|| NegotiationError::new("No PFS group"))?;
            let dh = DhTransformType::init(group)?;
            self.pfs_shared = Some(dh.compute_shared_secret(&pfs_public)?);
            self.pfs_peer_public = Some(pfs_public);
            self.pfs = Some(dh);
        }
        self.approval = Some(approval);
        self.state = Phase2State::HashVerified;
        self.request_spis(sadb)?;
        Ok(Phase2Action::None)
    }

    // Initiator receives the responder's SA reply.
    pub fn process_sa_reply(
        &mut self,
        phase1: &mut Phase1Session,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase2Action, NegotiationError> {
        if self.role != Role::Initiator || self.state != Phase2State::Msg1Sent {
            return Err(NegotiationError::new("Message not valid in current state"));
        }
        let decrypted = self.decrypt_message(phase1, msg)?;
        let prf = self.auth_prf(phase1)?;
        let (next_payload, rest) = self.verify_leading_hash(&prf, msg, &decrypted, true)?;
        let commit_requested = msg.read_flags()?.has(Flags::COMMIT);
        let mut peer_proposals = None;
        let mut nonce = None;
        let mut pfs_public = None;
        let mut peer_ids = vec![];
        for payload in PayloadIter::new(next_payload, rest) {
            match payload? {
                Payload::SecurityAssociation(sa) => {
                    peer_proposals = Some(proposal::parse_phase2(&sa)?)
                }
                Payload::Nonce(data) => nonce = Some(data.to_vec()),
                Payload::KeyExchange(data) => pfs_public = Some(data.to_vec()),
                Payload::Identification(id) => {
                    let mut body = Vec::with_capacity(4 + id.raw_value().len());
                    body.push(id.id_type().type_id());
                    body.push(id.protocol());
                    body.extend_from_slice(&id.port().to_be_bytes());
                    body.extend_from_slice(id.raw_value());
                    peer_ids.push(body);
                }
                _ => {}
            }
        }
        let peer_proposals = peer_proposals.ok_or_else(|| {
            NegotiationError::Protocol(
                NotifyMessageType::PAYLOAD_MALFORMED,
                "Quick Mode reply carries no SA payload",
            )
        })?;
        let nonce = nonce.ok_or_else(|| {
            NegotiationError::Protocol(NotifyMessageType::PAYLOAD_MALFORMED, "Missing nonce payload")
        })?;
        self.nonce_peer = nonce;
        // Echoed IDs must match what was sent byte-for-byte.
        if !peer_ids.is_empty() && peer_ids != self.sent_id_payloads {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_ID_INFORMATION,
                "Quick Mode ID payloads were not echoed unchanged",
            ));
        }
        let check_level = phase1.policy().check_level;
        let mut approval = proposal::match_phase2(&peer_proposals, &self.proposed, check_level)?;
        // The matcher placed our proposal's SPIs in local_spi and the
        // responder's in peer_spi already; nothing to swap.
        if approval.group.is_some() {
            let pfs_public = pfs_public.ok_or_else(|| {
                NegotiationError::Protocol(
                    NotifyMessageType::INVALID_KEY_INFORMATION,
                    "PFS negotiated but no key exchange payload sent",
                )
            })?;
            let dh = self
                .pfs
                .as_ref()
                .ok_or_else(|| NegotiationError::new("PFS state is missing"))?;
            self.pfs_shared = Some(dh.compute_shared_secret(&pfs_public)?);
            self.pfs_peer_public = Some(pfs_public);
        }
        approval.responder_lifetime = false;
        self.approval = Some(approval);
        self.state = Phase2State::HashVerified;
        // HASH(3) closes the exchange.
        let mut writer = MessageWriter::new(dest)?;
        let cookies = phase1.cookies();
        writer.write_header(
            cookies.initiator,
            cookies.responder,
            super::message::ExchangeType::QUICK_MODE,
            Flags::NONE,
            self.message_id,
        )?;
        let digest = hash3(&prf, self.message_id, &self.nonce_local, &self.nonce_peer);
        writer.write_payload(PayloadType::HASH, digest.as_slice())?;
        let length = self.seal(phase1, &mut writer)?;
        let max_retries = phase1.policy().retransmit.max_retries;
        self.remember_sent(&dest[..length], max_retries);
        if commit_requested {
            self.state = Phase2State::CommitWait;
            return Ok(Phase2Action::Reply(length));
        }
        self.state = Phase2State::InstallingSa;
        let outputs = self.derive_install_outputs(phase1)?;
        self.state = Phase2State::Established;
        Ok(Phase2Action::Install {
            outputs,
            reply_length: length,
        })
    }

    // Responder receives HASH(3).
    pub fn process_final_hash(
        &mut self,
        phase1: &mut Phase1Session,
        msg: &InputMessage,
    ) -> Result<Phase2Action, NegotiationError> {
        if self.role != Role::Responder || self.state != Phase2State::Msg1Sent {
            return Err(NegotiationError::new("Message not valid in current state"));
        }
        let decrypted = self.decrypt_message(phase1, msg)?;
        let prf = self.auth_prf(phase1)?;
        if msg.read_next_payload() != PayloadType::HASH.type_id() || decrypted.len() < 4 {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_HASH_INFORMATION,
                "Final Quick Mode message does not start with a hash payload",
            ));
        }
        let hash_length = u16::from_be_bytes([decrypted[2], decrypted[3]]) as usize;
        if hash_length < 4 || hash_length > decrypted.len() {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::PAYLOAD_MALFORMED,
                "Truncated hash payload",
            ));
        }
        let received_hash = &decrypted[4..hash_length];
        let expected = hash3(&prf, self.message_id, &self.nonce_peer, &self.nonce_local);
        if expected.as_slice() != received_hash {
            warn!(
                "Quick Mode HASH(3) mismatch from {} (message ID {:x})",
                self.remote_addr, self.message_id
            );
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_HASH_INFORMATION,
                "Quick Mode hash mismatch",
            ));
        }
        self.state = Phase2State::InstallingSa;
        let outputs = self.derive_install_outputs(phase1)?;
        self.state = Phase2State::Established;
        Ok(Phase2Action::Install {
            outputs,
            reply_length: 0,
        })
    }

    // Called when the peer's CONNECTED notify releases a commit-bit wait.
    pub fn connected(
        &mut self,
        phase1: &mut Phase1Session,
    ) -> Result<Phase2Action, NegotiationError> {
        if self.state != Phase2State::CommitWait {
            return Err(NegotiationError::new("No commit wait is pending"));
        }
        self.state = Phase2State::InstallingSa;
        let outputs = self.derive_install_outputs(phase1)?;
        self.state = Phase2State::Established;
        Ok(Phase2Action::Install {
            outputs,
            reply_length: 0,
        })
    }

    fn expected_peer_ids(&self, phase1: &Phase1Session) -> Result<Vec<Vec<u8>>, NegotiationError> {
        let policy = phase1
            .policy()
            .find_phase2_by_id(self.policy_id)
            .cloned()
            .ok_or_else(|| NegotiationError::new("Phase 2 policy disappeared"))?;
        // The responder expects IDci = its remote selector, IDcr = its local.
        let mut expected = vec![];
        for selector in [&policy.remote, &policy.local] {
            let (id_type, data) = selector.to_identification();
            let mut body = Vec::with_capacity(4 + data.len());
            body.push(id_type.type_id());
            body.push(0);
            body.extend_from_slice(&[0, 0]);
            body.extend_from_slice(&data);
            expected.push(body);
        }
        Ok(expected)
    }

    // Derives per-protocol keying material for both directions and builds the
    // kernel install requests. Inbound SAs are keyed from the local SPI,
    // outbound from the peer's.
    fn derive_install_outputs(
        &mut self,
        phase1: &Phase1Session,
    ) -> Result<Vec<SaInstall>, NegotiationError> {
        let approval = self
            .approval
            .as_ref()
            .ok_or_else(|| NegotiationError::new("No approved phase 2 proposal"))?;
        let prf = self.keymat_prf(phase1)?;
        let pfs_shared = self.pfs_shared.as_ref().map(|shared| shared.as_slice());
        let (nonce_i, nonce_r) = match self.role {
            Role::Initiator => (&self.nonce_local, &self.nonce_peer),
            Role::Responder => (&self.nonce_peer, &self.nonce_local),
        };
        let mut outputs = Vec::with_capacity(approval.protocols.len() * 2);
        for protocol in &approval.protocols {
            let length = protocol_key_length(protocol);
            let inbound_keymat = derive_keymat(
                &prf,
                pfs_shared,
                protocol.protocol,
                &protocol.local_spi,
                nonce_i,
                nonce_r,
                length,
            );
            let outbound_keymat = derive_keymat(
                &prf,
                pfs_shared,
                protocol.protocol,
                &protocol.peer_spi,
                nonce_i,
                nonce_r,
                length,
            );
            outputs.push(SaInstall {
                protocol: protocol.protocol,
                spi: protocol.local_spi.clone(),
                transform_id: protocol.transform_id,
                auth: protocol.auth,
                encapsulation: protocol.encapsulation,
                src: self.remote_addr.ip(),
                dst: self.local_addr.ip(),
                keys: split_keys(protocol, &inbound_keymat),
                lifetime: approval.life,
            });
            outputs.push(SaInstall {
                protocol: protocol.protocol,
                spi: protocol.peer_spi.clone(),
                transform_id: protocol.transform_id,
                auth: protocol.auth,
                encapsulation: protocol.encapsulation,
                src: self.local_addr.ip(),
                dst: self.remote_addr.ip(),
                keys: split_keys(protocol, &outbound_keymat),
                lifetime: approval.life,
            });
        }
        Ok(outputs)
    }
}

fn random_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_LENGTH];
    rand::thread_rng().fill(nonce.as_mut_slice());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev1::crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm};
    use crate::ikev1::message::ExchangeType;
    use crate::ikev1::policy::{
        CheckLevel, Phase1Policy, PolicySnapshot, RetransmitConfig, Selector,
    };
    use crate::ikev1::proposal::{
        AuthAlgorithm, AuthenticationMethod, EncapsulationMode, IpsecTransform, IsakmpTransform,
        Lifetime, ProtocolProposal,
    };
    use crate::ikev1::sadb::SadbRequest;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn esp_policy() -> Phase2Policy {
        Phase2Policy {
            id: 1,
            local: Selector::host("192.0.2.1".parse().unwrap()),
            remote: Selector::host("192.0.2.2".parse().unwrap()),
            proposal: SaProposal {
                number: 1,
                protocols: vec![ProtocolProposal {
                    protocol: ProtocolId::ESP,
                    spi: vec![0, 0, 0, 0],
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
            },
            lifetime: Lifetime::seconds(3600),
        }
    }

    fn mirrored_policy(policy: &Phase2Policy) -> Phase2Policy {
        let mut mirrored = policy.clone();
        std::mem::swap(&mut mirrored.local, &mut mirrored.remote);
        mirrored
    }

    fn test_snapshot(phase2: Vec<Phase2Policy>) -> Arc<PolicySnapshot> {
        Arc::new(PolicySnapshot {
            version: 1,
            check_level: CheckLevel::Obey,
            phase1: Phase1Policy {
                exchange_types: vec![ExchangeType::IDENTITY_PROTECTION],
                candidates: vec![IsakmpTransform {
                    number: 1,
                    encryption: EncryptionAlgorithm::AES_CBC,
                    key_length: Some(128),
                    hash: HashAlgorithm::SHA2_256,
                    auth_method: AuthenticationMethod::PRE_SHARED_KEY,
                    group: DhGroup::MODP_1024,
                    life: Lifetime::seconds(28800),
                }],
                pre_shared_key: b"test preshared key".to_vec(),
                lifetime: Lifetime::seconds(28800),
                dpd: None,
            },
            phase2,
            retransmit: RetransmitConfig::default(),
        })
    }

    fn established_pair() -> (Phase1Session, Phase1Session) {
        let policy_i = test_snapshot(vec![esp_policy()]);
        let policy_r = test_snapshot(vec![mirrored_policy(&esp_policy())]);
        let mut initiator = Phase1Session::new_initiator(
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
            ExchangeType::IDENTITY_PROTECTION,
            policy_i,
        );
        let mut buf_a = [0u8; 4096];
        let mut buf_b = [0u8; 4096];
        let length = initiator.initiate(&mut buf_a).unwrap();
        let msg1 = buf_a[..length].to_vec();
        let msg = InputMessage::from_datagram(&msg1).unwrap();
        let mut responder = Phase1Session::new_responder(
            msg.read_initiator_cookie(),
            "192.0.2.2:500".parse().unwrap(),
            "192.0.2.1:500".parse().unwrap(),
            ExchangeType::IDENTITY_PROTECTION,
            policy_r,
        );
        let mut in_flight = msg1;
        let mut from_initiator = true;
        for _ in 0..8 {
            let msg = InputMessage::from_datagram(&in_flight).unwrap();
            let action = if from_initiator {
                responder.process_message(&msg, &mut buf_b).unwrap()
            } else {
                initiator.process_message(&msg, &mut buf_a).unwrap()
            };
            match action {
                crate::ikev1::phase1::Phase1Action::Reply(length)
                | crate::ikev1::phase1::Phase1Action::Established(length)
                    if length > 0 =>
                {
                    in_flight = if from_initiator {
                        buf_b[..length].to_vec()
                    } else {
                        buf_a[..length].to_vec()
                    };
                    from_initiator = !from_initiator;
                }
                _ => break,
            }
            if initiator.is_established() && responder.is_established() {
                break;
            }
        }
        assert!(initiator.is_established() && responder.is_established());
        (initiator, responder)
    }

    fn drain_spi(
        rx: &mut mpsc::Receiver<SadbRequest>,
        session: &mut Phase2Session,
        phase1: &mut Phase1Session,
        spi: &[u8],
        dest: &mut [u8],
    ) -> Option<usize> {
        match rx.try_recv().unwrap() {
            SadbRequest::GetSpi { protocol, .. } => session
                .spi_allocated(phase1, protocol, spi, dest)
                .unwrap(),
            _ => panic!("Expected a GetSpi request"),
        }
    }

    #[test]
    fn quick_mode_exchange_installs_matching_keys() {
        let (mut p1_i, mut p1_r) = established_pair();
        let (tx, mut rx) = mpsc::channel(16);
        let sadb = SadbHandle::new(tx);
        let policy_i = esp_policy();
        let policy_r = mirrored_policy(&policy_i);
        let mut qm_i = Phase2Session::new_initiator(1, &p1_i, &policy_i);
        let mut buf_a = [0u8; 4096];
        let mut buf_b = [0u8; 4096];
        qm_i.request_spis(&sadb).unwrap();
        let length = drain_spi(&mut rx, &mut qm_i, &mut p1_i, &[0x11, 0x11, 0x11, 0x11], &mut buf_a)
            .expect("first Quick Mode message");
        assert_eq!(qm_i.state(), Phase2State::Msg1Sent);
        // Responder processes message 1 and suspends on SPI allocation.
        let msg1 = buf_a[..length].to_vec();
        let msg = InputMessage::from_datagram(&msg1).unwrap();
        let mut qm_r = Phase2Session::new_responder(2, &p1_r, msg.read_message_id(), &policy_r);
        match qm_r.process_initial_message(&mut p1_r, &msg, &sadb).unwrap() {
            Phase2Action::None => {}
            _ => panic!("Responder should suspend on SPI allocation"),
        }
        assert_eq!(qm_r.state(), Phase2State::SpiRequested);
        let length = drain_spi(&mut rx, &mut qm_r, &mut p1_r, &[0x22, 0x22, 0x22, 0x22], &mut buf_b)
            .expect("second Quick Mode message");
        // Initiator verifies HASH(2), sends HASH(3) and derives keys.
        let msg2 = buf_b[..length].to_vec();
        let msg = InputMessage::from_datagram(&msg2).unwrap();
        let (outputs_i, reply_length) =
            match qm_i.process_sa_reply(&mut p1_i, &msg, &mut buf_a).unwrap() {
                Phase2Action::Install {
                    outputs,
                    reply_length,
                } => (outputs, reply_length),
                _ => panic!("Initiator should derive keys"),
            };
        assert!(qm_i.is_established());
        assert!(reply_length > 0);
        // Responder verifies HASH(3) and derives the same keys.
        let msg3 = buf_a[..reply_length].to_vec();
        let msg = InputMessage::from_datagram(&msg3).unwrap();
        let outputs_r = match qm_r.process_final_hash(&mut p1_r, &msg).unwrap() {
            Phase2Action::Install { outputs, .. } => outputs,
            _ => panic!("Responder should derive keys"),
        };
        assert!(qm_r.is_established());
        assert_eq!(outputs_i.len(), 2);
        assert_eq!(outputs_r.len(), 2);
        // The initiator's inbound SA is the responder's outbound SA.
        let inbound_i = outputs_i
            .iter()
            .find(|output| output.spi == vec![0x11, 0x11, 0x11, 0x11])
            .unwrap();
        let outbound_r = outputs_r
            .iter()
            .find(|output| output.spi == vec![0x11, 0x11, 0x11, 0x11])
            .unwrap();
        assert_eq!(
            inbound_i.keys.encryption_key,
            outbound_r.keys.encryption_key
        );
        assert_eq!(
            inbound_i.keys.authentication_key,
            outbound_r.keys.authentication_key
        );
        // AES-128 + HMAC-SHA1.
        assert_eq!(inbound_i.keys.encryption_key.len(), 16);
        assert_eq!(inbound_i.keys.authentication_key.len(), 20);
        // Opposite direction as well.
        let outbound_i = outputs_i
            .iter()
            .find(|output| output.spi == vec![0x22, 0x22, 0x22, 0x22])
            .unwrap();
        let inbound_r = outputs_r
            .iter()
            .find(|output| output.spi == vec![0x22, 0x22, 0x22, 0x22])
            .unwrap();
        assert_eq!(
            outbound_i.keys.encryption_key,
            inbound_r.keys.encryption_key
        );
    }

    #[test]
    fn keymat_covers_requested_length_deterministically() {
        let prf = Prf::init(HashAlgorithm::SHA1, b"skeyid_d material").unwrap();
        let keymat = derive_keymat(
            &prf,
            None,
            ProtocolId::ESP,
            &[1, 2, 3, 4],
            &[5u8; 16],
            &[6u8; 16],
            36,
        );
        assert_eq!(keymat.len(), 36);
        let again = derive_keymat(
            &prf,
            None,
            ProtocolId::ESP,
            &[1, 2, 3, 4],
            &[5u8; 16],
            &[6u8; 16],
            36,
        );
        assert_eq!(keymat.as_slice(), again.as_slice());
        // A different SPI must change the material.
        let other = derive_keymat(
            &prf,
            None,
            ProtocolId::ESP,
            &[9, 9, 9, 9],
            &[5u8; 16],
            &[6u8; 16],
            36,
        );
        assert_ne!(keymat.as_slice(), other.as_slice());
    }

    #[test]
    fn stalled_detection_requires_empty_budget_and_no_timer() {
        let (p1_i, _) = established_pair();
        let policy = esp_policy();
        let mut session = Phase2Session::new_initiator(1, &p1_i, &policy);
        assert!(!session.is_stalled());
        session.retries_left = 0;
        assert!(session.is_stalled());
        session.arm_timer(TimerKind::Retransmit);
        assert!(!session.is_stalled());
    }

    #[test]
    fn hash_helpers_are_sensitive_to_every_byte() {
        let prf = Prf::init(HashAlgorithm::SHA2_256, b"skeyid_a material").unwrap();
        let rest = [7u8; 40];
        let baseline = hash1(&prf, 0x1234, &rest);
        assert_eq!(baseline.as_slice(), hash1(&prf, 0x1234, &rest).as_slice());
        let mut mutated = rest;
        for i in 0..mutated.len() {
            mutated[i] ^= 0x80;
            assert_ne!(
                baseline.as_slice(),
                hash1(&prf, 0x1234, &mutated).as_slice()
            );
            mutated[i] ^= 0x80;
        }
        assert_ne!(baseline.as_slice(), hash1(&prf, 0x1235, &rest).as_slice());
    }
}
