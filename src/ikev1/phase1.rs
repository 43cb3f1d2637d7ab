use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{error, fmt};

use log::{debug, warn};
use rand::Rng;

use super::crypto::{
    Array, Cipher, CryptoError, DhTransform, DhTransformType, HashAlgorithm, InitError,
    KeyMaterial, Prf, MAX_DH_KEY_LENGTH, MAX_PRF_OUTPUT_LENGTH,
};
use super::message::{
    ExchangeType, Flags, FormatError, IdentificationType, InputMessage, MessageWriter,
    NotEnoughSpaceError, NotifyMessageType, Payload, PayloadIdentification, PayloadIter,
    PayloadType,
};
use super::policy::{PolicySnapshot, Selector};
use super::proposal::{
    self, AuthenticationMethod, IsakmpProposal, Phase1Approval, ProposalError,
};

// RFC 3706 DPD capability Vendor ID (without the 2-byte version suffix).
pub const DPD_VENDOR_ID: [u8; 16] = [
    0xaf, 0xca, 0xd7, 0x13, 0x68, 0xa1, 0xf1, 0xc9, 0x6b, 0x86, 0x96, 0xfc, 0x77, 0x57, 0x01,
    0x00,
];

const NONCE_LENGTH: usize = 16;
const MIN_NONCE_LENGTH: usize = 8;
const MAX_NONCE_LENGTH: usize = 256;

const UDP_PROTOCOL: u8 = 17;
const IKE_PORT: u16 = 500;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Initiator => f.write_str("initiator"),
            Self::Responder => f.write_str("responder"),
        }
    }
}

// Negotiation progress; MsgN counts per-side rounds, so both sides walk the
// same chain at their own offsets.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase1State {
    Spawn,
    Start,
    Msg1Received,
    Msg1Sent,
    Msg2Received,
    Msg2Sent,
    Msg3Received,
    Msg3Sent,
    Msg4Received,
    Established,
    Expired,
}

impl fmt::Display for Phase1State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Spawn => "spawn",
            Self::Start => "start",
            Self::Msg1Received => "msg1-received",
            Self::Msg1Sent => "msg1-sent",
            Self::Msg2Received => "msg2-received",
            Self::Msg2Sent => "msg2-sent",
            Self::Msg3Received => "msg3-received",
            Self::Msg3Sent => "msg3-sent",
            Self::Msg4Received => "msg4-received",
            Self::Established => "established",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}

// The 16-byte negotiation index from the ISAKMP header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CookiePair {
    pub initiator: [u8; 8],
    pub responder: [u8; 8],
}

impl fmt::Display for CookiePair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:016x}:{:016x}",
            u64::from_be_bytes(self.initiator),
            u64::from_be_bytes(self.responder)
        )
    }
}

fn random_cookie() -> [u8; 8] {
    let mut cookie = [0u8; 8];
    // All-zero means "not yet assigned" on the wire; retry in the
    // astronomically unlikely case.
    while cookie == [0u8; 8] {
        rand::thread_rng().fill(&mut cookie);
    }
    cookie
}

fn random_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_LENGTH];
    rand::thread_rng().fill(nonce.as_mut_slice());
    nonce
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerKind {
    Retransmit,
    Expiry,
}

// SKEYID and its derivatives, plus the final cipher key.
pub struct KeyHierarchy {
    pub skeyid: KeyMaterial,
    pub skeyid_d: KeyMaterial,
    pub skeyid_a: KeyMaterial,
    pub skeyid_e: KeyMaterial,
    pub cipher_key: KeyMaterial,
}

// SKEYID per RFC 2409, Section 5: keyed over the nonces with the key source
// picked by the authentication method.
pub fn derive_skeyid(
    hash: HashAlgorithm,
    auth_method: AuthenticationMethod,
    pre_shared_key: &[u8],
    nonce_i: &[u8],
    nonce_r: &[u8],
    shared_secret: &[u8],
    cookies: &CookiePair,
) -> Result<KeyMaterial, InitError> {
    if auth_method.is_signature() {
        let prf = Prf::init(hash, &[nonce_i, nonce_r].concat())?;
        Ok(KeyMaterial::from_slice(
            prf.digest(&[shared_secret]).as_slice(),
        ))
    } else if auth_method.is_encryption() {
        let nonce_hash = hash
            .hash(&[nonce_i, nonce_r])
            .map_err(|_| InitError::new("Failed to hash nonces"))?;
        let prf = Prf::init(hash, nonce_hash.as_slice())?;
        Ok(KeyMaterial::from_slice(
            prf.digest(&[&cookies.initiator, &cookies.responder])
                .as_slice(),
        ))
    } else {
        let prf = Prf::init(hash, pre_shared_key)?;
        Ok(KeyMaterial::from_slice(
            prf.digest(&[nonce_i, nonce_r]).as_slice(),
        ))
    }
}

// SKEYID_d/a/e are chained PRF applications over the shared secret and both
// cookies with a trailing discriminator byte; the cipher key is expanded from
// SKEYID_e when one PRF block is not enough (K1 = prf(SKEYID_e, 0)).
pub fn derive_hierarchy(
    hash: HashAlgorithm,
    skeyid: KeyMaterial,
    shared_secret: &[u8],
    cookies: &CookiePair,
    cipher_key_length: usize,
) -> Result<KeyHierarchy, InitError> {
    let prf = Prf::init(hash, skeyid.as_slice())?;
    let skeyid_d = prf.digest(&[
        shared_secret,
        &cookies.initiator,
        &cookies.responder,
        &[0],
    ]);
    let skeyid_a = prf.digest(&[
        skeyid_d.as_slice(),
        shared_secret,
        &cookies.initiator,
        &cookies.responder,
        &[1],
    ]);
    let skeyid_e = prf.digest(&[
        skeyid_a.as_slice(),
        shared_secret,
        &cookies.initiator,
        &cookies.responder,
        &[2],
    ]);
    let cipher_key = if skeyid_e.len() >= cipher_key_length {
        KeyMaterial::from_slice(&skeyid_e.as_slice()[..cipher_key_length])
    } else {
        let expand_prf = Prf::init(hash, skeyid_e.as_slice())?;
        expand_prf.expand(&[&[0]], cipher_key_length)
    };
    Ok(KeyHierarchy {
        skeyid,
        skeyid_d: KeyMaterial::from_slice(skeyid_d.as_slice()),
        skeyid_a: KeyMaterial::from_slice(skeyid_a.as_slice()),
        skeyid_e: KeyMaterial::from_slice(skeyid_e.as_slice()),
        cipher_key,
    })
}

// HASH_I / HASH_R from RFC 2409, Section 5. The side whose hash is computed
// contributes its public value and cookie first; base mode omits the peer's
// public value, which is not yet known when the hash is sent.
#[allow(clippy::too_many_arguments)]
pub fn auth_hash(
    hash: HashAlgorithm,
    skeyid: &KeyMaterial,
    own_public: &[u8],
    peer_public: Option<&[u8]>,
    own_cookie: &[u8; 8],
    peer_cookie: &[u8; 8],
    sa_i_body: &[u8],
    id_body: &[u8],
) -> Result<Array<MAX_PRF_OUTPUT_LENGTH>, InitError> {
    let prf = Prf::init(hash, skeyid.as_slice())?;
    let digest = match peer_public {
        Some(peer_public) => prf.digest(&[
            own_public,
            peer_public,
            own_cookie,
            peer_cookie,
            sa_i_body,
            id_body,
        ]),
        None => prf.digest(&[own_public, own_cookie, peer_cookie, sa_i_body, id_body]),
    };
    Ok(digest)
}

fn identification_body(id: &PayloadIdentification) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + id.raw_value().len());
    body.push(id.id_type().type_id());
    body.push(id.protocol());
    body.extend_from_slice(&id.port().to_be_bytes());
    body.extend_from_slice(id.raw_value());
    body
}

fn local_identification(local_addr: &SocketAddr) -> (IdentificationType, Vec<u8>, Vec<u8>) {
    let (id_type, data) = Selector::host(local_addr.ip()).to_identification();
    let mut body = Vec::with_capacity(4 + data.len());
    body.push(id_type.type_id());
    body.push(UDP_PROTOCOL);
    body.extend_from_slice(&IKE_PORT.to_be_bytes());
    body.extend_from_slice(&data);
    (id_type, data, body)
}

pub enum Phase1Action {
    // Nothing further to send.
    None,
    // A reply of this length was written into the destination buffer.
    Reply(usize),
    // Negotiation completed; a final reply was written (length may be 0).
    Established(usize),
}

pub struct Phase1Session {
    cookies: CookiePair,
    role: Role,
    exchange_type: ExchangeType,
    state: Phase1State,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    policy: Arc<PolicySnapshot>,
    approval: Option<Phase1Approval>,
    dh: Option<DhTransformType>,
    peer_public: Option<Vec<u8>>,
    shared_secret: Option<Array<MAX_DH_KEY_LENGTH>>,
    nonce_i: Vec<u8>,
    nonce_r: Vec<u8>,
    sa_i_body: Vec<u8>,
    local_id_body: Vec<u8>,
    peer_id_body: Vec<u8>,
    keys: Option<KeyHierarchy>,
    cipher: Option<Cipher>,
    current_iv: Vec<u8>,
    peer_supports_dpd: bool,
    dpd_sequence: u32,
    dpd_failures: u32,
    last_sent: Option<Vec<u8>>,
    retries_left: u32,
    timer: Option<TimerKind>,
    timer_generation: u64,
    dependent_phase2: HashSet<u32>,
    created: Instant,
    established_at: Option<Instant>,
}

impl Phase1Session {
    pub fn new_initiator(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        exchange_type: ExchangeType,
        policy: Arc<PolicySnapshot>,
    ) -> Phase1Session {
        let cookies = CookiePair {
            initiator: random_cookie(),
            responder: [0u8; 8],
        };
        let retries_left = policy.retransmit.max_retries;
        Phase1Session {
            cookies,
            role: Role::Initiator,
            exchange_type,
            state: Phase1State::Start,
            local_addr,
            remote_addr,
            policy,
            approval: None,
            dh: None,
            peer_public: None,
            shared_secret: None,
            nonce_i: vec![],
            nonce_r: vec![],
            sa_i_body: vec![],
            local_id_body: vec![],
            peer_id_body: vec![],
            keys: None,
            cipher: None,
            current_iv: vec![],
            peer_supports_dpd: false,
            dpd_sequence: rand::thread_rng().gen(),
            dpd_failures: 0,
            last_sent: None,
            retries_left,
            timer: None,
            timer_generation: 0,
            dependent_phase2: HashSet::new(),
            created: Instant::now(),
            established_at: None,
        }
    }

    pub fn new_responder(
        initiator_cookie: [u8; 8],
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        exchange_type: ExchangeType,
        policy: Arc<PolicySnapshot>,
    ) -> Phase1Session {
        let cookies = CookiePair {
            initiator: initiator_cookie,
            responder: random_cookie(),
        };
        let retries_left = policy.retransmit.max_retries;
        Phase1Session {
            cookies,
            role: Role::Responder,
            exchange_type,
            state: Phase1State::Start,
            local_addr,
            remote_addr,
            policy,
            approval: None,
            dh: None,
            peer_public: None,
            shared_secret: None,
            nonce_i: vec![],
            nonce_r: vec![],
            sa_i_body: vec![],
            local_id_body: vec![],
            peer_id_body: vec![],
            keys: None,
            cipher: None,
            current_iv: vec![],
            peer_supports_dpd: false,
            dpd_sequence: rand::thread_rng().gen(),
            dpd_failures: 0,
            last_sent: None,
            retries_left,
            timer: None,
            timer_generation: 0,
            dependent_phase2: HashSet::new(),
            created: Instant::now(),
            established_at: None,
        }
    }

    pub fn cookies(&self) -> CookiePair {
        self.cookies
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> Phase1State {
        self.state
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_established(&self) -> bool {
        self.state == Phase1State::Established
    }

    pub fn is_expired(&self) -> bool {
        self.state == Phase1State::Expired
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn approval(&self) -> Option<&Phase1Approval> {
        self.approval.as_ref()
    }

    pub fn policy(&self) -> &Arc<PolicySnapshot> {
        &self.policy
    }

    pub fn policy_version(&self) -> u64 {
        self.policy.version
    }

    pub fn rebind_policy(&mut self, policy: Arc<PolicySnapshot>) {
        self.policy = policy;
    }

    pub fn peer_supports_dpd(&self) -> bool {
        self.peer_supports_dpd
    }

    pub fn expire(&mut self) {
        self.state = Phase1State::Expired;
        self.cancel_timer();
        self.keys = None;
        self.cipher = None;
        self.shared_secret = None;
        self.dh = None;
    }

    // A handle that never completed, has no retries left and nothing
    // scheduled was abandoned by both sides.
    pub fn is_stalled(&self) -> bool {
        !self.is_established()
            && !self.is_expired()
            && self.retries_left == 0
            && self.timer.is_none()
    }

    // Phase-2 ownership bookkeeping.

    pub fn add_dependent(&mut self, sequence: u32) {
        self.dependent_phase2.insert(sequence);
    }

    pub fn remove_dependent(&mut self, sequence: u32) {
        self.dependent_phase2.remove(&sequence);
    }

    pub fn dependents(&self) -> impl Iterator<Item = u32> + '_ {
        self.dependent_phase2.iter().copied()
    }

    pub fn dependent_count(&self) -> usize {
        self.dependent_phase2.len()
    }

    // Timer ownership: at most one timer is live per handle; arming a new one
    // invalidates whatever was scheduled before via the generation counter.

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

    // Returns the message to retransmit, or None when the retry budget is
    // exhausted and the handle should be expired.
    pub fn next_retransmission(&mut self) -> Option<Vec<u8>> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        self.last_sent.clone()
    }

    pub fn last_sent(&self) -> Option<&[u8]> {
        self.last_sent.as_deref()
    }

    // DPD probe state.

    pub fn next_dpd_sequence(&mut self) -> u32 {
        self.dpd_sequence = self.dpd_sequence.wrapping_add(1);
        self.dpd_failures += 1;
        self.dpd_sequence
    }

    pub fn dpd_acknowledged(&mut self, sequence: u32) -> bool {
        if sequence == self.dpd_sequence {
            self.dpd_failures = 0;
            true
        } else {
            false
        }
    }

    pub fn dpd_failures(&self) -> u32 {
        self.dpd_failures
    }

    // Crypto accessors for Quick Mode and informational exchanges.

    pub fn hash_algorithm(&self) -> Option<HashAlgorithm> {
        self.approval.as_ref().map(|approval| approval.hash)
    }

    pub fn skeyid_a(&self) -> Option<&KeyMaterial> {
        self.keys.as_ref().map(|keys| &keys.skeyid_a)
    }

    pub fn skeyid_d(&self) -> Option<&KeyMaterial> {
        self.keys.as_ref().map(|keys| &keys.skeyid_d)
    }

    pub fn cipher(&self) -> Option<&Cipher> {
        self.cipher.as_ref()
    }

    pub fn block_length(&self) -> usize {
        self.cipher
            .as_ref()
            .map(|cipher| cipher.block_length())
            .unwrap_or(16)
    }

    // Initial IV for an exchange running under this ISAKMP-SA, derived from
    // the phase-1 IV chain and the exchange's message id.
    pub fn message_iv(&self, message_id: u32) -> Result<Vec<u8>, NegotiationError> {
        let approval = self
            .approval
            .as_ref()
            .ok_or_else(|| NegotiationError::new("No approved phase 1 algorithms"))?;
        let digest = approval
            .hash
            .hash(&[&self.current_iv, &message_id.to_be_bytes()])?;
        Ok(digest.as_slice()[..self.block_length()].to_vec())
    }

    pub fn encrypt_in_place(&self, iv: &[u8], data: &mut [u8]) -> Result<(), NegotiationError> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| NegotiationError::new("Encryption is not ready"))?;
        Ok(cipher.encrypt(iv, data)?)
    }

    pub fn decrypt(&self, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, NegotiationError> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| NegotiationError::new("Encryption is not ready"))?;
        let mut decrypted = data.to_vec();
        cipher.decrypt(iv, &mut decrypted)?;
        Ok(decrypted)
    }

    // Starts the negotiation as initiator, writing the first message.
    pub fn initiate(&mut self, dest: &mut [u8]) -> Result<usize, NegotiationError> {
        if self.role != Role::Initiator || self.state != Phase1State::Start {
            return Err(NegotiationError::new("Not ready to initiate"));
        }
        if !self.policy.phase1.allows_exchange(self.exchange_type) {
            return Err(NegotiationError::new("Exchange type not allowed by policy"));
        }
        let length = match self.exchange_type {
            ExchangeType::IDENTITY_PROTECTION => self.send_main_sa(dest)?,
            ExchangeType::AGGRESSIVE => self.send_aggressive_first(dest)?,
            ExchangeType::BASE => self.send_base_first(dest)?,
            _ => return Err(NegotiationError::new("Unsupported exchange type")),
        };
        self.state = Phase1State::Msg1Sent;
        self.remember_sent(&dest[..length]);
        Ok(length)
    }

    // Dispatches an inbound phase-1 message. An invalid message for the
    // current state and side fails without touching the state.
    pub fn process_message(
        &mut self,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase1Action, NegotiationError> {
        if msg.read_exchange_type()? != self.exchange_type {
            return Err(NegotiationError::new("Exchange type mismatch"));
        }
        match (self.exchange_type, self.role, self.state) {
            (ExchangeType::IDENTITY_PROTECTION, Role::Responder, Phase1State::Start) => {
                self.main_responder_recv_sa(msg, dest)
            }
            (ExchangeType::IDENTITY_PROTECTION, Role::Initiator, Phase1State::Msg1Sent) => {
                self.main_initiator_recv_sa(msg, dest)
            }
            (ExchangeType::IDENTITY_PROTECTION, Role::Responder, Phase1State::Msg1Sent) => {
                self.main_responder_recv_ke(msg, dest)
            }
            (ExchangeType::IDENTITY_PROTECTION, Role::Initiator, Phase1State::Msg2Sent) => {
                self.main_initiator_recv_ke(msg, dest)
            }
            (ExchangeType::IDENTITY_PROTECTION, Role::Responder, Phase1State::Msg2Sent) => {
                self.main_responder_recv_id(msg, dest)
            }
            (ExchangeType::IDENTITY_PROTECTION, Role::Initiator, Phase1State::Msg3Sent) => {
                self.main_initiator_recv_id(msg)
            }
            (ExchangeType::AGGRESSIVE, Role::Responder, Phase1State::Start) => {
                self.aggressive_responder_recv_first(msg, dest)
            }
            (ExchangeType::AGGRESSIVE, Role::Initiator, Phase1State::Msg1Sent) => {
                self.aggressive_initiator_recv_reply(msg, dest)
            }
            (ExchangeType::AGGRESSIVE, Role::Responder, Phase1State::Msg1Sent) => {
                self.aggressive_responder_recv_hash(msg)
            }
            (ExchangeType::BASE, Role::Responder, Phase1State::Start) => {
                self.base_responder_recv_first(msg, dest)
            }
            (ExchangeType::BASE, Role::Initiator, Phase1State::Msg1Sent) => {
                self.base_initiator_recv_reply(msg, dest)
            }
            (ExchangeType::BASE, Role::Responder, Phase1State::Msg1Sent) => {
                self.base_responder_recv_ke(msg, dest)
            }
            (ExchangeType::BASE, Role::Initiator, Phase1State::Msg2Sent) => {
                self.base_initiator_recv_ke(msg)
            }
            (exchange_type, role, state) => {
                debug!(
                    "Unexpected {} message for {:?} in state {}",
                    exchange_type, role, state
                );
                Err(NegotiationError::new("Message not valid in current state"))
            }
        }
    }

    fn remember_sent(&mut self, data: &[u8]) {
        self.last_sent = Some(data.to_vec());
        self.retries_left = self.policy.retransmit.max_retries;
    }

    fn local_candidates(&self) -> Vec<proposal::IsakmpTransform> {
        let mut candidates = self.policy.phase1.candidates.clone();
        for candidate in candidates.iter_mut() {
            if candidate.life.seconds.is_none() {
                candidate.life = self.policy.phase1.lifetime;
            }
        }
        candidates
    }

    fn collect_payloads<'a>(
        &mut self,
        iter: PayloadIter<'a>,
    ) -> Result<Vec<Payload<'a>>, NegotiationError> {
        let mut payloads = vec![];
        for payload in iter {
            let payload = payload?;
            if let Payload::VendorId(data) = &payload {
                if data.len() >= DPD_VENDOR_ID.len() && data[..16] == DPD_VENDOR_ID {
                    debug!("Peer {} announced DPD support", self.remote_addr);
                    self.peer_supports_dpd = true;
                }
            }
            // Certificates play no part in pre-shared-key authentication.
            if let Payload::Certificate(cert) | Payload::CertificateRequest(cert) = &payload {
                debug!(
                    "Ignoring {} certificate payload from {}",
                    cert.encoding(),
                    self.remote_addr
                );
                continue;
            }
            payloads.push(payload);
        }
        Ok(payloads)
    }

    fn sa_body_from_payload(sa: &super::message::PayloadSecurityAssociation) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + sa.proposals_data().len());
        body.extend_from_slice(&sa.doi().to_be_bytes());
        body.extend_from_slice(&sa.situation().to_be_bytes());
        body.extend_from_slice(sa.proposals_data());
        body
    }

    fn init_dh(&mut self) -> Result<(), NegotiationError> {
        let group = match self.approval.as_ref() {
            Some(approval) => approval.group,
            None => return Err(NegotiationError::new("No approved phase 1 algorithms")),
        };
        self.dh = Some(DhTransformType::init(group)?);
        Ok(())
    }

    fn compute_shared_secret(&mut self) -> Result<(), NegotiationError> {
        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| NegotiationError::new("DH is not initialized"))?;
        let peer_public = self
            .peer_public
            .as_ref()
            .ok_or_else(|| NegotiationError::new("Peer public key is missing"))?;
        if peer_public.len() != dh.key_length_bytes() {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_KEY_INFORMATION,
                "Peer public key has an invalid length",
            ));
        }
        self.shared_secret = Some(dh.compute_shared_secret(peer_public)?);
        Ok(())
    }

    fn validate_nonce(nonce: &[u8]) -> Result<(), NegotiationError> {
        if nonce.len() < MIN_NONCE_LENGTH || nonce.len() > MAX_NONCE_LENGTH {
            Err(NegotiationError::Protocol(
                NotifyMessageType::PAYLOAD_MALFORMED,
                "Nonce length is out of range",
            ))
        } else {
            Ok(())
        }
    }

    // Derives the full key hierarchy and primes the phase-1 IV chain.
    fn derive_keys(&mut self) -> Result<(), NegotiationError> {
        let approval = self
            .approval
            .as_ref()
            .ok_or_else(|| NegotiationError::new("No approved phase 1 algorithms"))?;
        let shared_secret = self
            .shared_secret
            .as_ref()
            .ok_or_else(|| NegotiationError::new("Shared secret is missing"))?;
        let skeyid = derive_skeyid(
            approval.hash,
            approval.auth_method,
            &self.policy.phase1.pre_shared_key,
            &self.nonce_i,
            &self.nonce_r,
            shared_secret.as_slice(),
            &self.cookies,
        )?;
        let key_length = approval
            .key_length
            .or_else(|| approval.encryption.default_key_length())
            .unwrap_or(128) as usize
            / 8;
        let keys = derive_hierarchy(
            approval.hash,
            skeyid,
            shared_secret.as_slice(),
            &self.cookies,
            key_length,
        )?;
        let cipher = Cipher::init(
            approval.encryption,
            approval.key_length,
            keys.cipher_key.as_slice(),
        )?;
        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| NegotiationError::new("DH is not initialized"))?;
        let peer_public = self
            .peer_public
            .as_ref()
            .ok_or_else(|| NegotiationError::new("Peer public key is missing"))?;
        let own_public = dh.read_public_key();
        let iv_seed = match self.role {
            Role::Initiator => [own_public.as_slice(), peer_public.as_slice()],
            Role::Responder => [peer_public.as_slice(), own_public.as_slice()],
        };
        let iv = approval.hash.hash(&iv_seed)?;
        self.current_iv = iv.as_slice()[..cipher.block_length()].to_vec();
        self.cipher = Some(cipher);
        self.keys = Some(keys);
        Ok(())
    }

    fn own_auth_hash(
        &self,
        include_peer_public: bool,
    ) -> Result<Array<MAX_PRF_OUTPUT_LENGTH>, NegotiationError> {
        self.side_auth_hash(self.role, &self.local_id_body, include_peer_public)
    }

    fn peer_auth_hash(
        &self,
        include_peer_public: bool,
    ) -> Result<Array<MAX_PRF_OUTPUT_LENGTH>, NegotiationError> {
        let peer_role = match self.role {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        };
        self.side_auth_hash(peer_role, &self.peer_id_body, include_peer_public)
    }

    fn side_auth_hash(
        &self,
        side: Role,
        id_body: &[u8],
        include_other_public: bool,
    ) -> Result<Array<MAX_PRF_OUTPUT_LENGTH>, NegotiationError> {
        let approval = self
            .approval
            .as_ref()
            .ok_or_else(|| NegotiationError::new("No approved phase 1 algorithms"))?;
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| NegotiationError::new("Keys are not derived"))?;
        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| NegotiationError::new("DH is not initialized"))?;
        let peer_public = self
            .peer_public
            .as_ref()
            .ok_or_else(|| NegotiationError::new("Peer public key is missing"))?;
        let own_public = dh.read_public_key();
        // The side whose hash this is contributes its values first.
        let (first_public, second_public, first_cookie, second_cookie) = if side == self.role {
            (
                own_public.as_slice(),
                peer_public.as_slice(),
                self.own_cookie(),
                self.peer_cookie(),
            )
        } else {
            (
                peer_public.as_slice(),
                own_public.as_slice(),
                self.peer_cookie(),
                self.own_cookie(),
            )
        };
        Ok(auth_hash(
            approval.hash,
            &keys.skeyid,
            first_public,
            if include_other_public {
                Some(second_public)
            } else {
                None
            },
            first_cookie,
            second_cookie,
            &self.sa_i_body,
            id_body,
        )?)
    }

    fn own_cookie(&self) -> &[u8; 8] {
        match self.role {
            Role::Initiator => &self.cookies.initiator,
            Role::Responder => &self.cookies.responder,
        }
    }

    fn peer_cookie(&self) -> &[u8; 8] {
        match self.role {
            Role::Initiator => &self.cookies.responder,
            Role::Responder => &self.cookies.initiator,
        }
    }

    fn verify_auth(&mut self, received_hash: &[u8], include_peer_public: bool) -> Result<(), NegotiationError> {
        let approval = self
            .approval
            .as_ref()
            .ok_or_else(|| NegotiationError::new("No approved phase 1 algorithms"))?;
        if approval.auth_method != AuthenticationMethod::PRE_SHARED_KEY {
            // Signature and encryption methods delegate to a certificate
            // verifier this build does not carry.
            return Err(NegotiationError::Protocol(
                NotifyMessageType::AUTHENTICATION_FAILED,
                "Unsupported authentication method",
            ));
        }
        let expected = self.peer_auth_hash(include_peer_public)?;
        if expected.as_slice() != received_hash {
            warn!(
                "Authentication hash mismatch from {} in state {}",
                self.remote_addr, self.state
            );
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_HASH_INFORMATION,
                "Authentication hash mismatch",
            ));
        }
        Ok(())
    }

    fn write_vendor_id(writer: &mut MessageWriter) -> Result<(), NotEnoughSpaceError> {
        writer.write_payload(PayloadType::VENDOR_ID, &DPD_VENDOR_ID)
    }

    fn write_local_identification(
        &mut self,
        writer: &mut MessageWriter,
    ) -> Result<(), NegotiationError> {
        let (id_type, data, body) = local_identification(&self.local_addr);
        writer.write_identification_payload(id_type, UDP_PROTOCOL, IKE_PORT, &data)?;
        self.local_id_body = body;
        Ok(())
    }

    // Main mode, message 1: initiator offers its full candidate set.
    fn send_main_sa(&mut self, dest: &mut [u8]) -> Result<usize, NegotiationError> {
        let candidates = self.local_candidates();
        let offer = IsakmpProposal {
            number: 1,
            transforms: candidates
                .into_iter()
                .enumerate()
                .map(|(i, mut transform)| {
                    transform.number = (i + 1) as u8;
                    transform
                })
                .collect(),
        };
        let proposals_data = proposal::serialize_phase1(&offer, &[]);
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        writer.write_security_association_payload(&proposals_data)?;
        Self::write_vendor_id(&mut writer)?;
        let mut sa_i_body = Vec::with_capacity(8 + proposals_data.len());
        sa_i_body.extend_from_slice(&super::message::DOI_IPSEC.to_be_bytes());
        sa_i_body.extend_from_slice(&super::message::SITUATION_IDENTITY_ONLY.to_be_bytes());
        sa_i_body.extend_from_slice(&proposals_data);
        self.sa_i_body = sa_i_body;
        Ok(writer.complete_message())
    }

    fn main_responder_recv_sa(
        &mut self,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase1Action, NegotiationError> {
        if !self.policy.phase1.allows_exchange(self.exchange_type) {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_EXCHANGE_TYPE,
                "Exchange type not allowed by policy",
            ));
        }
        let payloads = self.collect_payloads(msg.iter_payloads())?;
        let sa = payloads
            .iter()
            .find_map(|payload| match payload {
                Payload::SecurityAssociation(sa) => Some(sa),
                _ => None,
            })
            .ok_or_else(|| {
                NegotiationError::Protocol(
                    NotifyMessageType::PAYLOAD_MALFORMED,
                    "First message carries no SA payload",
                )
            })?;
        self.sa_i_body = Self::sa_body_from_payload(sa);
        let peer_proposals = proposal::parse_phase1(sa)?;
        let approval = proposal::match_phase1(
            &peer_proposals,
            &self.local_candidates(),
            self.policy.check_level,
        )?;
        self.state = Phase1State::Msg1Received;
        let selected = proposal::approval_to_isakmp_proposal(&approval);
        self.approval = Some(approval);
        let proposals_data = proposal::serialize_phase1(&selected, &[]);
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        writer.write_security_association_payload(&proposals_data)?;
        Self::write_vendor_id(&mut writer)?;
        let length = writer.complete_message();
        self.state = Phase1State::Msg1Sent;
        self.remember_sent(&dest[..length]);
        Ok(Phase1Action::Reply(length))
    }

    fn main_initiator_recv_sa(
        &mut self,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase1Action, NegotiationError> {
        self.cookies.responder = msg.read_responder_cookie();
        let payloads = self.collect_payloads(msg.iter_payloads())?;
        let sa = payloads
            .iter()
            .find_map(|payload| match payload {
                Payload::SecurityAssociation(sa) => Some(sa),
                _ => None,
            })
            .ok_or_else(|| {
                NegotiationError::Protocol(
                    NotifyMessageType::PAYLOAD_MALFORMED,
                    "Reply carries no SA payload",
                )
            })?;
        let peer_proposals = proposal::parse_phase1(sa)?;
        let approval = proposal::match_phase1(
            &peer_proposals,
            &self.local_candidates(),
            self.policy.check_level,
        )?;
        self.approval = Some(approval);
        self.state = Phase1State::Msg2Received;
        // Message 3: KE + Ni.
        self.init_dh()?;
        self.nonce_i = random_nonce();
        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| NegotiationError::new("DH is not initialized"))?;
        let public_key = dh.read_public_key();
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        writer.write_payload(PayloadType::KEY_EXCHANGE, public_key.as_slice())?;
        writer.write_payload(PayloadType::NONCE, &self.nonce_i)?;
        let length = writer.complete_message();
        self.state = Phase1State::Msg2Sent;
        self.remember_sent(&dest[..length]);
        Ok(Phase1Action::Reply(length))
    }

    fn main_responder_recv_ke(
        &mut self,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase1Action, NegotiationError> {
        let payloads = self.collect_payloads(msg.iter_payloads())?;
        let mut peer_public = None;
        let mut nonce = None;
        for payload in &payloads {
            match payload {
                Payload::KeyExchange(data) => peer_public = Some(data.to_vec()),
                Payload::Nonce(data) => nonce = Some(data.to_vec()),
                _ => {}
            }
        }
        let peer_public = peer_public.ok_or_else(|| {
            NegotiationError::Protocol(
                NotifyMessageType::PAYLOAD_MALFORMED,
                "Missing key exchange payload",
            )
        })?;
        let nonce = nonce.ok_or_else(|| {
            NegotiationError::Protocol(NotifyMessageType::PAYLOAD_MALFORMED, "Missing nonce payload")
        })?;
        Self::validate_nonce(&nonce)?;
        self.state = Phase1State::Msg2Received;
        self.nonce_i = nonce;
        self.nonce_r = random_nonce();
        self.init_dh()?;
        self.peer_public = Some(peer_public);
        self.compute_shared_secret()?;
        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| NegotiationError::new("DH is not initialized"))?;
        let public_key = dh.read_public_key();
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        writer.write_payload(PayloadType::KEY_EXCHANGE, public_key.as_slice())?;
        writer.write_payload(PayloadType::NONCE, &self.nonce_r)?;
        let length = writer.complete_message();
        self.derive_keys()?;
        self.state = Phase1State::Msg2Sent;
        self.remember_sent(&dest[..length]);
        Ok(Phase1Action::Reply(length))
    }

    fn main_initiator_recv_ke(
        &mut self,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase1Action, NegotiationError> {
        let payloads = self.collect_payloads(msg.iter_payloads())?;
        let mut peer_public = None;
        let mut nonce = None;
        for payload in &payloads {
            match payload {
                Payload::KeyExchange(data) => peer_public = Some(data.to_vec()),
                Payload::Nonce(data) => nonce = Some(data.to_vec()),
                _ => {}
            }
        }
        let peer_public = peer_public.ok_or_else(|| {
            NegotiationError::Protocol(
                NotifyMessageType::PAYLOAD_MALFORMED,
                "Missing key exchange payload",
            )
        })?;
        let nonce = nonce.ok_or_else(|| {
            NegotiationError::Protocol(NotifyMessageType::PAYLOAD_MALFORMED, "Missing nonce payload")
        })?;
        Self::validate_nonce(&nonce)?;
        self.state = Phase1State::Msg3Received;
        self.nonce_r = nonce;
        self.peer_public = Some(peer_public);
        self.compute_shared_secret()?;
        self.derive_keys()?;
        // Message 5: IDii + HASH_I, encrypted.
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        self.write_local_identification(&mut writer)?;
        let own_hash = self.own_auth_hash(true)?;
        writer.write_payload(PayloadType::HASH, own_hash.as_slice())?;
        let length = self.encrypt_phase1_message(&mut writer)?;
        self.state = Phase1State::Msg3Sent;
        self.remember_sent(&dest[..length]);
        Ok(Phase1Action::Reply(length))
    }

    fn main_responder_recv_id(
        &mut self,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase1Action, NegotiationError> {
        let decrypted = self.decrypt_phase1_message(msg)?;
        let (peer_id_body, received_hash) = Self::extract_id_hash(msg, &decrypted)?;
        self.peer_id_body = peer_id_body;
        self.verify_auth(&received_hash, true)?;
        self.state = Phase1State::Msg3Received;
        // Message 6: IDir + HASH_R, encrypted.
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        self.write_local_identification(&mut writer)?;
        let own_hash = self.own_auth_hash(true)?;
        writer.write_payload(PayloadType::HASH, own_hash.as_slice())?;
        let length = self.encrypt_phase1_message(&mut writer)?;
        self.state = Phase1State::Established;
        self.established_at = Some(Instant::now());
        self.remember_sent(&dest[..length]);
        Ok(Phase1Action::Established(length))
    }

    fn main_initiator_recv_id(
        &mut self,
        msg: &InputMessage,
    ) -> Result<Phase1Action, NegotiationError> {
        let decrypted = self.decrypt_phase1_message(msg)?;
        let (peer_id_body, received_hash) = Self::extract_id_hash(msg, &decrypted)?;
        self.peer_id_body = peer_id_body;
        self.verify_auth(&received_hash, true)?;
        self.state = Phase1State::Msg4Received;
        self.state = Phase1State::Established;
        self.established_at = Some(Instant::now());
        Ok(Phase1Action::Established(0))
    }

    // Aggressive mode, message 1: SA + KE + Ni + IDii. The DH group must be
    // committed upfront, so the first configured candidate decides it.
    fn send_aggressive_first(&mut self, dest: &mut [u8]) -> Result<usize, NegotiationError> {
        let candidates = self.local_candidates();
        let first_group = candidates
            .first()
            .map(|candidate| candidate.group)
            .ok_or_else(|| NegotiationError::new("No phase 1 candidates configured"))?;
        let offer = IsakmpProposal {
            number: 1,
            transforms: candidates
                .into_iter()
                .filter(|candidate| candidate.group == first_group)
                .enumerate()
                .map(|(i, mut transform)| {
                    transform.number = (i + 1) as u8;
                    transform
                })
                .collect(),
        };
        let proposals_data = proposal::serialize_phase1(&offer, &[]);
        self.dh = Some(DhTransformType::init(first_group)?);
        self.nonce_i = random_nonce();
        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| NegotiationError::new("DH is not initialized"))?;
        let public_key = dh.read_public_key();
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        writer.write_security_association_payload(&proposals_data)?;
        writer.write_payload(PayloadType::KEY_EXCHANGE, public_key.as_slice())?;
        writer.write_payload(PayloadType::NONCE, &self.nonce_i)?;
        self.write_local_identification(&mut writer)?;
        Self::write_vendor_id(&mut writer)?;
        let mut sa_i_body = Vec::with_capacity(8 + proposals_data.len());
        sa_i_body.extend_from_slice(&super::message::DOI_IPSEC.to_be_bytes());
        sa_i_body.extend_from_slice(&super::message::SITUATION_IDENTITY_ONLY.to_be_bytes());
        sa_i_body.extend_from_slice(&proposals_data);
        self.sa_i_body = sa_i_body;
        Ok(writer.complete_message())
    }

    fn aggressive_responder_recv_first(
        &mut self,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase1Action, NegotiationError> {
        if !self.policy.phase1.allows_exchange(self.exchange_type) {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_EXCHANGE_TYPE,
                "Exchange type not allowed by policy",
            ));
        }
        let payloads = self.collect_payloads(msg.iter_payloads())?;
        let mut sa_body = None;
        let mut peer_proposals = None;
        let mut peer_public = None;
        let mut nonce = None;
        let mut peer_id = None;
        for payload in &payloads {
            match payload {
                Payload::SecurityAssociation(sa) => {
                    sa_body = Some(Self::sa_body_from_payload(sa));
                    peer_proposals = Some(proposal::parse_phase1(sa)?);
                }
                Payload::KeyExchange(data) => peer_public = Some(data.to_vec()),
                Payload::Nonce(data) => nonce = Some(data.to_vec()),
                Payload::Identification(id) => peer_id = Some(identification_body(id)),
                _ => {}
            }
        }
        let (sa_body, peer_proposals, peer_public, nonce, peer_id) =
            match (sa_body, peer_proposals, peer_public, nonce, peer_id) {
                (Some(a), Some(b), Some(c), Some(d), Some(e)) => (a, b, c, d, e),
                _ => {
                    return Err(NegotiationError::Protocol(
                        NotifyMessageType::PAYLOAD_MALFORMED,
                        "Aggressive mode first message is incomplete",
                    ))
                }
            };
        Self::validate_nonce(&nonce)?;
        let approval = proposal::match_phase1(
            &peer_proposals,
            &self.local_candidates(),
            self.policy.check_level,
        )?;
        self.state = Phase1State::Msg1Received;
        self.sa_i_body = sa_body;
        self.nonce_i = nonce;
        self.peer_id_body = peer_id;
        let selected = proposal::approval_to_isakmp_proposal(&approval);
        self.approval = Some(approval);
        self.init_dh()?;
        self.peer_public = Some(peer_public);
        self.compute_shared_secret()?;
        self.nonce_r = random_nonce();
        self.derive_keys()?;
        let proposals_data = proposal::serialize_phase1(&selected, &[]);
        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| NegotiationError::new("DH is not initialized"))?;
        let public_key = dh.read_public_key();
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        writer.write_security_association_payload(&proposals_data)?;
        writer.write_payload(PayloadType::KEY_EXCHANGE, public_key.as_slice())?;
        writer.write_payload(PayloadType::NONCE, &self.nonce_r)?;
        self.write_local_identification(&mut writer)?;
        let own_hash = self.own_auth_hash(true)?;
        writer.write_payload(PayloadType::HASH, own_hash.as_slice())?;
        Self::write_vendor_id(&mut writer)?;
        let length = writer.complete_message();
        self.state = Phase1State::Msg1Sent;
        self.remember_sent(&dest[..length]);
        Ok(Phase1Action::Reply(length))
    }

    fn aggressive_initiator_recv_reply(
        &mut self,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase1Action, NegotiationError> {
        self.cookies.responder = msg.read_responder_cookie();
        let payloads = self.collect_payloads(msg.iter_payloads())?;
        let mut peer_proposals = None;
        let mut peer_public = None;
        let mut nonce = None;
        let mut peer_id = None;
        let mut received_hash = None;
        for payload in &payloads {
            match payload {
                Payload::SecurityAssociation(sa) => {
                    peer_proposals = Some(proposal::parse_phase1(sa)?)
                }
                Payload::KeyExchange(data) => peer_public = Some(data.to_vec()),
                Payload::Nonce(data) => nonce = Some(data.to_vec()),
                Payload::Identification(id) => peer_id = Some(identification_body(id)),
                Payload::Hash(data) => received_hash = Some(data.to_vec()),
                _ => {}
            }
        }
        let (peer_proposals, peer_public, nonce, peer_id, received_hash) =
            match (peer_proposals, peer_public, nonce, peer_id, received_hash) {
                (Some(a), Some(b), Some(c), Some(d), Some(e)) => (a, b, c, d, e),
                _ => {
                    return Err(NegotiationError::Protocol(
                        NotifyMessageType::PAYLOAD_MALFORMED,
                        "Aggressive mode reply is incomplete",
                    ))
                }
            };
        Self::validate_nonce(&nonce)?;
        let approval = proposal::match_phase1(
            &peer_proposals,
            &self.local_candidates(),
            self.policy.check_level,
        )?;
        self.approval = Some(approval);
        self.state = Phase1State::Msg2Received;
        self.nonce_r = nonce;
        self.peer_id_body = peer_id;
        self.peer_public = Some(peer_public);
        self.compute_shared_secret()?;
        self.derive_keys()?;
        self.verify_auth(&received_hash, true)?;
        // Message 3: HASH_I, in the clear.
        let own_hash = self.own_auth_hash(true)?;
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        writer.write_payload(PayloadType::HASH, own_hash.as_slice())?;
        let length = writer.complete_message();
        self.state = Phase1State::Established;
        self.established_at = Some(Instant::now());
        self.remember_sent(&dest[..length]);
        Ok(Phase1Action::Established(length))
    }

    fn aggressive_responder_recv_hash(
        &mut self,
        msg: &InputMessage,
    ) -> Result<Phase1Action, NegotiationError> {
        let payloads = self.collect_payloads(msg.iter_payloads())?;
        let received_hash = payloads
            .iter()
            .find_map(|payload| match payload {
                Payload::Hash(data) => Some(data.to_vec()),
                _ => None,
            })
            .ok_or_else(|| {
                NegotiationError::Protocol(
                    NotifyMessageType::PAYLOAD_MALFORMED,
                    "Missing hash payload",
                )
            })?;
        self.verify_auth(&received_hash, true)?;
        self.state = Phase1State::Msg2Received;
        self.state = Phase1State::Established;
        self.established_at = Some(Instant::now());
        Ok(Phase1Action::Established(0))
    }

    // Base mode, message 1: SA + IDii + Ni. Authentication hashes in base
    // mode cover only the sender's public value.
    fn send_base_first(&mut self, dest: &mut [u8]) -> Result<usize, NegotiationError> {
        let candidates = self.local_candidates();
        let offer = IsakmpProposal {
            number: 1,
            transforms: candidates
                .into_iter()
                .enumerate()
                .map(|(i, mut transform)| {
                    transform.number = (i + 1) as u8;
                    transform
                })
                .collect(),
        };
        let proposals_data = proposal::serialize_phase1(&offer, &[]);
        self.nonce_i = random_nonce();
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        writer.write_security_association_payload(&proposals_data)?;
        self.write_local_identification(&mut writer)?;
        writer.write_payload(PayloadType::NONCE, &self.nonce_i)?;
        Self::write_vendor_id(&mut writer)?;
        let mut sa_i_body = Vec::with_capacity(8 + proposals_data.len());
        sa_i_body.extend_from_slice(&super::message::DOI_IPSEC.to_be_bytes());
        sa_i_body.extend_from_slice(&super::message::SITUATION_IDENTITY_ONLY.to_be_bytes());
        sa_i_body.extend_from_slice(&proposals_data);
        self.sa_i_body = sa_i_body;
        Ok(writer.complete_message())
    }

    fn base_responder_recv_first(
        &mut self,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase1Action, NegotiationError> {
        if !self.policy.phase1.allows_exchange(self.exchange_type) {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_EXCHANGE_TYPE,
                "Exchange type not allowed by policy",
            ));
        }
        let payloads = self.collect_payloads(msg.iter_payloads())?;
        let mut sa_body = None;
        let mut peer_proposals = None;
        let mut nonce = None;
        let mut peer_id = None;
        for payload in &payloads {
            match payload {
                Payload::SecurityAssociation(sa) => {
                    sa_body = Some(Self::sa_body_from_payload(sa));
                    peer_proposals = Some(proposal::parse_phase1(sa)?);
                }
                Payload::Nonce(data) => nonce = Some(data.to_vec()),
                Payload::Identification(id) => peer_id = Some(identification_body(id)),
                _ => {}
            }
        }
        let (sa_body, peer_proposals, nonce, peer_id) =
            match (sa_body, peer_proposals, nonce, peer_id) {
                (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
                _ => {
                    return Err(NegotiationError::Protocol(
                        NotifyMessageType::PAYLOAD_MALFORMED,
                        "Base mode first message is incomplete",
                    ))
                }
            };
        Self::validate_nonce(&nonce)?;
        let approval = proposal::match_phase1(
            &peer_proposals,
            &self.local_candidates(),
            self.policy.check_level,
        )?;
        self.state = Phase1State::Msg1Received;
        self.sa_i_body = sa_body;
        self.nonce_i = nonce;
        self.peer_id_body = peer_id;
        let selected = proposal::approval_to_isakmp_proposal(&approval);
        self.approval = Some(approval);
        self.nonce_r = random_nonce();
        let proposals_data = proposal::serialize_phase1(&selected, &[]);
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        writer.write_security_association_payload(&proposals_data)?;
        self.write_local_identification(&mut writer)?;
        writer.write_payload(PayloadType::NONCE, &self.nonce_r)?;
        Self::write_vendor_id(&mut writer)?;
        let length = writer.complete_message();
        self.state = Phase1State::Msg1Sent;
        self.remember_sent(&dest[..length]);
        Ok(Phase1Action::Reply(length))
    }

    fn base_initiator_recv_reply(
        &mut self,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase1Action, NegotiationError> {
        self.cookies.responder = msg.read_responder_cookie();
        let payloads = self.collect_payloads(msg.iter_payloads())?;
        let mut peer_proposals = None;
        let mut nonce = None;
        let mut peer_id = None;
        for payload in &payloads {
            match payload {
                Payload::SecurityAssociation(sa) => {
                    peer_proposals = Some(proposal::parse_phase1(sa)?)
                }
                Payload::Nonce(data) => nonce = Some(data.to_vec()),
                Payload::Identification(id) => peer_id = Some(identification_body(id)),
                _ => {}
            }
        }
        let (peer_proposals, nonce, peer_id) = match (peer_proposals, nonce, peer_id) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => {
                return Err(NegotiationError::Protocol(
                    NotifyMessageType::PAYLOAD_MALFORMED,
                    "Base mode reply is incomplete",
                ))
            }
        };
        Self::validate_nonce(&nonce)?;
        let approval = proposal::match_phase1(
            &peer_proposals,
            &self.local_candidates(),
            self.policy.check_level,
        )?;
        self.approval = Some(approval);
        self.state = Phase1State::Msg2Received;
        self.nonce_r = nonce;
        self.peer_id_body = peer_id;
        // Message 3: KE + HASH_I. The peer's public value is unknown here, so
        // the hash covers only our own.
        self.init_dh()?;
        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| NegotiationError::new("DH is not initialized"))?;
        let public_key = dh.read_public_key();
        let approval = self
            .approval
            .as_ref()
            .ok_or_else(|| NegotiationError::new("No approved phase 1 algorithms"))?;
        let skeyid = derive_skeyid(
            approval.hash,
            approval.auth_method,
            &self.policy.phase1.pre_shared_key,
            &self.nonce_i,
            &self.nonce_r,
            &[],
            &self.cookies,
        )?;
        let own_hash = auth_hash(
            approval.hash,
            &skeyid,
            public_key.as_slice(),
            None,
            &self.cookies.initiator,
            &self.cookies.responder,
            &self.sa_i_body,
            &self.local_id_body,
        )?;
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        writer.write_payload(PayloadType::KEY_EXCHANGE, public_key.as_slice())?;
        writer.write_payload(PayloadType::HASH, own_hash.as_slice())?;
        let length = writer.complete_message();
        self.state = Phase1State::Msg2Sent;
        self.remember_sent(&dest[..length]);
        Ok(Phase1Action::Reply(length))
    }

    fn base_responder_recv_ke(
        &mut self,
        msg: &InputMessage,
        dest: &mut [u8],
    ) -> Result<Phase1Action, NegotiationError> {
        let payloads = self.collect_payloads(msg.iter_payloads())?;
        let mut peer_public = None;
        let mut received_hash = None;
        for payload in &payloads {
            match payload {
                Payload::KeyExchange(data) => peer_public = Some(data.to_vec()),
                Payload::Hash(data) => received_hash = Some(data.to_vec()),
                _ => {}
            }
        }
        let (peer_public, received_hash) = match (peer_public, received_hash) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(NegotiationError::Protocol(
                    NotifyMessageType::PAYLOAD_MALFORMED,
                    "Base mode key exchange message is incomplete",
                ))
            }
        };
        self.state = Phase1State::Msg2Received;
        self.init_dh()?;
        self.peer_public = Some(peer_public);
        self.compute_shared_secret()?;
        self.derive_keys()?;
        self.verify_auth(&received_hash, false)?;
        // Message 4: KE + HASH_R.
        let own_hash = self.own_auth_hash(false)?;
        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| NegotiationError::new("DH is not initialized"))?;
        let public_key = dh.read_public_key();
        let mut writer = MessageWriter::new(dest)?;
        writer.write_header(
            self.cookies.initiator,
            self.cookies.responder,
            self.exchange_type,
            Flags::NONE,
            0,
        )?;
        writer.write_payload(PayloadType::KEY_EXCHANGE, public_key.as_slice())?;
        writer.write_payload(PayloadType::HASH, own_hash.as_slice())?;
        let length = writer.complete_message();
        self.state = Phase1State::Established;
        self.established_at = Some(Instant::now());
        self.remember_sent(&dest[..length]);
        Ok(Phase1Action::Established(length))
    }

    fn base_initiator_recv_ke(
        &mut self,
        msg: &InputMessage,
    ) -> Result<Phase1Action, NegotiationError> {
        let payloads = self.collect_payloads(msg.iter_payloads())?;
        let mut peer_public = None;
        let mut received_hash = None;
        for payload in &payloads {
            match payload {
                Payload::KeyExchange(data) => peer_public = Some(data.to_vec()),
                Payload::Hash(data) => received_hash = Some(data.to_vec()),
                _ => {}
            }
        }
        let (peer_public, received_hash) = match (peer_public, received_hash) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(NegotiationError::Protocol(
                    NotifyMessageType::PAYLOAD_MALFORMED,
                    "Base mode key exchange message is incomplete",
                ))
            }
        };
        self.state = Phase1State::Msg3Received;
        self.peer_public = Some(peer_public);
        self.compute_shared_secret()?;
        self.derive_keys()?;
        self.verify_auth(&received_hash, false)?;
        self.state = Phase1State::Established;
        self.established_at = Some(Instant::now());
        Ok(Phase1Action::Established(0))
    }

    // Pads and encrypts the payloads written so far, producing the final
    // message; the IV chain advances to the last ciphertext block.
    fn encrypt_phase1_message(
        &mut self,
        writer: &mut MessageWriter,
    ) -> Result<usize, NegotiationError> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| NegotiationError::new("Encryption is not ready"))?;
        let block_length = cipher.block_length();
        let body = writer.pad_message(block_length)?;
        cipher.encrypt(&self.current_iv, body)?;
        let padded_length = body.len();
        self.current_iv = body[padded_length - block_length..].to_vec();
        Ok(writer.complete_encrypted_message(padded_length))
    }

    fn decrypt_phase1_message(&mut self, msg: &InputMessage) -> Result<Vec<u8>, NegotiationError> {
        if !msg.read_flags()?.has(Flags::ENCRYPTION) {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::INVALID_FLAGS,
                "Message is not encrypted",
            ));
        }
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| NegotiationError::new("Encryption is not ready"))?;
        let block_length = cipher.block_length();
        let body = msg.body();
        if body.is_empty() || body.len() % block_length != 0 {
            return Err(NegotiationError::Protocol(
                NotifyMessageType::PAYLOAD_MALFORMED,
                "Encrypted body is not block-aligned",
            ));
        }
        let mut decrypted = body.to_vec();
        cipher.decrypt(&self.current_iv, &mut decrypted)?;
        self.current_iv = body[body.len() - block_length..].to_vec();
        Ok(decrypted)
    }

    fn extract_id_hash(
        msg: &InputMessage,
        decrypted: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), NegotiationError> {
        let mut peer_id = None;
        let mut received_hash = None;
        for payload in PayloadIter::new(msg.read_next_payload(), decrypted) {
            match payload? {
                Payload::Identification(id) => peer_id = Some(identification_body(&id)),
                Payload::Hash(data) => received_hash = Some(data.to_vec()),
                _ => {}
            }
        }
        match (peer_id, received_hash) {
            (Some(id), Some(hash)) => Ok((id, hash)),
            _ => Err(NegotiationError::Protocol(
                NotifyMessageType::PAYLOAD_MALFORMED,
                "Missing identification or hash payload",
            )),
        }
    }
}

#[derive(Debug)]
pub enum NegotiationError {
    Internal(&'static str),
    // Failures reported to the peer with a specific notify code.
    Protocol(NotifyMessageType, &'static str),
    Format(FormatError),
    Proposal(ProposalError),
    Init(InitError),
    Crypto(CryptoError),
    NotEnoughSpace(NotEnoughSpaceError),
}

impl NegotiationError {
    pub fn new(msg: &'static str) -> NegotiationError {
        NegotiationError::Internal(msg)
    }

    // Notify code to report to the peer, when the failure has one.
    pub fn notify_type(&self) -> Option<NotifyMessageType> {
        match self {
            Self::Protocol(notify_type, _) => Some(*notify_type),
            Self::Proposal(err) => Some(err.notify_type()),
            Self::Format(_) => Some(NotifyMessageType::PAYLOAD_MALFORMED),
            _ => None,
        }
    }
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Protocol(notify_type, msg) => write!(f, "{} ({})", msg, notify_type),
            Self::Format(ref e) => write!(f, "Format error: {}", e),
            Self::Proposal(ref e) => write!(f, "Proposal error: {}", e),
            Self::Init(ref e) => write!(f, "Crypto init error: {}", e),
            Self::Crypto(ref e) => write!(f, "Crypto error: {}", e),
            Self::NotEnoughSpace(_) => write!(f, "Not enough space in output buffer"),
        }
    }
}

impl error::Error for NegotiationError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_) | Self::Protocol(_, _) => None,
            Self::Format(ref err) => Some(err),
            Self::Proposal(ref err) => Some(err),
            Self::Init(ref err) => Some(err),
            Self::Crypto(ref err) => Some(err),
            Self::NotEnoughSpace(ref err) => Some(err),
        }
    }
}

impl From<FormatError> for NegotiationError {
    fn from(err: FormatError) -> NegotiationError {
        NegotiationError::Format(err)
    }
}

impl From<ProposalError> for NegotiationError {
    fn from(err: ProposalError) -> NegotiationError {
        NegotiationError::Proposal(err)
    }
}

impl From<InitError> for NegotiationError {
    fn from(err: InitError) -> NegotiationError {
        NegotiationError::Init(err)
    }
}

impl From<CryptoError> for NegotiationError {
    fn from(err: CryptoError) -> NegotiationError {
        NegotiationError::Crypto(err)
    }
}

impl From<NotEnoughSpaceError> for NegotiationError {
    fn from(err: NotEnoughSpaceError) -> NegotiationError {
        NegotiationError::NotEnoughSpace(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev1::crypto::EncryptionAlgorithm;
    use crate::ikev1::policy::{
        CheckLevel, Phase1Policy, PolicySnapshot, RetransmitConfig,
    };
    use crate::ikev1::proposal::{IsakmpTransform, Lifetime};
    use crate::ikev1::crypto::DhGroup;

    fn test_policy() -> Arc<PolicySnapshot> {
        Arc::new(PolicySnapshot {
            version: 1,
            check_level: CheckLevel::Obey,
            phase1: Phase1Policy {
                exchange_types: vec![
                    ExchangeType::IDENTITY_PROTECTION,
                    ExchangeType::AGGRESSIVE,
                    ExchangeType::BASE,
                ],
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
            phase2: vec![],
            retransmit: RetransmitConfig::default(),
        })
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn run_handshake(exchange_type: ExchangeType) -> (Phase1Session, Phase1Session) {
        let policy = test_policy();
        let mut initiator = Phase1Session::new_initiator(
            addr("192.0.2.1:500"),
            addr("192.0.2.2:500"),
            exchange_type,
            policy.clone(),
        );
        let mut responder_slot: Option<Phase1Session> = None;
        let mut buf_a = [0u8; 4096];
        let mut buf_b = [0u8; 4096];
        let mut in_flight = {
            let length = initiator.initiate(&mut buf_a).unwrap();
            buf_a[..length].to_vec()
        };
        let mut from_initiator = true;
        for _ in 0..8 {
            let msg = InputMessage::from_datagram(&in_flight).unwrap();
            let action = if from_initiator {
                let responder = responder_slot.get_or_insert_with(|| {
                    Phase1Session::new_responder(
                        msg.read_initiator_cookie(),
                        addr("192.0.2.2:500"),
                        addr("192.0.2.1:500"),
                        exchange_type,
                        policy.clone(),
                    )
                });
                responder.process_message(&msg, &mut buf_b).unwrap()
            } else {
                initiator.process_message(&msg, &mut buf_a).unwrap()
            };
            let established_done = initiator.is_established()
                && responder_slot
                    .as_ref()
                    .map(|r| r.is_established())
                    .unwrap_or(false);
            match action {
                Phase1Action::Reply(length) | Phase1Action::Established(length) if length > 0 => {
                    in_flight = if from_initiator {
                        buf_b[..length].to_vec()
                    } else {
                        buf_a[..length].to_vec()
                    };
                    from_initiator = !from_initiator;
                }
                _ => break,
            }
            if established_done {
                break;
            }
        }
        (initiator, responder_slot.unwrap())
    }

    #[test]
    fn main_mode_handshake_establishes_both_sides() {
        let (initiator, responder) = run_handshake(ExchangeType::IDENTITY_PROTECTION);
        assert!(initiator.is_established());
        assert!(responder.is_established());
        let keys_i = initiator.keys.as_ref().unwrap();
        let keys_r = responder.keys.as_ref().unwrap();
        assert_eq!(keys_i.skeyid.as_slice(), keys_r.skeyid.as_slice());
        assert_eq!(keys_i.skeyid_d.as_slice(), keys_r.skeyid_d.as_slice());
        assert_eq!(keys_i.skeyid_a.as_slice(), keys_r.skeyid_a.as_slice());
        assert_eq!(keys_i.skeyid_e.as_slice(), keys_r.skeyid_e.as_slice());
        assert_eq!(keys_i.cipher_key.as_slice(), keys_r.cipher_key.as_slice());
        assert_eq!(initiator.current_iv, responder.current_iv);
    }

    #[test]
    fn aggressive_mode_handshake_establishes_both_sides() {
        let (initiator, responder) = run_handshake(ExchangeType::AGGRESSIVE);
        assert!(initiator.is_established());
        assert!(responder.is_established());
        let keys_i = initiator.keys.as_ref().unwrap();
        let keys_r = responder.keys.as_ref().unwrap();
        assert_eq!(keys_i.cipher_key.as_slice(), keys_r.cipher_key.as_slice());
    }

    #[test]
    fn base_mode_handshake_establishes_both_sides() {
        let (initiator, responder) = run_handshake(ExchangeType::BASE);
        assert!(initiator.is_established());
        assert!(responder.is_established());
        let keys_i = initiator.keys.as_ref().unwrap();
        let keys_r = responder.keys.as_ref().unwrap();
        assert_eq!(keys_i.cipher_key.as_slice(), keys_r.cipher_key.as_slice());
    }

    #[test]
    fn unexpected_message_leaves_state_unchanged() {
        let policy = test_policy();
        let mut responder = Phase1Session::new_responder(
            [7u8; 8],
            addr("192.0.2.2:500"),
            addr("192.0.2.1:500"),
            ExchangeType::IDENTITY_PROTECTION,
            policy,
        );
        // A bare KE+nonce message is only valid after the SA exchange.
        let mut buf = [0u8; 1024];
        let length = {
            let mut writer = MessageWriter::new(&mut buf).unwrap();
            writer
                .write_header(
                    [7u8; 8],
                    [0u8; 8],
                    ExchangeType::IDENTITY_PROTECTION,
                    Flags::NONE,
                    0,
                )
                .unwrap();
            writer
                .write_payload(PayloadType::NONCE, &[0u8; 16])
                .unwrap();
            writer.complete_message()
        };
        let msg = InputMessage::from_datagram(&buf[..length]).unwrap();
        let state_before = responder.state();
        let mut dest = [0u8; 1024];
        // Start state expects an SA payload; the malformed message must fail.
        assert!(responder.process_message(&msg, &mut dest).is_err());
        assert!(!responder.is_established());
        // Feed the same message again with the state forcibly advanced past
        // the valid window.
        responder.state = Phase1State::Msg2Sent;
        assert!(responder.process_message(&msg, &mut dest).is_err());
        assert_eq!(responder.state(), Phase1State::Msg2Sent);
        let _ = state_before;
    }

    #[test]
    fn skeyid_derivation_matches_between_methods() {
        let cookies = CookiePair {
            initiator: [1u8; 8],
            responder: [2u8; 8],
        };
        let psk_skeyid = derive_skeyid(
            HashAlgorithm::SHA1,
            AuthenticationMethod::PRE_SHARED_KEY,
            b"secret",
            &[3u8; 16],
            &[4u8; 16],
            &[5u8; 128],
            &cookies,
        )
        .unwrap();
        let sig_skeyid = derive_skeyid(
            HashAlgorithm::SHA1,
            AuthenticationMethod::RSA_SIGNATURE,
            b"secret",
            &[3u8; 16],
            &[4u8; 16],
            &[5u8; 128],
            &cookies,
        )
        .unwrap();
        assert_eq!(psk_skeyid.len(), 20);
        assert_eq!(sig_skeyid.len(), 20);
        // Different key sources must yield different base secrets.
        assert_ne!(psk_skeyid.as_slice(), sig_skeyid.as_slice());
    }

    #[test]
    fn cipher_key_expansion_covers_requested_length() {
        let cookies = CookiePair {
            initiator: [1u8; 8],
            responder: [2u8; 8],
        };
        let skeyid = derive_skeyid(
            HashAlgorithm::MD5,
            AuthenticationMethod::PRE_SHARED_KEY,
            b"secret",
            &[3u8; 16],
            &[4u8; 16],
            &[5u8; 128],
            &cookies,
        )
        .unwrap();
        // MD5 PRF emits 16-byte blocks; a 32-byte key needs expansion.
        let keys =
            derive_hierarchy(HashAlgorithm::MD5, skeyid, &[5u8; 128], &cookies, 32).unwrap();
        assert_eq!(keys.cipher_key.len(), 32);
        assert_eq!(keys.skeyid_e.len(), 16);
        assert_eq!(
            keys.cipher_key.as_slice()[..16],
            *Prf::init(HashAlgorithm::MD5, keys.skeyid_e.as_slice())
                .unwrap()
                .digest(&[&[0]])
                .as_slice()
        );
    }

    #[test]
    fn timer_ownership_is_exclusive() {
        let policy = test_policy();
        let mut session = Phase1Session::new_initiator(
            addr("192.0.2.1:500"),
            addr("192.0.2.2:500"),
            ExchangeType::IDENTITY_PROTECTION,
            policy,
        );
        let first = session.arm_timer(TimerKind::Retransmit);
        assert_eq!(session.active_timer(), Some(TimerKind::Retransmit));
        let second = session.arm_timer(TimerKind::Expiry);
        // Arming a new timer invalidates the previous generation.
        assert!(!session.timer_is_current(first));
        assert!(session.timer_is_current(second));
        assert_eq!(session.active_timer(), Some(TimerKind::Expiry));
        session.cancel_timer();
        assert!(session.active_timer().is_none());
        assert!(!session.timer_is_current(second));
    }
}
