use log::{debug, info, warn};
use rand::Rng;

use super::crypto::Prf;
use super::message::{
    ExchangeType, Flags, InputMessage, MessageWriter, NotifyMessageType, Payload, PayloadDelete,
    PayloadIter, PayloadNotification, PayloadType, ProtocolId,
};
use super::phase1::{NegotiationError, Phase1Session};
use super::phase2::{hash1, payloads_span};
use super::proposal::{self, Lifetime};
use super::sadb::InstalledSaTable;

// What an inbound informational exchange asks the dispatcher to do.
#[derive(Debug)]
pub enum InformationalAction {
    // A validated delete for one installed IPsec SA.
    DeleteIpsecSa { protocol: ProtocolId, spi: Vec<u8> },
    // The peer deleted the ISAKMP SA itself.
    DeletePhase1,
    // The peer rebooted; drop every IPsec SA shared with it, but keep the
    // (fresh) ISAKMP SA this notify arrived on.
    InitialContact,
    // Commit-bit release for a Quick Mode waiting on the peer.
    Connected,
    // The responder narrowed an SA lifetime after the fact.
    ResponderLifetime {
        protocol: ProtocolId,
        spi: Vec<u8>,
        lifetime: Lifetime,
    },
    // A DPD probe of ours was answered.
    DpdAcknowledged,
}

pub struct InformationalOutcome {
    pub actions: Vec<InformationalAction>,
    pub reply_length: usize,
}

impl InformationalOutcome {
    fn empty() -> InformationalOutcome {
        InformationalOutcome {
            actions: vec![],
            reply_length: 0,
        }
    }
}

fn random_message_id() -> u32 {
    let mut message_id: u32 = 0;
    while message_id == 0 {
        message_id = rand::thread_rng().gen();
    }
    message_id
}

fn isakmp_spi(session: &Phase1Session) -> [u8; 16] {
    let cookies = session.cookies();
    let mut spi = [0u8; 16];
    spi[..8].copy_from_slice(&cookies.initiator);
    spi[8..].copy_from_slice(&cookies.responder);
    spi
}

fn auth_prf(session: &Phase1Session) -> Result<Prf, NegotiationError> {
    let hash = session
        .hash_algorithm()
        .ok_or_else(|| NegotiationError::new("ISAKMP SA has no keys"))?;
    let skeyid_a = session
        .skeyid_a()
        .ok_or_else(|| NegotiationError::new("ISAKMP SA has no keys"))?;
    Ok(Prf::init(hash, skeyid_a.as_slice())?)
}

// Handles one inbound informational exchange. Encrypted messages must carry
// a leading hash keyed with SKEYID_a; anything that fails that check is
// dropped. Unauthenticated notifies are logged and nothing more.
pub fn process(
    session: &mut Phase1Session,
    installed: &InstalledSaTable,
    msg: &InputMessage,
    dest: &mut [u8],
) -> Result<InformationalOutcome, NegotiationError> {
    let flags = msg.read_flags()?;
    if !flags.has(Flags::ENCRYPTION) {
        return process_plaintext(session, msg);
    }
    let message_id = msg.read_message_id();
    let body = msg.body();
    let block_length = session.block_length();
    if body.is_empty() || block_length == 0 || body.len() % block_length != 0 {
        return Err(NegotiationError::Protocol(
            NotifyMessageType::PAYLOAD_MALFORMED,
            "Encrypted body is not block-aligned",
        ));
    }
    let iv = session.message_iv(message_id)?;
    let decrypted = session.decrypt(&iv, body)?;
    if msg.read_next_payload() != PayloadType::HASH.type_id() || decrypted.len() < 4 {
        return Err(NegotiationError::Protocol(
            NotifyMessageType::INVALID_HASH_INFORMATION,
            "Informational message does not start with a hash payload",
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
    let prf = auth_prf(session)?;
    let expected = hash1(&prf, message_id, rest);
    if expected.as_slice() != received_hash {
        warn!(
            "Informational hash mismatch from {} (message ID {:x})",
            session.remote_addr(),
            message_id
        );
        return Err(NegotiationError::Protocol(
            NotifyMessageType::INVALID_HASH_INFORMATION,
            "Informational hash mismatch",
        ));
    }
    let mut outcome = InformationalOutcome::empty();
    for payload in PayloadIter::new(next_payload, rest) {
        match payload? {
            Payload::Notification(notify) => {
                if let Some(length) = process_notify(session, &notify, dest, &mut outcome)? {
                    outcome.reply_length = length;
                }
            }
            Payload::Delete(delete) => process_delete(session, installed, &delete, &mut outcome),
            other => {
                debug!(
                    "Ignoring {} payload in informational exchange",
                    other.payload_type()
                );
            }
        }
    }
    Ok(outcome)
}

// Notifies that arrive before the ISAKMP SA has keys cannot be trusted; log
// them for the operator and move on.
fn process_plaintext(
    session: &Phase1Session,
    msg: &InputMessage,
) -> Result<InformationalOutcome, NegotiationError> {
    for payload in msg.iter_payloads() {
        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                debug!("Failed to parse informational payload: {}", err);
                continue;
            }
        };
        match payload {
            Payload::Notification(notify) => {
                info!(
                    "Unauthenticated {} notification from {}",
                    notify.message_type(),
                    session.remote_addr()
                );
            }
            Payload::Delete(_) => {
                info!(
                    "Ignoring unauthenticated delete request from {}",
                    session.remote_addr()
                );
            }
            other => {
                debug!(
                    "Ignoring {} payload in plaintext informational exchange",
                    other.payload_type()
                );
            }
        }
    }
    Ok(InformationalOutcome::empty())
}

fn process_notify(
    session: &mut Phase1Session,
    notify: &PayloadNotification,
    dest: &mut [u8],
    outcome: &mut InformationalOutcome,
) -> Result<Option<usize>, NegotiationError> {
    let message_type = notify.message_type();
    match message_type {
        NotifyMessageType::R_U_THERE => {
            if notify.spi() != isakmp_spi(session) {
                debug!("DPD probe with mismatched cookies from {}", session.remote_addr());
                return Ok(None);
            }
            if notify.raw_value().len() < 4 {
                debug!("DPD probe without a sequence number");
                return Ok(None);
            }
            // Echo the peer's sequence number back.
            let length = send_notification(
                session,
                ProtocolId::ISAKMP,
                NotifyMessageType::R_U_THERE_ACK,
                notify.raw_value(),
                dest,
            )?;
            Ok(Some(length))
        }
        NotifyMessageType::R_U_THERE_ACK => {
            let data = notify.raw_value();
            if data.len() < 4 {
                debug!("DPD acknowledgment without a sequence number");
                return Ok(None);
            }
            let sequence = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            if session.dpd_acknowledged(sequence) {
                outcome.actions.push(InformationalAction::DpdAcknowledged);
            } else {
                debug!(
                    "Stale DPD acknowledgment {} from {}",
                    sequence,
                    session.remote_addr()
                );
            }
            Ok(None)
        }
        NotifyMessageType::INITIAL_CONTACT => {
            info!("Peer {} announced initial contact", session.remote_addr());
            outcome.actions.push(InformationalAction::InitialContact);
            Ok(None)
        }
        NotifyMessageType::CONNECTED => {
            outcome.actions.push(InformationalAction::Connected);
            Ok(None)
        }
        NotifyMessageType::RESPONDER_LIFETIME => {
            let protocol = match ProtocolId::from_u8(notify.protocol_id()) {
                Ok(protocol) => protocol,
                Err(_) => return Ok(None),
            };
            match proposal::parse_notify_lifetime(notify.raw_value()) {
                Ok(lifetime) => {
                    info!(
                        "Peer {} narrowed {} SA lifetime to {:?}s",
                        session.remote_addr(),
                        protocol,
                        lifetime.seconds
                    );
                    outcome.actions.push(InformationalAction::ResponderLifetime {
                        protocol,
                        spi: notify.spi().to_vec(),
                        lifetime,
                    });
                }
                Err(err) => debug!("Unparseable RESPONDER-LIFETIME data: {}", err),
            }
            Ok(None)
        }
        _ if message_type.is_error() => {
            warn!(
                "Peer {} sent {} error notification",
                session.remote_addr(),
                message_type
            );
            Ok(None)
        }
        _ => {
            debug!(
                "Ignoring {} notification from {}",
                message_type,
                session.remote_addr()
            );
            Ok(None)
        }
    }
}

// Delete requests are honored only for SAs this daemon actually installed.
fn process_delete(
    session: &Phase1Session,
    installed: &InstalledSaTable,
    delete: &PayloadDelete,
    outcome: &mut InformationalOutcome,
) {
    let protocol = match ProtocolId::from_u8(delete.protocol_id()) {
        Ok(protocol) => protocol,
        Err(err) => {
            debug!("Delete request for unknown protocol: {}", err);
            return;
        }
    };
    if protocol == ProtocolId::ISAKMP {
        for spi in delete.iter_spis() {
            if spi == isakmp_spi(session) {
                info!("Peer {} deleted the ISAKMP SA", session.remote_addr());
                outcome.actions.push(InformationalAction::DeletePhase1);
            } else {
                debug!("ISAKMP delete with mismatched cookies");
            }
        }
        return;
    }
    for spi in delete.iter_spis() {
        if installed.contains(protocol, spi) {
            outcome.actions.push(InformationalAction::DeleteIpsecSa {
                protocol,
                spi: spi.to_vec(),
            });
        } else {
            debug!(
                "Delete request for unknown {} SPI from {}",
                protocol,
                session.remote_addr()
            );
        }
    }
}

// Sends one notification in its own informational exchange. The message is
// hashed and encrypted once the ISAKMP SA has keys, plaintext before that.
pub fn send_notification(
    session: &Phase1Session,
    protocol: ProtocolId,
    message_type: NotifyMessageType,
    data: &[u8],
    dest: &mut [u8],
) -> Result<usize, NegotiationError> {
    let message_id = random_message_id();
    let cookies = session.cookies();
    let mut writer = MessageWriter::new(dest)?;
    writer.write_header(
        cookies.initiator,
        cookies.responder,
        ExchangeType::INFORMATIONAL,
        Flags::NONE,
        message_id,
    )?;
    let spi = isakmp_spi(session);
    if session.hash_algorithm().is_none() {
        writer.write_notification_payload(protocol, &spi, message_type, data)?;
        return Ok(writer.complete_message());
    }
    let prf = auth_prf(session)?;
    let prf_length = prf.output_length();
    writer.write_payload(PayloadType::HASH, &vec![0u8; prf_length])?;
    writer.write_notification_payload(protocol, &spi, message_type, data)?;
    patch_hash(&prf, &mut writer, prf_length, message_id);
    seal(session, &mut writer, message_id)
}

// Sends a notification scoped to an IPsec SA instead of the ISAKMP SA, e.g.
// RESPONDER-LIFETIME after the responder narrowed the proposed lifetime.
pub fn send_ipsec_notification(
    session: &Phase1Session,
    protocol: ProtocolId,
    spi: &[u8],
    message_type: NotifyMessageType,
    data: &[u8],
    dest: &mut [u8],
) -> Result<usize, NegotiationError> {
    let message_id = random_message_id();
    let cookies = session.cookies();
    let prf = auth_prf(session)?;
    let prf_length = prf.output_length();
    let mut writer = MessageWriter::new(dest)?;
    writer.write_header(
        cookies.initiator,
        cookies.responder,
        ExchangeType::INFORMATIONAL,
        Flags::NONE,
        message_id,
    )?;
    writer.write_payload(PayloadType::HASH, &vec![0u8; prf_length])?;
    writer.write_notification_payload(protocol, spi, message_type, data)?;
    patch_hash(&prf, &mut writer, prf_length, message_id);
    seal(session, &mut writer, message_id)
}

// Announces deletion of IPsec SAs to the peer.
pub fn send_delete(
    session: &Phase1Session,
    protocol: ProtocolId,
    spis: &[&[u8]],
    dest: &mut [u8],
) -> Result<usize, NegotiationError> {
    let message_id = random_message_id();
    let cookies = session.cookies();
    let prf = auth_prf(session)?;
    let prf_length = prf.output_length();
    let mut writer = MessageWriter::new(dest)?;
    writer.write_header(
        cookies.initiator,
        cookies.responder,
        ExchangeType::INFORMATIONAL,
        Flags::NONE,
        message_id,
    )?;
    writer.write_payload(PayloadType::HASH, &vec![0u8; prf_length])?;
    writer.write_delete_payload(protocol, protocol.spi_size(), spis)?;
    patch_hash(&prf, &mut writer, prf_length, message_id);
    seal(session, &mut writer, message_id)
}

// Announces deletion of the ISAKMP SA itself.
pub fn send_delete_phase1(
    session: &Phase1Session,
    dest: &mut [u8],
) -> Result<usize, NegotiationError> {
    let spi = isakmp_spi(session);
    send_delete(session, ProtocolId::ISAKMP, &[&spi], dest)
}

// Sends an R-U-THERE probe, returning the sequence number to match against
// the acknowledgment.
pub fn send_dpd_probe(
    session: &mut Phase1Session,
    dest: &mut [u8],
) -> Result<(usize, u32), NegotiationError> {
    let sequence = session.next_dpd_sequence();
    let length = send_notification(
        session,
        ProtocolId::ISAKMP,
        NotifyMessageType::R_U_THERE,
        &sequence.to_be_bytes(),
        dest,
    )?;
    Ok((length, sequence))
}

pub fn send_initial_contact(
    session: &Phase1Session,
    dest: &mut [u8],
) -> Result<usize, NegotiationError> {
    send_notification(
        session,
        ProtocolId::ISAKMP,
        NotifyMessageType::INITIAL_CONTACT,
        &[],
        dest,
    )
}

fn patch_hash(prf: &Prf, writer: &mut MessageWriter, prf_length: usize, message_id: u32) {
    let digest = {
        let data = writer.payloads_data();
        hash1(prf, message_id, &data[4 + prf_length..])
    };
    let data = writer.payloads_data_mut();
    data[4..4 + prf_length].copy_from_slice(digest.as_slice());
}

fn seal(
    session: &Phase1Session,
    writer: &mut MessageWriter,
    message_id: u32,
) -> Result<usize, NegotiationError> {
    let iv = session.message_iv(message_id)?;
    let block_length = session.block_length();
    let body = writer.pad_message(block_length)?;
    session.encrypt_in_place(&iv, body)?;
    let padded_length = body.len();
    Ok(writer.complete_encrypted_message(padded_length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev1::crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm};
    use crate::ikev1::phase1::Phase1Action;
    use crate::ikev1::policy::{
        CheckLevel, Phase1Policy, PolicySnapshot, RetransmitConfig,
    };
    use crate::ikev1::proposal::{AuthenticationMethod, IsakmpTransform, Lifetime};
    use std::sync::Arc;

    fn test_snapshot() -> Arc<PolicySnapshot> {
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
            phase2: vec![],
            retransmit: RetransmitConfig::default(),
        })
    }

    fn established_pair() -> (Phase1Session, Phase1Session) {
        let mut initiator = Phase1Session::new_initiator(
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
            ExchangeType::IDENTITY_PROTECTION,
            test_snapshot(),
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
            test_snapshot(),
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
                Phase1Action::Reply(length) | Phase1Action::Established(length)
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

    #[test]
    fn dpd_probe_round_trip() {
        let (mut initiator, mut responder) = established_pair();
        let installed = InstalledSaTable::new();
        let mut buf_a = [0u8; 4096];
        let mut buf_b = [0u8; 4096];
        let (length, _sequence) = send_dpd_probe(&mut initiator, &mut buf_a).unwrap();
        let probe = buf_a[..length].to_vec();
        let msg = InputMessage::from_datagram(&probe).unwrap();
        let outcome = process(&mut responder, &installed, &msg, &mut buf_b).unwrap();
        assert!(outcome.actions.is_empty());
        assert!(outcome.reply_length > 0);
        let ack = buf_b[..outcome.reply_length].to_vec();
        let msg = InputMessage::from_datagram(&ack).unwrap();
        let outcome = process(&mut initiator, &installed, &msg, &mut buf_a).unwrap();
        assert_eq!(outcome.actions.len(), 1);
        assert!(matches!(
            outcome.actions[0],
            InformationalAction::DpdAcknowledged
        ));
        assert_eq!(initiator.dpd_failures(), 0);
    }

    #[test]
    fn initial_contact_is_reported() {
        let (initiator, mut responder) = established_pair();
        let installed = InstalledSaTable::new();
        let mut buf_a = [0u8; 4096];
        let mut buf_b = [0u8; 4096];
        let length = send_initial_contact(&initiator, &mut buf_a).unwrap();
        let notify = buf_a[..length].to_vec();
        let msg = InputMessage::from_datagram(&notify).unwrap();
        let outcome = process(&mut responder, &installed, &msg, &mut buf_b).unwrap();
        assert_eq!(outcome.actions.len(), 1);
        assert!(matches!(
            outcome.actions[0],
            InformationalAction::InitialContact
        ));
        assert_eq!(outcome.reply_length, 0);
    }

    #[test]
    fn delete_is_validated_against_installed_sas() {
        let (initiator, mut responder) = established_pair();
        let mut installed = InstalledSaTable::new();
        installed.insert(ProtocolId::ESP, &[0x11, 0x22, 0x33, 0x44]);
        let mut buf_a = [0u8; 4096];
        let mut buf_b = [0u8; 4096];
        let length = send_delete(
            &initiator,
            ProtocolId::ESP,
            &[&[0x11, 0x22, 0x33, 0x44], &[0x55, 0x66, 0x77, 0x88]],
            &mut buf_a,
        )
        .unwrap();
        let request = buf_a[..length].to_vec();
        let msg = InputMessage::from_datagram(&request).unwrap();
        let outcome = process(&mut responder, &installed, &msg, &mut buf_b).unwrap();
        // Only the installed SPI is acted upon.
        assert_eq!(outcome.actions.len(), 1);
        match &outcome.actions[0] {
            InformationalAction::DeleteIpsecSa { protocol, spi } => {
                assert_eq!(*protocol, ProtocolId::ESP);
                assert_eq!(spi, &vec![0x11, 0x22, 0x33, 0x44]);
            }
            other => panic!("Unexpected action {:?}", other),
        }
    }

    #[test]
    fn isakmp_delete_tears_down_phase1() {
        let (initiator, mut responder) = established_pair();
        let installed = InstalledSaTable::new();
        let mut buf_a = [0u8; 4096];
        let mut buf_b = [0u8; 4096];
        let length = send_delete_phase1(&initiator, &mut buf_a).unwrap();
        let request = buf_a[..length].to_vec();
        let msg = InputMessage::from_datagram(&request).unwrap();
        let outcome = process(&mut responder, &installed, &msg, &mut buf_b).unwrap();
        assert_eq!(outcome.actions.len(), 1);
        assert!(matches!(
            outcome.actions[0],
            InformationalAction::DeletePhase1
        ));
    }

    #[test]
    fn plaintext_notifications_produce_no_actions() {
        let policy = test_snapshot();
        let mut session = Phase1Session::new_responder(
            [1u8; 8],
            "192.0.2.2:500".parse().unwrap(),
            "192.0.2.1:500".parse().unwrap(),
            ExchangeType::IDENTITY_PROTECTION,
            policy,
        );
        let installed = InstalledSaTable::new();
        let mut buf = [0u8; 4096];
        // A session with no keys sends notifications in the clear.
        let length = send_notification(
            &session,
            ProtocolId::ISAKMP,
            NotifyMessageType::NO_PROPOSAL_CHOSEN,
            &[],
            &mut buf,
        )
        .unwrap();
        let notify = buf[..length].to_vec();
        let msg = InputMessage::from_datagram(&notify).unwrap();
        let mut reply = [0u8; 4096];
        let outcome = process(&mut session, &installed, &msg, &mut reply).unwrap();
        assert!(outcome.actions.is_empty());
        assert_eq!(outcome.reply_length, 0);
    }

    #[test]
    fn tampered_informational_is_rejected() {
        let (initiator, mut responder) = established_pair();
        let installed = InstalledSaTable::new();
        let mut buf_a = [0u8; 4096];
        let mut buf_b = [0u8; 4096];
        let length = send_initial_contact(&initiator, &mut buf_a).unwrap();
        let mut notify = buf_a[..length].to_vec();
        let last = notify.len() - 1;
        notify[last] ^= 0xff;
        let msg = InputMessage::from_datagram(&notify).unwrap();
        assert!(process(&mut responder, &installed, &msg, &mut buf_b).is_err());
    }
}
