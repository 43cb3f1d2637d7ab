use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, info};

use super::message::ProtocolId;
use super::phase1::{CookiePair, Phase1Session};
use super::phase2::{Phase2Session, Phase2State};
use super::policy::PolicySnapshot;

// Owns every live negotiation handle. Phase-1 sessions are indexed by their
// cookie pair (initiator-created handles sit under a zero responder cookie
// until the peer's cookie is learned), phase-2 handles by the sequence number
// that also keys their SA/SPD store requests.
pub struct SessionRegistry {
    phase1: HashMap<CookiePair, Phase1Session>,
    phase2: HashMap<u32, Phase2Session>,
    contacted_peers: HashSet<IpAddr>,
    next_sequence: u32,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry {
            phase1: HashMap::new(),
            phase2: HashMap::new(),
            contacted_peers: HashSet::new(),
            next_sequence: 1,
        }
    }

    pub fn reserve_sequence(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);
        sequence
    }

    // Phase-1 handles.

    pub fn insert_phase1(&mut self, session: Phase1Session) {
        let cookies = session.cookies();
        debug!("Registered ISAKMP SA {}", cookies);
        self.phase1.insert(cookies, session);
    }

    // Expired handles are invisible to every lookup; they linger only until
    // the next reap pass.
    pub fn phase1_mut(&mut self, cookies: &CookiePair) -> Option<&mut Phase1Session> {
        self.phase1
            .get_mut(cookies)
            .filter(|session| !session.is_expired())
    }

    pub fn phase1(&self, cookies: &CookiePair) -> Option<&Phase1Session> {
        self.phase1
            .get(cookies)
            .filter(|session| !session.is_expired())
    }

    // Finds an initiator handle still waiting for the peer's cookie.
    pub fn phase1_half_open(&mut self, initiator: [u8; 8]) -> Option<&mut Phase1Session> {
        let key = CookiePair {
            initiator,
            responder: [0u8; 8],
        };
        self.phase1_mut(&key)
    }

    // Any live handle with this initiator cookie, used for messages that
    // arrive before the responder cookie is echoed back.
    pub fn phase1_by_initiator(&mut self, initiator: [u8; 8]) -> Option<&mut Phase1Session> {
        self.phase1.values_mut().find(|session| {
            !session.is_expired() && session.cookies().initiator == initiator
        })
    }

    // Moves a handle to its full cookie pair once the responder cookie is
    // known.
    pub fn rekey_phase1(&mut self, old: &CookiePair, new: CookiePair) {
        if let Some(session) = self.phase1.remove(old) {
            debug!("ISAKMP SA {} is now indexed as {}", old, new);
            self.phase1.insert(new, session);
        }
    }

    pub fn remove_phase1(&mut self, cookies: &CookiePair) -> Option<Phase1Session> {
        self.phase1.remove(cookies)
    }

    // Established handle keyed on both endpoints. Acquire events carry the
    // traffic addresses, which name the IKE endpoints for host policies.
    pub fn phase1_by_addrs(
        &mut self,
        local_ip: IpAddr,
        remote_ip: IpAddr,
    ) -> Option<&mut Phase1Session> {
        self.phase1.values_mut().find(|session| {
            session.is_established()
                && session.local_addr().ip() == local_ip
                && session.remote_addr().ip() == remote_ip
        })
    }

    // Any established handle for the peer host, regardless of port. Used
    // when a kernel acquire needs an existing ISAKMP SA.
    pub fn phase1_by_remote_ip(&mut self, remote_ip: IpAddr) -> Option<&mut Phase1Session> {
        self.phase1.values_mut().find(|session| {
            session.is_established() && session.remote_addr().ip() == remote_ip
        })
    }

    pub fn iter_phase1(&self) -> impl Iterator<Item = &Phase1Session> {
        self.phase1.values().filter(|session| !session.is_expired())
    }

    pub fn iter_phase1_mut(&mut self) -> impl Iterator<Item = &mut Phase1Session> {
        self.phase1
            .values_mut()
            .filter(|session| !session.is_expired())
    }

    // Phase-2 handles.

    pub fn insert_phase2(&mut self, session: Phase2Session) {
        let sequence = session.sequence();
        if let Some(phase1) = self.phase1.get_mut(&session.phase1_cookies()) {
            phase1.add_dependent(sequence);
        }
        self.phase2.insert(sequence, session);
    }

    pub fn phase2_mut(&mut self, sequence: u32) -> Option<&mut Phase2Session> {
        self.phase2
            .get_mut(&sequence)
            .filter(|session| !session.is_expired())
    }

    // Borrows a phase-2 handle together with its owning ISAKMP SA. The two
    // tables are disjoint fields, so both can be mutable at once.
    pub fn phase2_with_phase1(
        &mut self,
        sequence: u32,
    ) -> Option<(&mut Phase2Session, &mut Phase1Session)> {
        let session = self
            .phase2
            .get_mut(&sequence)
            .filter(|session| !session.is_expired())?;
        let phase1 = self
            .phase1
            .get_mut(&session.phase1_cookies())
            .filter(|session| !session.is_expired())?;
        Some((session, phase1))
    }

    pub fn phase2_by_message_id_with_phase1(
        &mut self,
        cookies: &CookiePair,
        message_id: u32,
    ) -> Option<(&mut Phase2Session, &mut Phase1Session)> {
        let session = self.phase2.values_mut().find(|session| {
            !session.is_expired()
                && session.phase1_cookies() == *cookies
                && session.message_id() == message_id
        })?;
        let phase1 = self
            .phase1
            .get_mut(cookies)
            .filter(|session| !session.is_expired())?;
        Some((session, phase1))
    }

    pub fn phase2_sequences_for(&self, cookies: &CookiePair) -> Vec<u32> {
        self.phase2
            .iter()
            .filter(|(_, session)| {
                !session.is_expired() && session.phase1_cookies() == *cookies
            })
            .map(|(sequence, _)| *sequence)
            .collect()
    }

    pub fn phase2_sequences_for_peer(&self, remote_ip: IpAddr) -> Vec<u32> {
        self.phase2
            .iter()
            .filter(|(_, session)| {
                !session.is_expired() && session.remote_addr().ip() == remote_ip
            })
            .map(|(sequence, _)| *sequence)
            .collect()
    }

    // The handle blocked on the peer's CONNECTED notification, if any.
    pub fn phase2_commit_waiting(&self, cookies: &CookiePair) -> Option<u32> {
        self.phase2
            .iter()
            .find(|(_, session)| {
                session.phase1_cookies() == *cookies
                    && session.state() == Phase2State::CommitWait
            })
            .map(|(sequence, _)| *sequence)
    }

    // A live negotiation for an SPD entry between two endpoints. Acquire
    // handling keys on this to avoid starting a duplicate exchange.
    pub fn phase2_by_selectors(
        &mut self,
        src: IpAddr,
        dst: IpAddr,
        policy_id: u32,
    ) -> Option<&mut Phase2Session> {
        self.phase2.values_mut().find(|session| {
            !session.is_expired()
                && session.policy_id() == policy_id
                && session.local_addr().ip() == src
                && session.remote_addr().ip() == dst
        })
    }

    pub fn phase2_by_spi(
        &mut self,
        protocol: ProtocolId,
        spi: &[u8],
    ) -> Option<&mut Phase2Session> {
        self.phase2
            .values_mut()
            .find(|session| !session.is_expired() && session.owns_spi(protocol, spi))
    }

    pub fn remove_phase2(&mut self, sequence: u32) -> Option<Phase2Session> {
        let session = self.phase2.remove(&sequence)?;
        if let Some(phase1) = self.phase1.get_mut(&session.phase1_cookies()) {
            phase1.remove_dependent(sequence);
        }
        Some(session)
    }

    // Maintenance passes.

    // Drops handles that are expired or abandoned mid-negotiation. Phase-2
    // handles whose ISAKMP SA is gone are dropped with them.
    pub fn reap_stalled(&mut self) -> usize {
        let before = self.phase1.len() + self.phase2.len();
        self.phase1
            .retain(|cookies, session| {
                let keep = !session.is_expired() && !session.is_stalled();
                if !keep {
                    debug!("Reaping ISAKMP SA {} in state {}", cookies, session.state());
                }
                keep
            });
        let phase1 = &self.phase1;
        self.phase2.retain(|sequence, session| {
            let keep = !session.is_expired()
                && !session.is_stalled()
                && phase1.contains_key(&session.phase1_cookies());
            if !keep {
                debug!(
                    "Reaping phase 2 handle {} in state {}",
                    sequence,
                    session.state()
                );
            }
            keep
        });
        let mut live_dependents: HashMap<CookiePair, HashSet<u32>> = HashMap::new();
        for (sequence, session) in &self.phase2 {
            live_dependents
                .entry(session.phase1_cookies())
                .or_default()
                .insert(*sequence);
        }
        for (cookies, session) in self.phase1.iter_mut() {
            let live = live_dependents.remove(cookies).unwrap_or_default();
            let stale: Vec<u32> = session
                .dependents()
                .filter(|sequence| !live.contains(sequence))
                .collect();
            for sequence in stale {
                session.remove_dependent(sequence);
            }
        }
        before - (self.phase1.len() + self.phase2.len())
    }

    // Applies a new policy snapshot. Handles whose policy still exists keep
    // running against the new version; the rest are expired and returned so
    // the caller can notify peers and tear down kernel state.
    pub fn reconfigure(
        &mut self,
        policy: &Arc<PolicySnapshot>,
    ) -> (Vec<CookiePair>, Vec<u32>) {
        let mut dropped_phase1 = vec![];
        for (cookies, session) in self.phase1.iter_mut() {
            if session.is_expired() || session.policy_version() == policy.version {
                continue;
            }
            if policy.phase1.allows_exchange(session.exchange_type())
                && policy.phase1.pre_shared_key == session.policy().phase1.pre_shared_key
            {
                session.rebind_policy(policy.clone());
            } else {
                info!("ISAKMP SA {} no longer matches policy, tearing down", cookies);
                session.expire();
                dropped_phase1.push(*cookies);
            }
        }
        let mut dropped_phase2 = vec![];
        for (sequence, session) in self.phase2.iter_mut() {
            if session.is_expired() {
                continue;
            }
            let phase1_gone = dropped_phase1.contains(&session.phase1_cookies());
            if phase1_gone || policy.find_phase2_by_id(session.policy_id()).is_none() {
                info!("Phase 2 handle {} no longer matches policy, tearing down", sequence);
                session.expire();
                dropped_phase2.push(*sequence);
            }
        }
        (dropped_phase1, dropped_phase2)
    }

    // Drains everything for shutdown. The caller sends delete notifications
    // for whatever was established.
    pub fn flush(&mut self) -> (Vec<Phase1Session>, Vec<Phase2Session>) {
        self.contacted_peers.clear();
        let phase1 = self.phase1.drain().map(|(_, session)| session).collect();
        let phase2 = self.phase2.drain().map(|(_, session)| session).collect();
        (phase1, phase2)
    }

    // True exactly once per peer address; INITIAL-CONTACT goes out only on
    // the first ISAKMP SA with a host this daemon has not spoken to.
    pub fn first_contact(&mut self, remote_ip: IpAddr) -> bool {
        self.contacted_peers.insert(remote_ip)
    }

    // Human-readable report of the phase-1 table for the admin socket.
    pub fn dump_phase1(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(
            report,
            "{:<33} {:<14} {:<9} {:<21} {:<21} {:<19} {:>6} {:>5}",
            "cookies", "state", "side", "local", "remote", "exchange", "age", "ph2"
        );
        for (cookies, session) in &self.phase1 {
            let _ = writeln!(
                report,
                "{:<33} {:<14} {:<9} {:<21} {:<21} {:<19} {:>5}s {:>5}",
                cookies,
                session.state(),
                session.role(),
                session.local_addr(),
                session.remote_addr(),
                session.exchange_type(),
                session.age().as_secs(),
                session.dependent_count()
            );
        }
        report
    }

    pub fn phase1_count(&self) -> usize {
        self.phase1.len()
    }

    pub fn phase2_count(&self) -> usize {
        self.phase2.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev1::crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm};
    use crate::ikev1::message::ExchangeType;
    use crate::ikev1::policy::{
        CheckLevel, Phase1Policy, Phase2Policy, RetransmitConfig, Selector,
    };
    use crate::ikev1::proposal::{
        AuthAlgorithm, AuthenticationMethod, EncapsulationMode, IpsecTransform, IsakmpTransform,
        Lifetime, ProtocolProposal, SaProposal, ESP_TRANSFORM_AES,
    };

    fn test_policy(version: u64) -> Arc<PolicySnapshot> {
        Arc::new(PolicySnapshot {
            version,
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
            phase2: vec![Phase2Policy {
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
            }],
            retransmit: RetransmitConfig::default(),
        })
    }

    fn initiator_session() -> Phase1Session {
        Phase1Session::new_initiator(
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
            ExchangeType::IDENTITY_PROTECTION,
            test_policy(1),
        )
    }

    #[test]
    fn expired_sessions_are_invisible() {
        let mut registry = SessionRegistry::new();
        let session = initiator_session();
        let cookies = session.cookies();
        registry.insert_phase1(session);
        assert!(registry.phase1_mut(&cookies).is_some());
        registry
            .phase1
            .get_mut(&cookies)
            .map(|session| session.expire());
        assert!(registry.phase1_mut(&cookies).is_none());
        assert_eq!(registry.phase1_count(), 1);
        assert_eq!(registry.reap_stalled(), 1);
        assert_eq!(registry.phase1_count(), 0);
    }

    #[test]
    fn half_open_lookup_and_rekey() {
        let mut registry = SessionRegistry::new();
        let session = initiator_session();
        let cookies = session.cookies();
        registry.insert_phase1(session);
        // Initiator handles start with a zero responder cookie.
        assert!(registry.phase1_half_open(cookies.initiator).is_some());
        let full = CookiePair {
            initiator: cookies.initiator,
            responder: [7u8; 8],
        };
        registry.rekey_phase1(&cookies, full);
        assert!(registry.phase1_half_open(cookies.initiator).is_none());
        assert!(registry.phase1_mut(&full).is_some());
    }

    #[test]
    fn address_lookup_requires_established() {
        let mut registry = SessionRegistry::new();
        let session = initiator_session();
        let local = session.local_addr();
        let remote = session.remote_addr();
        registry.insert_phase1(session);
        assert!(registry.phase1_by_remote_ip(remote.ip()).is_none());
        assert!(registry
            .phase1_by_addrs(local.ip(), remote.ip())
            .is_none());
    }

    #[test]
    fn selector_lookup_matches_endpoints_and_policy() {
        let mut registry = SessionRegistry::new();
        let phase1 = initiator_session();
        let policy = test_policy(1);
        let session = Phase2Session::new_initiator(7, &phase1, &policy.phase2[0]);
        registry.insert_phase2(session);
        let src: IpAddr = "192.0.2.1".parse().unwrap();
        let dst: IpAddr = "192.0.2.2".parse().unwrap();
        assert!(registry.phase2_by_selectors(src, dst, 1).is_some());
        assert!(registry.phase2_by_selectors(src, dst, 2).is_none());
        // Endpoints are directional.
        assert!(registry.phase2_by_selectors(dst, src, 1).is_none());
    }

    #[test]
    fn first_contact_fires_once_per_peer() {
        let mut registry = SessionRegistry::new();
        let peer: IpAddr = "192.0.2.2".parse().unwrap();
        assert!(registry.first_contact(peer));
        assert!(!registry.first_contact(peer));
        assert!(registry.first_contact("192.0.2.3".parse().unwrap()));
    }

    #[test]
    fn reconfigure_rebinds_or_expires() {
        let mut registry = SessionRegistry::new();
        let session = initiator_session();
        let cookies = session.cookies();
        registry.insert_phase1(session);
        // Same settings under a new version: the handle is rebound.
        let updated = test_policy(2);
        let (dropped1, dropped2) = registry.reconfigure(&updated);
        assert!(dropped1.is_empty() && dropped2.is_empty());
        assert_eq!(
            registry.phase1(&cookies).map(|session| session.policy_version()),
            Some(2)
        );
        // A changed pre-shared key invalidates the handle.
        let mut changed = (*test_policy(3)).clone();
        changed.phase1.pre_shared_key = b"different".to_vec();
        let changed = Arc::new(changed);
        let (dropped1, _) = registry.reconfigure(&changed);
        assert_eq!(dropped1, vec![cookies]);
        assert!(registry.phase1(&cookies).is_none());
    }

    #[test]
    fn sequence_numbers_skip_zero() {
        let mut registry = SessionRegistry::new();
        registry.next_sequence = u32::MAX;
        assert_eq!(registry.reserve_sequence(), u32::MAX);
        assert_eq!(registry.reserve_sequence(), 1);
    }
}
