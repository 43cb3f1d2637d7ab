use std::net::IpAddr;
use std::time::Duration;

use super::message::{ExchangeType, IdentificationType};
use super::proposal::{IsakmpTransform, Lifetime, SaProposal};

// How strictly a peer's lifetime and algorithm claims are validated against
// the local configuration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CheckLevel {
    // Accept the peer's values unconditionally.
    Obey,
    // Reject values exceeding the local maximum.
    Strict,
    // Narrow to the local maximum and notify the peer of the shorter value.
    Claim,
    // Reject anything not byte-equal to the local configuration.
    Exact,
}

impl CheckLevel {
    pub fn from_str(value: &str) -> Option<CheckLevel> {
        match value {
            "obey" => Some(CheckLevel::Obey),
            "strict" => Some(CheckLevel::Strict),
            "claim" => Some(CheckLevel::Claim),
            "exact" => Some(CheckLevel::Exact),
            _ => None,
        }
    }
}

// Unacknowledged probes count as failures; the next tick retries until the
// failure limit declares the peer dead.
#[derive(Clone, Copy, Debug)]
pub struct DpdConfig {
    pub interval: Duration,
    pub max_failures: u32,
}

impl Default for DpdConfig {
    fn default() -> DpdConfig {
        DpdConfig {
            interval: Duration::from_secs(20),
            max_failures: 5,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetransmitConfig {
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for RetransmitConfig {
    fn default() -> RetransmitConfig {
        RetransmitConfig {
            max_retries: 5,
            retry_interval: Duration::from_secs(1),
        }
    }
}

// An address range expressed as a prefix, as found in SPD selectors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Selector {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Selector {
    pub fn host(addr: IpAddr) -> Selector {
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Selector { addr, prefix_len }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(prefix), IpAddr::V4(addr)) => {
                let bits = u32::min(self.prefix_len as u32, 32);
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - bits);
                u32::from_be_bytes(prefix.octets()) & mask == u32::from_be_bytes(addr.octets()) & mask
            }
            (IpAddr::V6(prefix), IpAddr::V6(addr)) => {
                let bits = u32::min(self.prefix_len as u32, 128);
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - bits);
                u128::from_be_bytes(prefix.octets()) & mask
                    == u128::from_be_bytes(addr.octets()) & mask
            }
            _ => false,
        }
    }

    // ID payload type and data for this selector, per RFC 2407 Section 4.6.2.
    pub fn to_identification(&self) -> (IdentificationType, Vec<u8>) {
        match self.addr {
            IpAddr::V4(addr) => {
                if self.prefix_len >= 32 {
                    (IdentificationType::IPV4_ADDR, addr.octets().to_vec())
                } else {
                    let mask = if self.prefix_len == 0 {
                        0u32
                    } else {
                        u32::MAX << (32 - self.prefix_len as u32)
                    };
                    let mut data = addr.octets().to_vec();
                    data.extend_from_slice(&mask.to_be_bytes());
                    (IdentificationType::IPV4_ADDR_SUBNET, data)
                }
            }
            IpAddr::V6(addr) => {
                if self.prefix_len >= 128 {
                    (IdentificationType::IPV6_ADDR, addr.octets().to_vec())
                } else {
                    let mask = if self.prefix_len == 0 {
                        0u128
                    } else {
                        u128::MAX << (128 - self.prefix_len as u32)
                    };
                    let mut data = addr.octets().to_vec();
                    data.extend_from_slice(&mask.to_be_bytes());
                    (IdentificationType::IPV6_ADDR_SUBNET, data)
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Phase1Policy {
    pub exchange_types: Vec<ExchangeType>,
    pub candidates: Vec<IsakmpTransform>,
    pub pre_shared_key: Vec<u8>,
    pub lifetime: Lifetime,
    pub dpd: Option<DpdConfig>,
}

impl Phase1Policy {
    pub fn allows_exchange(&self, exchange_type: ExchangeType) -> bool {
        self.exchange_types.contains(&exchange_type)
    }
}

// One SPD entry this daemon is willing to negotiate Quick Mode for.
#[derive(Clone, Debug)]
pub struct Phase2Policy {
    pub id: u32,
    pub local: Selector,
    pub remote: Selector,
    // Template proposal with zeroed SPIs; SPI allocation fills them in.
    pub proposal: SaProposal,
    pub lifetime: Lifetime,
}

// An immutable view of the configuration at one point in time. Handles record
// the version they negotiated under; a reload produces a new snapshot and the
// reconciliation pass rebinds or evicts live handles.
#[derive(Clone, Debug)]
pub struct PolicySnapshot {
    pub version: u64,
    pub check_level: CheckLevel,
    pub phase1: Phase1Policy,
    pub phase2: Vec<Phase2Policy>,
    pub retransmit: RetransmitConfig,
}

impl PolicySnapshot {
    pub fn find_phase2_by_id(&self, id: u32) -> Option<&Phase2Policy> {
        self.phase2.iter().find(|policy| policy.id == id)
    }

    pub fn find_phase2_by_selectors(&self, local: &IpAddr, remote: &IpAddr) -> Option<&Phase2Policy> {
        self.phase2
            .iter()
            .find(|policy| policy.local.matches(local) && policy.remote.matches(remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_prefix_matching() {
        let selector = Selector {
            addr: "10.0.8.0".parse().unwrap(),
            prefix_len: 24,
        };
        assert!(selector.matches(&"10.0.8.42".parse().unwrap()));
        assert!(!selector.matches(&"10.0.9.42".parse().unwrap()));
        assert!(!selector.matches(&"::1".parse().unwrap()));
        let any = Selector {
            addr: "0.0.0.0".parse().unwrap(),
            prefix_len: 0,
        };
        assert!(any.matches(&"192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn host_selector_identification() {
        let selector = Selector::host("192.0.2.1".parse().unwrap());
        let (id_type, data) = selector.to_identification();
        assert_eq!(id_type, IdentificationType::IPV4_ADDR);
        assert_eq!(data, vec![192, 0, 2, 1]);
    }

    #[test]
    fn subnet_selector_identification() {
        let selector = Selector {
            addr: "10.0.8.0".parse().unwrap(),
            prefix_len: 24,
        };
        let (id_type, data) = selector.to_identification();
        assert_eq!(id_type, IdentificationType::IPV4_ADDR_SUBNET);
        assert_eq!(data, vec![10, 0, 8, 0, 255, 255, 255, 0]);
    }
}
