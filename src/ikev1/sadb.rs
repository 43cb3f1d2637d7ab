use std::collections::HashSet;
use std::{error, fmt};
use std::net::IpAddr;

use tokio::sync::mpsc;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::message::ProtocolId;
use super::proposal::{AuthAlgorithm, EncapsulationMode, Lifetime};

// Keys handed to the kernel for one SA direction.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SaKeys {
    pub encryption_key: Vec<u8>,
    pub authentication_key: Vec<u8>,
}

pub struct SaInstall {
    pub protocol: ProtocolId,
    pub spi: Vec<u8>,
    pub transform_id: u8,
    pub auth: Option<AuthAlgorithm>,
    pub encapsulation: EncapsulationMode,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub keys: SaKeys,
    pub lifetime: Lifetime,
}

// Requests the negotiation engine issues to the SA/SPD store. Every request
// is fire-and-forget; replies arrive asynchronously as SadbEvent messages.
pub enum SadbRequest {
    // Allocate an inbound SPI; the store answers with SpiAllocated carrying
    // the same sequence number.
    GetSpi {
        sequence: u32,
        protocol: ProtocolId,
        src: IpAddr,
        dst: IpAddr,
    },
    AddSa(SaInstall),
    DeleteSa {
        protocol: ProtocolId,
        spi: Vec<u8>,
        src: IpAddr,
        dst: IpAddr,
    },
}

// Asynchronous notifications from the SA/SPD store.
#[derive(Clone, Debug)]
pub enum SadbEvent {
    SpiAllocated {
        sequence: u32,
        protocol: ProtocolId,
        spi: Vec<u8>,
    },
    // Kernel policy saw traffic with no SA; start a negotiation.
    Acquire {
        sequence: u32,
        policy_id: u32,
        src: IpAddr,
        dst: IpAddr,
    },
    // An installed SA reached its lifetime (or was deleted underneath us).
    Expire {
        protocol: ProtocolId,
        spi: Vec<u8>,
        src: IpAddr,
        dst: IpAddr,
    },
}

#[derive(Clone)]
pub struct SadbHandle {
    tx: mpsc::Sender<SadbRequest>,
}

impl SadbHandle {
    pub fn new(tx: mpsc::Sender<SadbRequest>) -> SadbHandle {
        SadbHandle { tx }
    }

    fn send(&self, request: SadbRequest) -> Result<(), SadbError> {
        self.tx.try_send(request).map_err(|_| SadbError::Unavailable)
    }

    pub fn get_spi(
        &self,
        sequence: u32,
        protocol: ProtocolId,
        src: IpAddr,
        dst: IpAddr,
    ) -> Result<(), SadbError> {
        self.send(SadbRequest::GetSpi {
            sequence,
            protocol,
            src,
            dst,
        })
    }

    pub fn add_sa(&self, install: SaInstall) -> Result<(), SadbError> {
        self.send(SadbRequest::AddSa(install))
    }

    pub fn delete_sa(
        &self,
        protocol: ProtocolId,
        spi: &[u8],
        src: IpAddr,
        dst: IpAddr,
    ) -> Result<(), SadbError> {
        self.send(SadbRequest::DeleteSa {
            protocol,
            spi: spi.to_vec(),
            src,
            dst,
        })
    }
}

// Mirror of the SAs this daemon installed, used to validate inbound delete
// requests against what is actually live before acting on them.
pub struct InstalledSaTable {
    entries: HashSet<(u8, Vec<u8>)>,
}

impl InstalledSaTable {
    pub fn new() -> InstalledSaTable {
        InstalledSaTable {
            entries: HashSet::new(),
        }
    }

    pub fn insert(&mut self, protocol: ProtocolId, spi: &[u8]) {
        self.entries.insert((protocol.type_id(), spi.to_vec()));
    }

    pub fn remove(&mut self, protocol: ProtocolId, spi: &[u8]) -> bool {
        self.entries.remove(&(protocol.type_id(), spi.to_vec()))
    }

    pub fn contains(&self, protocol: ProtocolId, spi: &[u8]) -> bool {
        self.entries.contains(&(protocol.type_id(), spi.to_vec()))
    }

    pub fn flush(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug)]
pub enum SadbError {
    Unavailable,
}

impl fmt::Display for SadbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Unavailable => write!(f, "SA/SPD store is unavailable"),
        }
    }
}

impl error::Error for SadbError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installed_sa_table_tracks_live_spis() {
        let mut table = InstalledSaTable::new();
        let spi = [0x01, 0x02, 0x03, 0x04];
        table.insert(ProtocolId::ESP, &spi);
        assert!(table.contains(ProtocolId::ESP, &spi));
        assert!(!table.contains(ProtocolId::AH, &spi));
        assert!(table.remove(ProtocolId::ESP, &spi));
        assert!(!table.remove(ProtocolId::ESP, &spi));
    }

    #[test]
    fn requests_are_delivered_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let handle = SadbHandle::new(tx);
        let src: IpAddr = "192.0.2.1".parse().unwrap();
        let dst: IpAddr = "192.0.2.2".parse().unwrap();
        handle.get_spi(7, ProtocolId::ESP, src, dst).unwrap();
        handle
            .delete_sa(ProtocolId::ESP, &[1, 2, 3, 4], src, dst)
            .unwrap();
        match rx.try_recv().unwrap() {
            SadbRequest::GetSpi { sequence, .. } => assert_eq!(sequence, 7),
            _ => panic!("Expected a GetSpi request"),
        }
        match rx.try_recv().unwrap() {
            SadbRequest::DeleteSa { spi, .. } => assert_eq!(spi, vec![1, 2, 3, 4]),
            _ => panic!("Expected a DeleteSa request"),
        }
    }
}
