use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::debug;

use super::crypto;

// Verdict for one inbound datagram.
pub enum ReplayCheck {
    // First sighting, process normally.
    New,
    // Seen before from the same peer; resend this cached reply verbatim.
    Replay(Option<Vec<u8>>),
    // Seen before, but from a different address. Possible off-path spoof.
    AddressMismatch(SocketAddr),
}

struct CacheEntry {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    reply: Option<Vec<u8>>,
    retries_left: u32,
    created: Instant,
}

// Remembers digests of recently processed inbound messages along with the
// reply each one produced, so duplicates are answered without reprocessing.
pub struct ReplayCache {
    entries: HashMap<[u8; 32], CacheEntry>,
    max_retries: u32,
    retry_interval: Duration,
}

impl ReplayCache {
    pub fn new(max_retries: u32, retry_interval: Duration) -> ReplayCache {
        ReplayCache {
            entries: HashMap::new(),
            max_retries,
            retry_interval,
        }
    }

    // Checks an inbound datagram against the cache. A hit from the matching
    // address consumes one retry; the entry is evicted when the budget runs
    // out, letting a persistent peer trigger full reprocessing again.
    pub fn check(&mut self, data: &[u8], remote_addr: SocketAddr) -> ReplayCheck {
        let digest = crypto::hash_sha256(data);
        let entry = match self.entries.get_mut(&digest) {
            Some(entry) => entry,
            None => return ReplayCheck::New,
        };
        if entry.remote_addr != remote_addr {
            return ReplayCheck::AddressMismatch(entry.remote_addr);
        }
        let reply = entry.reply.clone();
        if entry.retries_left <= 1 {
            debug!(
                "Replay cache entry for {} exhausted its retry budget",
                remote_addr
            );
            self.entries.remove(&digest);
        } else {
            entry.retries_left -= 1;
        }
        ReplayCheck::Replay(reply)
    }

    // Records a processed message and the reply it produced (if any).
    pub fn store(
        &mut self,
        data: &[u8],
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        reply: Option<&[u8]>,
    ) {
        let digest = crypto::hash_sha256(data);
        self.entries.insert(
            digest,
            CacheEntry {
                remote_addr,
                local_addr,
                reply: reply.map(|reply| reply.to_vec()),
                retries_left: self.max_retries,
                created: Instant::now(),
            },
        );
    }

    // Drops entries old enough that every retry would already have fired.
    pub fn sweep(&mut self) {
        let lifetime = self.retry_interval * self.max_retries;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.created.elapsed() < lifetime);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!("Evicted {} expired replay cache entries", evicted);
        }
    }

    pub fn flush(&mut self) {
        self.entries.clear();
    }

    // The socket the original reply went out on; resends should use it too.
    pub fn local_addr_for(&self, data: &[u8]) -> Option<SocketAddr> {
        let digest = crypto::hash_sha256(data);
        self.entries.get(&digest).map(|entry| entry.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn first_message_is_new() {
        let mut cache = ReplayCache::new(3, Duration::from_secs(1));
        match cache.check(b"message", addr("192.0.2.1:500")) {
            ReplayCheck::New => {}
            _ => panic!("Expected a cache miss"),
        }
    }

    #[test]
    fn duplicates_replay_until_budget_runs_out() {
        let mut cache = ReplayCache::new(3, Duration::from_secs(1));
        let remote = addr("192.0.2.1:500");
        let local = addr("192.0.2.2:500");
        cache.store(b"message", remote, local, Some(b"reply"));
        // Exactly max_retries duplicates are served from the cache.
        for _ in 0..3 {
            match cache.check(b"message", remote) {
                ReplayCheck::Replay(Some(reply)) => assert_eq!(reply, b"reply"),
                _ => panic!("Expected a cached reply"),
            }
        }
        // The entry is gone, the next duplicate is processed in full.
        match cache.check(b"message", remote) {
            ReplayCheck::New => {}
            _ => panic!("Expected the entry to be evicted"),
        }
    }

    #[test]
    fn address_mismatch_is_reported() {
        let mut cache = ReplayCache::new(3, Duration::from_secs(1));
        let remote = addr("192.0.2.1:500");
        cache.store(b"message", remote, addr("192.0.2.2:500"), None);
        match cache.check(b"message", addr("198.51.100.7:500")) {
            ReplayCheck::AddressMismatch(original) => assert_eq!(original, remote),
            _ => panic!("Expected an address mismatch"),
        }
    }

    #[test]
    fn sweep_evicts_aged_entries() {
        let mut cache = ReplayCache::new(3, Duration::from_millis(0));
        let remote = addr("192.0.2.1:500");
        cache.store(b"message", remote, addr("192.0.2.2:500"), None);
        cache.sweep();
        match cache.check(b"message", remote) {
            ReplayCheck::New => {}
            _ => panic!("Expected the entry to be swept"),
        }
    }
}
