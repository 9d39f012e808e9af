//! Per-peer token buckets for packet- and amount-based limiting.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_second: f64) -> Self {
        TokenBucket {
            capacity: per_second,
            tokens: per_second,
            refill_per_second: per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
    }

    fn take(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    fn put(&mut self, tokens: f64) {
        self.tokens = (self.tokens + tokens).min(self.capacity);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum BucketKind {
    Packets,
    IncomingAmount,
    OutgoingAmount,
}

/// Tracks every peer's buckets. A peer without a configured limit never
/// consumes tokens.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<(Uuid, BucketKind), TokenBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&self, peer_id: Uuid, kind: BucketKind, per_second: f64, tokens: f64) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((peer_id, kind))
            .or_insert_with(|| TokenBucket::new(per_second));
        // limits can be reconfigured between packets
        if (bucket.refill_per_second - per_second).abs() > f64::EPSILON {
            *bucket = TokenBucket::new(per_second);
        }
        bucket.take(tokens)
    }

    /// One packet against the peer's packets-per-second limit.
    pub fn take_packet(&self, peer_id: Uuid, limit: Option<u32>) -> bool {
        match limit {
            None => true,
            Some(limit) => self.take(peer_id, BucketKind::Packets, f64::from(limit), 1.0),
        }
    }

    pub fn take_incoming_amount(&self, peer_id: Uuid, limit: Option<u64>, amount: u64) -> bool {
        match limit {
            None => true,
            Some(limit) => self.take(
                peer_id,
                BucketKind::IncomingAmount,
                limit as f64,
                amount as f64,
            ),
        }
    }

    /// Hands back tokens when the packet failed downstream, so the peer is
    /// not charged throughput for money that never moved.
    pub fn refund_incoming_amount(&self, peer_id: Uuid, limit: Option<u64>, amount: u64) {
        if limit.is_none() {
            return;
        }
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(&(peer_id, BucketKind::IncomingAmount)) {
            bucket.put(amount as f64);
        }
    }

    pub fn take_outgoing_amount(&self, peer_id: Uuid, limit: Option<u64>, amount: u64) -> bool {
        match limit {
            None => true,
            Some(limit) => self.take(
                peer_id,
                BucketKind::OutgoingAmount,
                limit as f64,
                amount as f64,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_peers_always_pass() {
        let limiter = RateLimiter::new();
        let peer = Uuid::new_v4();
        for _ in 0..10_000 {
            assert!(limiter.take_packet(peer, None));
        }
    }

    #[test]
    fn packet_bucket_exhausts_at_the_limit() {
        let limiter = RateLimiter::new();
        let peer = Uuid::new_v4();
        assert!(limiter.take_packet(peer, Some(2)));
        assert!(limiter.take_packet(peer, Some(2)));
        assert!(!limiter.take_packet(peer, Some(2)));
    }

    #[test]
    fn amount_bucket_tracks_value_and_refunds() {
        let limiter = RateLimiter::new();
        let peer = Uuid::new_v4();
        assert!(limiter.take_incoming_amount(peer, Some(100), 80));
        assert!(!limiter.take_incoming_amount(peer, Some(100), 40));
        limiter.refund_incoming_amount(peer, Some(100), 80);
        assert!(limiter.take_incoming_amount(peer, Some(100), 40));
    }

    #[test]
    fn buckets_are_per_peer() {
        let limiter = RateLimiter::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert!(limiter.take_packet(first, Some(1)));
        assert!(limiter.take_packet(second, Some(1)));
        assert!(!limiter.take_packet(first, Some(1)));
    }
}
