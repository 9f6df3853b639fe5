//! Per-agent token bucket rate limiting
//!
//! Each bucket holds `max_requests_per_second + burst_size` tokens and
//! refills at `max_requests_per_second` tokens per second, slowed down for
//! windows longer than a second so a full bucket takes at least one window.

use super::slots::SlotMap;
use crate::config::RateLimitConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, capacity: f64, rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Token buckets for every agent
#[derive(Debug)]
pub struct RateLimiterSet {
    capacity: f64,
    refill_rate: f64,
    buckets: SlotMap<Bucket>,
}

impl RateLimiterSet {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity(),
            refill_rate: config.refill_rate(),
            buckets: SlotMap::default(),
        }
    }

    fn bucket(&self, agent_id: &str) -> Arc<Mutex<Bucket>> {
        let capacity = self.capacity;
        self.buckets.get_or_insert_with(agent_id, || Bucket {
            tokens: capacity,
            last_refill: Instant::now(),
        })
    }

    /// Take one token for `agent_id`
    pub fn try_acquire(&self, agent_id: &str) -> Option<RatePermit> {
        let slot = self.bucket(agent_id);
        {
            let mut bucket = slot.lock();
            bucket.refill(self.capacity, self.refill_rate, Instant::now());
            if bucket.tokens < 1.0 {
                return None;
            }
            bucket.tokens -= 1.0;
        }
        Some(RatePermit {
            slot,
            capacity: self.capacity,
            used: false,
        })
    }

    /// Tokens currently available for `agent_id`
    pub fn available(&self, agent_id: &str) -> f64 {
        match self.buckets.get(agent_id) {
            Some(slot) => {
                let mut bucket = slot.lock();
                bucket.refill(self.capacity, self.refill_rate, Instant::now());
                bucket.tokens
            }
            None => self.capacity,
        }
    }

    /// Time until `agent_id` has a whole token again
    pub fn time_until_available(&self, agent_id: &str) -> Duration {
        let missing = 1.0 - self.available(agent_id);
        if missing <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing / self.refill_rate)
        }
    }

    pub fn remove_agent(&self, agent_id: &str) {
        self.buckets.retain(|key| key != agent_id);
    }
}

/// A token taken from a bucket
///
/// The token is spent once `commit` is called, when the request is actually
/// sent. Dropping an uncommitted permit puts the token back.
#[derive(Debug)]
pub struct RatePermit {
    slot: Arc<Mutex<Bucket>>,
    capacity: f64,
    used: bool,
}

impl RatePermit {
    pub fn commit(&mut self) {
        self.used = true;
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        if !self.used {
            let mut bucket = self.slot.lock();
            bucket.tokens = (bucket.tokens + 1.0).min(self.capacity);
        }
    }
}
