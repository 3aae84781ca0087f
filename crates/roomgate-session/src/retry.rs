//! Client-side timeout and retry bookkeeping.
//!
//! Every outstanding request is a [`PendingRequest`]: its id, the exact
//! bytes that were sent, and when. If no response arrives before the
//! deadline, the *identical* bytes are sent again, so the server sees the
//! same request id and can deduplicate. After `max_retries` resends the
//! request is abandoned.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use roomgate_protocol::RequestId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Timeout and retry limits. One deadline applies to every request kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// How long to wait for a response before resending.
    pub timeout: Duration,
    /// Resends after the first attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// The longest a request can stay outstanding, across all attempts.
    /// Servers keep responses cached for longer than this.
    pub fn total_window(&self) -> Duration {
        self.timeout * (self.max_retries + 1)
    }
}

/// One request waiting for its response.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: RequestId,
    /// The encoded frame, resent verbatim.
    pub encoded: Bytes,
    pub issued_at: Instant,
    pub sent_at: Instant,
    pub retries: u32,
}

impl PendingRequest {
    /// Total send attempts so far.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }
}

/// What to do after a request's deadline passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send these bytes again.
    Resend(Bytes),
    /// Give up. The request is no longer tracked.
    Exhausted { attempts: u32 },
}

/// Tracks outstanding requests for one client connection.
#[derive(Debug, Default)]
pub struct RetryTracker {
    policy: RetryPolicy,
    pending: HashMap<RequestId, PendingRequest>,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Starts tracking a request that was just sent.
    pub fn begin(&mut self, request_id: RequestId, encoded: Bytes, now: Instant) {
        self.pending.insert(
            request_id,
            PendingRequest {
                request_id,
                encoded,
                issued_at: now,
                sent_at: now,
                retries: 0,
            },
        );
    }

    /// When the current attempt of a request times out.
    pub fn deadline(&self, request_id: RequestId) -> Option<Instant> {
        self.pending
            .get(&request_id)
            .map(|p| p.sent_at + self.policy.timeout)
    }

    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.contains_key(&request_id)
    }

    /// Called when a request's deadline passed. Returns `None` if the
    /// request is not tracked.
    pub fn on_timeout(&mut self, request_id: RequestId, now: Instant) -> Option<RetryDecision> {
        let pending = self.pending.get_mut(&request_id)?;
        if pending.retries >= self.policy.max_retries {
            let attempts = pending.attempts();
            self.pending.remove(&request_id);
            return Some(RetryDecision::Exhausted { attempts });
        }
        pending.retries += 1;
        pending.sent_at = now;
        Some(RetryDecision::Resend(pending.encoded.clone()))
    }

    /// Stops tracking a request because its response arrived. Returns
    /// `None` for ids that are not outstanding (stale or duplicate
    /// responses).
    pub fn complete(&mut self, request_id: RequestId) -> Option<PendingRequest> {
        self.pending.remove(&request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_retries: u32) -> RetryTracker {
        RetryTracker::new(RetryPolicy {
            timeout: Duration::from_secs(10),
            max_retries,
        })
    }

    #[test]
    fn test_default_policy_is_ten_seconds_three_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(10));
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.total_window(), Duration::from_secs(40));
    }

    #[test]
    fn test_deadline_is_send_time_plus_timeout() {
        let mut t = tracker(3);
        let now = Instant::now();
        t.begin(RequestId(1), Bytes::from_static(b"x"), now);
        assert_eq!(t.deadline(RequestId(1)), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_on_timeout_resends_identical_bytes_then_exhausts() {
        let mut t = tracker(2);
        let now = Instant::now();
        let bytes = Bytes::from_static(b"frame-bytes");
        t.begin(RequestId(1), bytes.clone(), now);

        assert_eq!(
            t.on_timeout(RequestId(1), now),
            Some(RetryDecision::Resend(bytes.clone()))
        );
        assert_eq!(
            t.on_timeout(RequestId(1), now),
            Some(RetryDecision::Resend(bytes))
        );
        assert_eq!(
            t.on_timeout(RequestId(1), now),
            Some(RetryDecision::Exhausted { attempts: 3 })
        );
        assert!(!t.is_pending(RequestId(1)));
    }

    #[test]
    fn test_resend_pushes_deadline_forward() {
        let mut t = tracker(3);
        let start = Instant::now();
        t.begin(RequestId(1), Bytes::new(), start);

        let later = start + Duration::from_secs(10);
        t.on_timeout(RequestId(1), later);
        assert_eq!(t.deadline(RequestId(1)), Some(later + Duration::from_secs(10)));
    }

    #[test]
    fn test_complete_unknown_id_is_stale() {
        let mut t = tracker(3);
        assert!(t.complete(RequestId(4)).is_none());
        assert!(t.on_timeout(RequestId(4), Instant::now()).is_none());
    }
}
