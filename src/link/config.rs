//! Link layer configuration.

use std::time::Duration;

use crate::core::{
    LinkError, CONTACT_CLOCK_SKEW, CONTACT_MAX_AGE, DEAD_INTERVAL, DEFAULT_CRYPTO_WORKERS, DEFAULT_LINK_RANK,
    DEFAULT_MAX_ANOMALIES, DEFAULT_MAX_PENDING_HANDSHAKES, DEFAULT_MAX_QUEUED_FRAMES,
    DEFAULT_WORK_QUEUE_DEPTH, HANDSHAKE_MAX_RETRIES, HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL,
    REKEY_AFTER_TIME,
};

/// Link layer configuration.
///
/// Supplied at construction by the router's configuration loader.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Accept handshakes from unknown addresses.
    pub permit_inbound: bool,

    /// Number of crypto worker threads.
    pub worker_count: usize,

    /// Maximum crypto jobs waiting for a worker.
    pub work_queue_depth: usize,

    /// Close sessions without a valid inbound frame for this long.
    pub inactivity_timeout: Duration,

    /// Renegotiate session keys after this long.
    pub rekey_interval: Duration,

    /// Send a keepalive after this long without outbound traffic.
    pub keepalive_interval: Duration,

    /// Initial handshake retransmission timeout (doubles per retry).
    pub handshake_timeout: Duration,

    /// Handshake retransmissions before giving up.
    pub handshake_max_retries: u32,

    /// Sessions allowed in pre-authentication states at once.
    pub max_pending_handshakes: usize,

    /// Outbound payloads buffered per session.
    pub max_queued_frames: usize,

    /// Replayed, reordered or wrong-epoch frames tolerated per session.
    pub max_anomalies: u32,

    /// Oldest acceptable identity document.
    pub contact_max_age: Duration,

    /// Numeric rank exposed to link selection.
    pub rank: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            permit_inbound: true,
            worker_count: DEFAULT_CRYPTO_WORKERS,
            work_queue_depth: DEFAULT_WORK_QUEUE_DEPTH,
            inactivity_timeout: DEAD_INTERVAL,
            rekey_interval: REKEY_AFTER_TIME,
            keepalive_interval: KEEPALIVE_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            handshake_max_retries: HANDSHAKE_MAX_RETRIES,
            max_pending_handshakes: DEFAULT_MAX_PENDING_HANDSHAKES,
            max_queued_frames: DEFAULT_MAX_QUEUED_FRAMES,
            max_anomalies: DEFAULT_MAX_ANOMALIES,
            contact_max_age: CONTACT_MAX_AGE,
            rank: DEFAULT_LINK_RANK,
        }
    }
}

impl LinkConfig {
    /// Reject settings the link layer cannot run with.
    pub fn validate(&self) -> Result<(), LinkError> {
        let zero = |name: &str| Err(LinkError::Config(format!("{name} must be non-zero")));

        if self.worker_count == 0 {
            return zero("worker_count");
        }
        if self.work_queue_depth == 0 {
            return zero("work_queue_depth");
        }
        if self.inactivity_timeout.is_zero() {
            return zero("inactivity_timeout");
        }
        if self.rekey_interval.is_zero() {
            return zero("rekey_interval");
        }
        if self.keepalive_interval.is_zero() {
            return zero("keepalive_interval");
        }
        if self.handshake_timeout.is_zero() {
            return zero("handshake_timeout");
        }
        if self.max_pending_handshakes == 0 {
            return zero("max_pending_handshakes");
        }
        if self.keepalive_interval >= self.inactivity_timeout {
            return Err(LinkError::Config(
                "keepalive_interval must be shorter than inactivity_timeout".into(),
            ));
        }
        Ok(())
    }

    /// How long an unanswered handshake or renegotiation is kept alive.
    ///
    /// Covers every retransmission's backoff, but never exceeds
    /// `inactivity_timeout`.
    pub fn handshake_deadline(&self) -> Duration {
        let mut total = Duration::ZERO;
        for retry in 0..=self.handshake_max_retries.min(16) {
            total = total.saturating_add(self.handshake_timeout.saturating_mul(1u32 << retry));
        }
        total.min(self.inactivity_timeout)
    }

    /// Oldest handshake timestamp a responder accepts.
    ///
    /// A retransmitted handshake is at most `handshake_deadline` old, plus
    /// the clock skew tolerated between routers.
    pub fn handshake_max_age(&self) -> Duration {
        self.handshake_deadline() + CONTACT_CLOCK_SKEW
    }
}

/// Builder for [`LinkConfig`].
#[derive(Debug, Default)]
pub struct LinkConfigBuilder {
    config: LinkConfig,
}

impl LinkConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept or refuse inbound sessions.
    pub fn permit_inbound(mut self, permit: bool) -> Self {
        self.config.permit_inbound = permit;
        self
    }

    /// Set the crypto worker count.
    pub fn worker_count(mut self, workers: usize) -> Self {
        self.config.worker_count = workers;
        self
    }

    /// Set the crypto work queue depth.
    pub fn work_queue_depth(mut self, depth: usize) -> Self {
        self.config.work_queue_depth = depth;
        self
    }

    /// Set the inactivity timeout.
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.config.inactivity_timeout = timeout;
        self
    }

    /// Set the key rotation interval.
    pub fn rekey_interval(mut self, interval: Duration) -> Self {
        self.config.rekey_interval = interval;
        self
    }

    /// Set the keepalive interval.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the initial handshake retransmission timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the handshake retransmission limit.
    pub fn handshake_max_retries(mut self, retries: u32) -> Self {
        self.config.handshake_max_retries = retries;
        self
    }

    /// Set the bound on half-open sessions.
    pub fn max_pending_handshakes(mut self, max: usize) -> Self {
        self.config.max_pending_handshakes = max;
        self
    }

    /// Set the per-session outbound queue bound.
    pub fn max_queued_frames(mut self, max: usize) -> Self {
        self.config.max_queued_frames = max;
        self
    }

    /// Set the anomaly threshold.
    pub fn max_anomalies(mut self, max: u32) -> Self {
        self.config.max_anomalies = max;
        self
    }

    /// Set the maximum identity document age.
    pub fn contact_max_age(mut self, age: Duration) -> Self {
        self.config.contact_max_age = age;
        self
    }

    /// Set the link rank.
    pub fn rank(mut self, rank: u16) -> Self {
        self.config.rank = rank;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<LinkConfig, LinkError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
