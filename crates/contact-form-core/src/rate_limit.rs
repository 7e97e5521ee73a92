use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use time::{Duration, OffsetDateTime};

/// Minimum interval between accepted submissions from one client.
pub const THROTTLE_WINDOW: Duration = Duration::seconds(15);

/// Entries older than `window * SWEEP_RETENTION_FACTOR` are dropped by [`RateLimiter::sweep`].
pub const SWEEP_RETENTION_FACTOR: i32 = 4;

/// Client identifier used when neither the proxy header nor the peer address is usable.
pub const UNKNOWN_CLIENT: &str = "0.0.0.0";

/// Per-client throttle keyed by client identifier.
///
/// Only accepted submissions advance a client's timestamp; a rejected call
/// leaves the entry untouched, so retrying early does not extend the wait.
#[derive(Debug)]
pub struct RateLimiter {
    last_accepted: Mutex<HashMap<String, OffsetDateTime>>,
    window: Duration,
    retention: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(THROTTLE_WINDOW)
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            last_accepted: Mutex::new(HashMap::new()),
            window,
            retention: window * SWEEP_RETENTION_FACTOR,
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admits `client_id` at `now` unless its last accepted submission is
    /// less than one window old. Lookup, comparison and update happen under
    /// one lock, so concurrent calls for the same client admit at most one.
    pub fn admit(&self, client_id: &str, now: OffsetDateTime) -> bool {
        let mut entries = self.entries();
        if let Some(last) = entries.get(client_id) {
            if now - *last < self.window {
                return false;
            }
        }
        entries.insert(client_id.to_string(), now);
        true
    }

    /// Drops entries whose last accepted submission is older than the
    /// retention horizon and returns how many were removed.
    pub fn sweep(&self, now: OffsetDateTime) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, last| now - *last < self.retention);
        before - entries.len()
    }

    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.entries().len()
    }

    // The map holds plain timestamps, so a panic mid-update cannot leave it
    // inconsistent.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, OffsetDateTime>> {
        self.last_accepted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Derives the rate-limit key for a request.
///
/// Prefers the first entry of a forwarded-for header when `trust_forwarded_for`
/// is set and that entry parses as an IP address, then the transport peer
/// address, then [`UNKNOWN_CLIENT`]. Never fails.
#[must_use]
pub fn client_identifier(
    forwarded_for: Option<&str>,
    peer: Option<IpAddr>,
    trust_forwarded_for: bool,
) -> String {
    let forwarded = if trust_forwarded_for {
        forwarded_for.and_then(first_forwarded_ip)
    } else {
        None
    };

    forwarded
        .or(peer)
        .map_or_else(|| UNKNOWN_CLIENT.to_string(), |ip| ip.to_string())
}

fn first_forwarded_ip(raw: &str) -> Option<IpAddr> {
    raw.split(',').next()?.trim().parse().ok()
}
