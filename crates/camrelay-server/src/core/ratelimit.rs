use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

/// Per-address sliding-window admission control for viewer connections.
///
/// Loopback and configured exempt addresses bypass the window entirely.
/// Windows are pruned on every check; fully idle addresses are dropped by
/// the housekeeping task via [`RateLimiter::prune_idle`].
pub struct RateLimiter {
    window: Duration,
    max_connections: usize,
    exempt: HashSet<String>,
    history: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(
        window: Duration,
        max_connections: usize,
        exempt: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            window,
            max_connections,
            exempt: exempt.into_iter().collect(),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Records the connection attempt and decides admission. Refused
    /// attempts stay recorded so a flooding address cannot reset its own
    /// window by being refused.
    pub fn admit(
        &self,
        address: IpAddr,
    ) -> bool {
        if self.is_exempt(address) {
            return true;
        }

        let now = Instant::now();
        let mut history = self.lock();
        let timestamps = history.entry(address).or_default();
        timestamps.retain(|at| now.duration_since(*at) < self.window);
        timestamps.push(now);

        timestamps.len() <= self.max_connections
    }

    /// Drops addresses whose every recorded attempt has left the window.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut history = self.lock();
        let before = history.len();
        history.retain(|_, timestamps| {
            timestamps
                .iter()
                .any(|at| now.duration_since(*at) < self.window)
        });

        let removed = before.saturating_sub(history.len());
        if removed > 0 {
            debug!(
                "cleaned idle rate windows: removed={}, tracked={}",
                removed,
                history.len()
            );
        }
        removed
    }

    fn is_exempt(
        &self,
        address: IpAddr,
    ) -> bool {
        address.is_loopback() || self.exempt.contains(&address.to_string())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, Vec<Instant>>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last_octet: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last_octet])
    }

    #[test]
    fn admits_up_to_the_window_limit() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3, Vec::new());

        for _ in 0..3 {
            assert!(limiter.admit(addr(9)));
        }
        assert!(!limiter.admit(addr(9)));
        assert!(!limiter.admit(addr(9)));
    }

    #[test]
    fn addresses_are_tracked_independently() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1, Vec::new());

        assert!(limiter.admit(addr(1)));
        assert!(!limiter.admit(addr(1)));
        assert!(limiter.admit(addr(2)));
    }

    #[test]
    fn loopback_is_always_admitted() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1, Vec::new());

        for _ in 0..100 {
            assert!(limiter.admit(IpAddr::from([127, 0, 0, 1])));
        }
    }

    #[test]
    fn configured_exemption_bypasses_the_window() {
        let limiter = RateLimiter::new(
            Duration::from_secs(60),
            1,
            vec!["10.0.0.7".to_string()],
        );

        for _ in 0..10 {
            assert!(limiter.admit(addr(7)));
        }
        assert!(limiter.admit(addr(8)));
        assert!(!limiter.admit(addr(8)));
    }

    #[test]
    fn window_expiry_resets_the_counter() {
        let limiter = RateLimiter::new(Duration::from_millis(40), 1, Vec::new());

        assert!(limiter.admit(addr(3)));
        assert!(!limiter.admit(addr(3)));

        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.admit(addr(3)));
    }

    #[test]
    fn prune_drops_only_idle_addresses() {
        let limiter = RateLimiter::new(Duration::from_millis(40), 5, Vec::new());

        limiter.admit(addr(1));
        std::thread::sleep(Duration::from_millis(60));
        limiter.admit(addr(2));

        assert_eq!(limiter.prune_idle(), 1);
        assert_eq!(limiter.prune_idle(), 0);
    }
}
