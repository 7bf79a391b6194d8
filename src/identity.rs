//! Outbound identity rotation.
//!
//! Each download attempt presents a different browser fingerprint to the
//! upstream site: a user-agent string paired with the simulated player
//! client the extraction engine should impersonate. Drawing a fresh pair
//! per attempt routes retries around transient bot-detection blocks.

use rand::seq::SliceRandom;

/// The fingerprint presented to the extraction engine for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// User-agent header the engine sends on HTTP requests.
    pub user_agent: &'static str,
    /// Simulated client the engine's extractor presents as.
    pub player_client: &'static str,
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
];

const PLAYER_CLIENTS: &[&str] = &["web", "android", "ios", "web_safari", "tv_embedded"];

/// Stateless pool of outbound identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPool;

impl IdentityPool {
    pub fn new() -> Self {
        Self
    }

    /// Draw a uniform-random identity. Selection keeps no state across
    /// calls, so consecutive attempts are independent draws.
    pub fn pick(&self) -> Identity {
        let mut rng = rand::thread_rng();
        Identity {
            user_agent: USER_AGENTS
                .choose(&mut rng)
                .copied()
                .unwrap_or(USER_AGENTS[0]),
            player_client: PLAYER_CLIENTS
                .choose(&mut rng)
                .copied()
                .unwrap_or(PLAYER_CLIENTS[0]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_returns_pool_members() {
        let pool = IdentityPool::new();
        for _ in 0..50 {
            let identity = pool.pick();
            assert!(USER_AGENTS.contains(&identity.user_agent));
            assert!(PLAYER_CLIENTS.contains(&identity.player_client));
        }
    }

    #[test]
    fn pick_varies_over_many_draws() {
        let pool = IdentityPool::new();
        let mut agents = std::collections::HashSet::new();
        for _ in 0..200 {
            agents.insert(pool.pick().user_agent);
        }
        // 200 uniform draws over 5 agents missing more than one is
        // astronomically unlikely.
        assert!(agents.len() >= 4);
    }
}
