//! Consensus constants for activation delays and expirations.
//!
//! The numbers must match the node's chain parameters exactly, so they sit behind
//! [`ClaimtriePolicy`] and can be swapped for an independently verified table.

/// Activation and expiration rules applied by the [`ClaimTrie`](super::ClaimTrie).
pub trait ClaimtriePolicy: Send + Sync {
    /// Blocks a new claim or support waits before it competes, given the height of the
    /// name's last takeover.
    fn activation_delay(&self, height: u32, takeover_height: u32) -> u32;

    /// First height at which an item created at `created_height` no longer counts.
    fn expiration_height(&self, created_height: u32) -> u32;
}

/// Per-network claim-trie parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusParams {
    /// Divisor applied to the blocks elapsed since the last takeover.
    pub proportional_delay_factor: u32,
    /// Upper bound on the activation delay.
    pub max_takeover_delay: u32,
    /// Lifetime of claims and supports before the expiration fork.
    pub original_expiration: u32,
    /// Lifetime of claims and supports still alive at the fork.
    pub extended_expiration: u32,
    /// Height at which the extended lifetime kicks in.
    pub extended_expiration_fork: u32,
}

impl ConsensusParams {
    /// LBRY mainnet.
    pub const MAINNET: Self = Self {
        proportional_delay_factor: 32,
        max_takeover_delay: 4032,
        original_expiration: 262_974,
        extended_expiration: 2_102_400,
        extended_expiration_fork: 400_155,
    };

    /// LBRY testnet; only the fork height differs.
    pub const TESTNET: Self = Self {
        extended_expiration_fork: 278_160,
        ..Self::MAINNET
    };

    /// Regtest, with short lifetimes.
    pub const REGTEST: Self = Self {
        proportional_delay_factor: 32,
        max_takeover_delay: 4032,
        original_expiration: 500,
        extended_expiration: 600,
        extended_expiration_fork: 800,
    };
}

impl ClaimtriePolicy for ConsensusParams {
    fn activation_delay(&self, height: u32, takeover_height: u32) -> u32 {
        let elapsed = height.saturating_sub(takeover_height);
        (elapsed / self.proportional_delay_factor).min(self.max_takeover_delay)
    }

    fn expiration_height(&self, created_height: u32) -> u32 {
        let original = created_height.saturating_add(self.original_expiration);
        if original < self.extended_expiration_fork {
            original
        } else {
            created_height.saturating_add(self.extended_expiration)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_time_since_takeover() {
        let p = ConsensusParams::REGTEST;
        assert_eq!(p.activation_delay(114, 113), 0);
        assert_eq!(p.activation_delay(501, 113), 12);
        assert_eq!(p.activation_delay(512, 113), 12);
        assert_eq!(p.activation_delay(520, 113), 12);
    }

    #[test]
    fn delay_is_capped() {
        let p = ConsensusParams::MAINNET;
        assert_eq!(p.activation_delay(1_000_000, 0), 4032);
    }

    #[test]
    fn expiration_switches_at_fork() {
        let p = ConsensusParams::REGTEST;
        assert_eq!(p.expiration_height(110), 610);
        assert_eq!(p.expiration_height(120), 620);
        // 300 + 500 reaches the fork, so the extended lifetime applies
        assert_eq!(p.expiration_height(300), 900);
    }
}
