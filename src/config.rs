use std::time::Duration;

use thiserror::Error;

use crate::RESET_TOKEN_SIZE;

/// Shortest permitted retry-token lifetime
pub const MIN_RETRY_TOKEN_TTL: Duration = Duration::from_secs(1);
/// Longest permitted retry-token lifetime
pub const MAX_RETRY_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Dispatcher-wide configuration, fixed at construction.
pub struct DispatchConfig {
    /// How long an issued retry token stays valid. Must lie within
    /// [`MIN_RETRY_TOKEN_TTL`]..=[`MAX_RETRY_TOKEN_TTL`].
    pub retry_token_ttl: Duration,

    /// Sessions a single peer address may hold at once; further initial
    /// packets are accepted but closed immediately as busy.
    pub max_conns_per_peer: u32,

    /// Stateless resets ever sent to a single peer address. Guards
    /// against two stateless endpoints resetting each other forever.
    pub max_resets_per_peer: u32,

    /// Require an explicit retry-token round trip before accepting an
    /// initial packet.
    pub validate_address: bool,

    /// Skip re-validation for addresses that recently completed one,
    /// remembered in a bounded LRU.
    pub validate_address_lru: bool,

    /// Whether accepted sessions should produce qlog output
    pub qlog: QlogMode,

    /// Secret for deriving stateless reset tokens. Random when absent,
    /// which makes resets unrecognizable across restarts.
    pub reset_secret: Option<[u8; RESET_TOKEN_SIZE]>,

    /// Never emit stateless resets, and never recognize inbound ones.
    pub disable_stateless_reset: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_token_ttl: Duration::from_secs(10),
            max_conns_per_peer: 100,
            max_resets_per_peer: 10,
            validate_address: false,
            validate_address_lru: false,
            qlog: QlogMode::Disabled,
            reset_secret: None,
            disable_stateless_reset: false,
        }
    }
}

impl DispatchConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_token_ttl < MIN_RETRY_TOKEN_TTL || self.retry_token_ttl > MAX_RETRY_TOKEN_TTL
        {
            return Err(ConfigError::IllegalValue(
                "retry_token_ttl must lie between 1 and 60 seconds",
            ));
        }
        Ok(())
    }
}

/// Whether accepted sessions produce qlog output
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum QlogMode {
    #[default]
    Disabled,
    Enabled,
}

/// Errors in the configuration of a dispatcher
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The supplied configuration contained an invalid value
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}
