use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::ledger::{u128_str, AccountId, Amount, BlockHeight};

pub const DEFAULT_DECIMALS: u8 = 18;
/// 100 whole tokens at 18 decimals.
pub const DEFAULT_INITIAL_SUPPLY: Amount = 100_000_000_000_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Deployment parameters for a token instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TokenConfig {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub owner: AccountId,
    /// The token's own account, holding inventory for sale.
    pub reserve: AccountId,
    /// Credited to `owner` at deployment.
    #[serde(with = "u128_str")]
    pub initial_supply: Amount,
    /// Credited to `reserve` at deployment.
    #[serde(with = "u128_str")]
    pub reserve_supply: Amount,
    /// Currency units per token unit; zero pauses sales.
    #[serde(with = "u128_str")]
    pub token_rate: Amount,
    pub genesis_block: BlockHeight,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            name: "BlockSpendersERC20".to_string(),
            symbol: "asd".to_string(),
            decimals: DEFAULT_DECIMALS,
            owner: "owner".to_string(),
            reserve: "reserve".to_string(),
            initial_supply: DEFAULT_INITIAL_SUPPLY,
            reserve_supply: 0,
            token_rate: 0,
            genesis_block: 0,
        }
    }
}

impl TokenConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        tracing::info!(path = %path.display(), name = %config.name, "configuration loaded");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                reason: reason.to_string(),
            })
        };
        if self.name.is_empty() || self.name.len() > 64 {
            return invalid("name must be 1-64 characters");
        }
        if self.symbol.is_empty() || self.symbol.len() > 8 {
            return invalid("symbol must be 1-8 characters");
        }
        if self.decimals > 18 {
            return invalid("decimals must be 0-18");
        }
        if self.owner.is_empty() || self.reserve.is_empty() {
            return invalid("owner and reserve accounts must be named");
        }
        if self.owner == self.reserve {
            return invalid("owner and reserve must be distinct accounts");
        }
        if self.initial_supply.checked_add(self.reserve_supply).is_none() {
            return invalid("initial and reserve supply overflow");
        }
        Ok(())
    }
}
