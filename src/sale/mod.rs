use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::TokenConfig;
use crate::ledger::{u128_str, AccountId, Amount, BlockHeight, Ledger, LedgerError, LedgerEvent};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SaleError {
    #[error("account {caller} is not permitted to perform this operation")]
    Unauthorized { caller: AccountId },
    #[error("account {account} cannot own the token")]
    InvalidOwner { account: AccountId },
    #[error("account {account} cannot receive purchased tokens")]
    InvalidRecipient { account: AccountId },
    #[error("token rate is not set; sales are paused")]
    RateNotSet,
    #[error("reserve cannot cover purchase: eligible {eligible}, requested {requested}")]
    InsufficientReserve { eligible: Amount, requested: Amount },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaleParams {
    pub owner: AccountId,
    pub reserve: AccountId,
    /// Currency units required per token unit.
    pub token_rate: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SaleEvent {
    TokensPurchased {
        recipient: AccountId,
        #[serde(with = "u128_str")]
        payment: Amount,
        #[serde(with = "u128_str")]
        tokens: Amount,
    },
    RateChanged {
        #[serde(with = "u128_str")]
        previous: Amount,
        #[serde(with = "u128_str")]
        current: Amount,
    },
    ReserveIncreased {
        #[serde(with = "u128_str")]
        amount: Amount,
        block: BlockHeight,
    },
    ProceedsWithdrawn {
        to: AccountId,
        #[serde(with = "u128_str")]
        amount: Amount,
    },
    OwnershipTransferred {
        previous: AccountId,
        current: AccountId,
    },
}

impl SaleEvent {
    pub(crate) fn commit(&self, hasher: &mut Sha256) {
        match self {
            SaleEvent::TokensPurchased {
                recipient,
                payment,
                tokens,
            } => {
                hasher.update(b"purchase");
                hasher.update(recipient.as_bytes());
                hasher.update(payment.to_le_bytes());
                hasher.update(tokens.to_le_bytes());
            }
            SaleEvent::RateChanged { previous, current } => {
                hasher.update(b"rate");
                hasher.update(previous.to_le_bytes());
                hasher.update(current.to_le_bytes());
            }
            SaleEvent::ReserveIncreased { amount, block } => {
                hasher.update(b"reserve");
                hasher.update(amount.to_le_bytes());
                hasher.update(block.to_le_bytes());
            }
            SaleEvent::ProceedsWithdrawn { to, amount } => {
                hasher.update(b"proceeds");
                hasher.update(to.as_bytes());
                hasher.update(amount.to_le_bytes());
            }
            SaleEvent::OwnershipTransferred { previous, current } => {
                hasher.update(b"ownership");
                hasher.update(previous.as_bytes());
                hasher.update(current.as_bytes());
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TokenEvent {
    Ledger(LedgerEvent),
    Sale(SaleEvent),
}

/// A token whose ledger holds back same-block receipts, sold from a reserve
/// account at an owner-set rate.
///
/// Token balances live in the ledger; sale proceeds are base currency and are
/// tracked here, outside the ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    metadata: TokenMetadata,
    sale: SaleParams,
    ledger: Ledger,
    #[serde(with = "u128_str")]
    proceeds: Amount,
    deployed_at: BlockHeight,
    #[serde(skip)]
    events: Vec<TokenEvent>,
}

impl Token {
    pub fn deploy(config: &TokenConfig) -> Result<Self, LedgerError> {
        let mut ledger = Ledger::new();
        ledger.allocate_genesis(&config.owner, config.initial_supply)?;
        if config.reserve_supply > 0 {
            ledger.allocate_genesis(&config.reserve, config.reserve_supply)?;
        }
        tracing::info!(
            name = %config.name,
            symbol = %config.symbol,
            owner = %config.owner,
            total_supply = ledger.total_supply(),
            block = config.genesis_block,
            "token deployed"
        );
        Ok(Self {
            metadata: TokenMetadata {
                name: config.name.clone(),
                symbol: config.symbol.clone(),
                decimals: config.decimals,
            },
            sale: SaleParams {
                owner: config.owner.clone(),
                reserve: config.reserve.clone(),
                token_rate: config.token_rate,
            },
            ledger,
            proceeds: 0,
            deployed_at: config.genesis_block,
            events: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn symbol(&self) -> &str {
        &self.metadata.symbol
    }

    pub fn decimals(&self) -> u8 {
        self.metadata.decimals
    }

    pub fn owner(&self) -> &AccountId {
        &self.sale.owner
    }

    pub fn reserve(&self) -> &AccountId {
        &self.sale.reserve
    }

    pub fn token_rate(&self) -> Amount {
        self.sale.token_rate
    }

    pub fn proceeds(&self) -> Amount {
        self.proceeds
    }

    pub fn deployed_at(&self) -> BlockHeight {
        self.deployed_at
    }

    pub fn total_supply(&self) -> Amount {
        self.ledger.total_supply()
    }

    pub fn balance_of(&self, account: &AccountId) -> Amount {
        self.ledger.balance_of(account)
    }

    pub fn spendable_balance_of(&self, account: &AccountId, block: BlockHeight) -> Amount {
        self.ledger.spendable_balance_of(account, block)
    }

    pub fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Amount {
        self.ledger.allowance(owner, spender)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn transfer(
        &mut self,
        caller: &AccountId,
        to: &AccountId,
        amount: Amount,
        block: BlockHeight,
    ) -> Result<(), SaleError> {
        self.ensure_not_reserve(caller)?;
        let result = self.ledger.transfer(caller, to, amount, block);
        self.absorb_ledger_events();
        Ok(result?)
    }

    pub fn transfer_from(
        &mut self,
        caller: &AccountId,
        owner: &AccountId,
        to: &AccountId,
        amount: Amount,
        block: BlockHeight,
    ) -> Result<(), SaleError> {
        self.ensure_not_reserve(caller)?;
        let result = self.ledger.transfer_from(caller, owner, to, amount, block);
        self.absorb_ledger_events();
        Ok(result?)
    }

    pub fn approve(
        &mut self,
        caller: &AccountId,
        spender: &AccountId,
        amount: Amount,
    ) -> Result<(), SaleError> {
        self.ensure_not_reserve(caller)?;
        self.ledger.approve(caller, spender, amount);
        self.absorb_ledger_events();
        Ok(())
    }

    pub fn increase_allowance(
        &mut self,
        caller: &AccountId,
        spender: &AccountId,
        added: Amount,
    ) -> Result<(), SaleError> {
        self.ensure_not_reserve(caller)?;
        let result = self.ledger.increase_allowance(caller, spender, added);
        self.absorb_ledger_events();
        Ok(result?)
    }

    pub fn decrease_allowance(
        &mut self,
        caller: &AccountId,
        spender: &AccountId,
        subtracted: Amount,
    ) -> Result<(), SaleError> {
        self.ensure_not_reserve(caller)?;
        let result = self.ledger.decrease_allowance(caller, spender, subtracted);
        self.absorb_ledger_events();
        Ok(result?)
    }

    /// Sells reserve tokens to `recipient` for `payment` currency units.
    ///
    /// The whole payment is kept as proceeds, including any remainder below
    /// the price of one token unit. Returns the number of tokens delivered.
    pub fn buy_tokens_for_address(
        &mut self,
        recipient: &AccountId,
        payment: Amount,
        block: BlockHeight,
    ) -> Result<Amount, SaleError> {
        // Selling the reserve to itself would only re-lock its own inventory.
        if *recipient == self.sale.reserve {
            tracing::warn!(%recipient, payment, "purchase for the reserve refused");
            return Err(SaleError::InvalidRecipient {
                account: recipient.clone(),
            });
        }
        let rate = self.sale.token_rate;
        if rate == 0 {
            tracing::warn!(%recipient, payment, "purchase while sales are paused");
            return Err(SaleError::RateNotSet);
        }
        let tokens = payment / rate;
        let eligible = self.ledger.spendable_balance_of(&self.sale.reserve, block);
        if tokens > eligible {
            tracing::warn!(%recipient, tokens, eligible, block, "reserve cannot cover purchase");
            return Err(SaleError::InsufficientReserve {
                eligible,
                requested: tokens,
            });
        }
        let proceeds = self
            .proceeds
            .checked_add(payment)
            .ok_or(LedgerError::Overflow {
                context: "proceeds",
            })?;
        let reserve = self.sale.reserve.clone();
        let result = self.ledger.transfer(&reserve, recipient, tokens, block);
        self.absorb_ledger_events();
        result?;
        self.proceeds = proceeds;
        self.events.push(TokenEvent::Sale(SaleEvent::TokensPurchased {
            recipient: recipient.clone(),
            payment,
            tokens,
        }));
        tracing::debug!(%recipient, payment, tokens, block, "tokens purchased");
        Ok(tokens)
    }

    pub fn set_token_rate(&mut self, caller: &AccountId, rate: Amount) -> Result<(), SaleError> {
        self.ensure_owner(caller)?;
        let previous = std::mem::replace(&mut self.sale.token_rate, rate);
        self.events.push(TokenEvent::Sale(SaleEvent::RateChanged {
            previous,
            current: rate,
        }));
        tracing::info!(previous, current = rate, "token rate changed");
        Ok(())
    }

    /// Mints `amount` into the reserve. The new inventory is pending at
    /// `block` like any other credit.
    pub fn increase_reserve(
        &mut self,
        caller: &AccountId,
        amount: Amount,
        block: BlockHeight,
    ) -> Result<(), SaleError> {
        self.ensure_owner(caller)?;
        let reserve = self.sale.reserve.clone();
        let result = self.ledger.mint(&reserve, amount, block);
        self.absorb_ledger_events();
        result?;
        self.events
            .push(TokenEvent::Sale(SaleEvent::ReserveIncreased { amount, block }));
        tracing::info!(
            amount,
            block,
            total_supply = self.ledger.total_supply(),
            "reserve increased"
        );
        Ok(())
    }

    /// Moves reserve inventory to `to` outside of a sale. Subject to the same
    /// delay as every other debit.
    pub fn withdraw_reserve(
        &mut self,
        caller: &AccountId,
        to: &AccountId,
        amount: Amount,
        block: BlockHeight,
    ) -> Result<(), SaleError> {
        self.ensure_owner(caller)?;
        let reserve = self.sale.reserve.clone();
        let result = self.ledger.transfer(&reserve, to, amount, block);
        self.absorb_ledger_events();
        result?;
        tracing::info!(%to, amount, block, "reserve withdrawn");
        Ok(())
    }

    /// Pays every collected currency unit out to the owner.
    pub fn withdraw_proceeds(
        &mut self,
        caller: &AccountId,
        block: BlockHeight,
    ) -> Result<Amount, SaleError> {
        self.ensure_owner(caller)?;
        let amount = std::mem::take(&mut self.proceeds);
        self.events.push(TokenEvent::Sale(SaleEvent::ProceedsWithdrawn {
            to: self.sale.owner.clone(),
            amount,
        }));
        tracing::info!(owner = %self.sale.owner, amount, block, "proceeds withdrawn");
        Ok(amount)
    }

    pub fn transfer_ownership(
        &mut self,
        caller: &AccountId,
        new_owner: &AccountId,
    ) -> Result<(), SaleError> {
        self.ensure_owner(caller)?;
        if new_owner.is_empty() || *new_owner == self.sale.reserve {
            return Err(SaleError::InvalidOwner {
                account: new_owner.clone(),
            });
        }
        let previous = std::mem::replace(&mut self.sale.owner, new_owner.clone());
        tracing::info!(%previous, current = %new_owner, "ownership transferred");
        self.events
            .push(TokenEvent::Sale(SaleEvent::OwnershipTransferred {
                previous,
                current: new_owner.clone(),
            }));
        Ok(())
    }

    pub fn events(&self) -> &[TokenEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<TokenEvent> {
        std::mem::take(&mut self.events)
    }

    fn ensure_owner(&self, caller: &AccountId) -> Result<(), SaleError> {
        if *caller != self.sale.owner {
            tracing::warn!(%caller, "owner-only operation refused");
            return Err(SaleError::Unauthorized {
                caller: caller.clone(),
            });
        }
        Ok(())
    }

    // The reserve is the token's own account; only sales and the owner move it.
    fn ensure_not_reserve(&self, caller: &AccountId) -> Result<(), SaleError> {
        if *caller == self.sale.reserve {
            tracing::warn!(%caller, "direct call as reserve refused");
            return Err(SaleError::Unauthorized {
                caller: caller.clone(),
            });
        }
        Ok(())
    }

    fn absorb_ledger_events(&mut self) {
        self.events
            .extend(self.ledger.take_events().into_iter().map(TokenEvent::Ledger));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> AccountId {
        name.to_string()
    }

    fn token_with_reserve(reserve_supply: Amount, rate: Amount) -> Token {
        Token::deploy(&TokenConfig {
            reserve_supply,
            token_rate: rate,
            ..TokenConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn deploy_credits_owner_and_reserve() {
        let token = token_with_reserve(1_000, 0);
        assert_eq!(token.name(), "BlockSpendersERC20");
        assert_eq!(token.symbol(), "asd");
        assert_eq!(token.decimals(), 18);
        assert_eq!(token.owner(), "owner");
        assert_eq!(token.balance_of(&id("owner")), 100_000_000_000_000_000_000);
        assert_eq!(token.balance_of(&id("reserve")), 1_000);
        assert_eq!(token.total_supply(), 100_000_000_000_000_000_000 + 1_000);
        assert_eq!(token.spendable_balance_of(&id("reserve"), 0), 1_000);
    }

    #[test]
    fn purchase_at_rate() {
        let mut token = token_with_reserve(1_000_000, 1_000);
        let bought = token
            .buy_tokens_for_address(&id("buyer"), 100_000_000, 1)
            .unwrap();
        assert_eq!(bought, 100_000);
        assert_eq!(token.balance_of(&id("buyer")), 100_000);
        assert_eq!(token.balance_of(&id("reserve")), 900_000);
        assert_eq!(token.proceeds(), 100_000_000);
        assert!(matches!(
            token.events().last(),
            Some(TokenEvent::Sale(SaleEvent::TokensPurchased { tokens: 100_000, .. }))
        ));
    }

    #[test]
    fn purchase_keeps_remainder_as_proceeds() {
        let mut token = token_with_reserve(10, 1_000);
        assert_eq!(token.buy_tokens_for_address(&id("buyer"), 2_500, 1), Ok(2));
        assert_eq!(token.proceeds(), 2_500);
    }

    #[test]
    fn purchase_requires_rate() {
        let mut token = token_with_reserve(1_000, 0);
        assert_eq!(
            token.buy_tokens_for_address(&id("buyer"), 5_000, 1),
            Err(SaleError::RateNotSet)
        );
        assert_eq!(token.proceeds(), 0);
    }

    #[test]
    fn purchase_beyond_reserve_fails_without_taking_payment() {
        let mut token = token_with_reserve(10, 1);
        assert_eq!(
            token.buy_tokens_for_address(&id("buyer"), 11, 1),
            Err(SaleError::InsufficientReserve {
                eligible: 10,
                requested: 11,
            })
        );
        assert_eq!(token.proceeds(), 0);
        assert_eq!(token.balance_of(&id("buyer")), 0);
    }

    #[test]
    fn reserve_cannot_buy_its_own_inventory() {
        let mut token = token_with_reserve(100, 1);
        assert_eq!(
            token.buy_tokens_for_address(&id("reserve"), 50, 3),
            Err(SaleError::InvalidRecipient {
                account: id("reserve"),
            })
        );
        assert_eq!(token.proceeds(), 0);
        assert_eq!(token.spendable_balance_of(&id("reserve"), 3), 100);
        assert_eq!(token.buy_tokens_for_address(&id("buyer"), 60, 3), Ok(60));
    }

    #[test]
    fn freshly_minted_reserve_is_not_for_sale_in_same_block() {
        let mut token = token_with_reserve(0, 1);
        token.increase_reserve(&id("owner"), 500, 4).unwrap();
        assert_eq!(token.total_supply(), 100_000_000_000_000_000_500);
        assert_eq!(
            token.buy_tokens_for_address(&id("buyer"), 1, 4),
            Err(SaleError::InsufficientReserve {
                eligible: 0,
                requested: 1,
            })
        );
        assert!(matches!(
            token.withdraw_reserve(&id("owner"), &id("owner"), 1, 4),
            Err(SaleError::Ledger(
                LedgerError::InsufficientSpendableBalance { .. }
            ))
        ));
        assert_eq!(token.buy_tokens_for_address(&id("buyer"), 500, 5), Ok(500));
    }

    #[test]
    fn owner_only_operations_reject_strangers() {
        let mut token = token_with_reserve(0, 1);
        let stranger = id("mallory");
        let refused = SaleError::Unauthorized {
            caller: stranger.clone(),
        };
        assert_eq!(token.set_token_rate(&stranger, 9), Err(refused.clone()));
        assert_eq!(
            token.increase_reserve(&stranger, 9, 1),
            Err(refused.clone())
        );
        assert_eq!(token.withdraw_proceeds(&stranger, 1), Err(refused.clone()));
        assert_eq!(
            token.transfer_ownership(&stranger, &stranger),
            Err(refused)
        );
        assert_eq!(token.token_rate(), 1);
        assert_eq!(token.total_supply(), 100_000_000_000_000_000_000);
    }

    #[test]
    fn withdraw_proceeds_drains_to_owner() {
        let mut token = token_with_reserve(100, 10);
        token.buy_tokens_for_address(&id("buyer"), 500, 1).unwrap();
        assert_eq!(token.withdraw_proceeds(&id("owner"), 2), Ok(500));
        assert_eq!(token.proceeds(), 0);
        assert_eq!(token.withdraw_proceeds(&id("owner"), 3), Ok(0));
    }

    #[test]
    fn rate_can_pause_and_resume_sales() {
        let mut token = token_with_reserve(100, 10);
        token.set_token_rate(&id("owner"), 0).unwrap();
        assert_eq!(
            token.buy_tokens_for_address(&id("buyer"), 50, 1),
            Err(SaleError::RateNotSet)
        );
        token.set_token_rate(&id("owner"), 5).unwrap();
        assert_eq!(token.buy_tokens_for_address(&id("buyer"), 50, 1), Ok(10));
    }

    #[test]
    fn ownership_transfer_moves_admin_rights() {
        let mut token = token_with_reserve(0, 1);
        token
            .transfer_ownership(&id("owner"), &id("successor"))
            .unwrap();
        assert_eq!(token.owner(), "successor");
        assert!(token.set_token_rate(&id("owner"), 2).is_err());
        token.set_token_rate(&id("successor"), 2).unwrap();
    }

    #[test]
    fn ownership_cannot_pass_to_reserve_or_nobody() {
        let mut token = token_with_reserve(0, 1);
        assert_eq!(
            token.transfer_ownership(&id("owner"), &id("reserve")),
            Err(SaleError::InvalidOwner {
                account: id("reserve"),
            })
        );
        assert_eq!(
            token.transfer_ownership(&id("owner"), &id("")),
            Err(SaleError::InvalidOwner { account: id("") })
        );
        assert_eq!(token.owner(), "owner");
        assert!(token.events().is_empty());
    }

    #[test]
    fn reserve_cannot_act_as_caller() {
        let mut token = token_with_reserve(100, 1);
        assert!(matches!(
            token.transfer(&id("reserve"), &id("mallory"), 10, 1),
            Err(SaleError::Unauthorized { .. })
        ));
        assert!(token.approve(&id("reserve"), &id("mallory"), 10).is_err());
        assert_eq!(token.balance_of(&id("reserve")), 100);
    }

    #[test]
    fn ledger_events_are_collected_in_order() {
        let mut token = token_with_reserve(100, 1);
        token.approve(&id("owner"), &id("spender"), 5).unwrap();
        token.buy_tokens_for_address(&id("buyer"), 3, 1).unwrap();
        let events = token.take_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TokenEvent::Ledger(LedgerEvent::Approval { .. })));
        assert!(matches!(events[1], TokenEvent::Ledger(LedgerEvent::Transfer { .. })));
        assert!(matches!(events[2], TokenEvent::Sale(SaleEvent::TokensPurchased { .. })));
        assert!(token.events().is_empty());
    }

    #[test]
    fn state_survives_json_round_trip() {
        let mut token = token_with_reserve(100, 1);
        token.transfer(&id("owner"), &id("alice"), 7, 3).unwrap();
        token.take_events();
        let encoded = serde_json::to_string(&token).unwrap();
        let decoded: Token = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, token);
        assert_eq!(decoded.spendable_balance_of(&id("alice"), 3), 0);
    }
}
