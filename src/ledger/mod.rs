use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type AccountId = String;
pub type Amount = u128;
pub type BlockHeight = u64;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error(
        "insufficient spendable balance in account {account}: eligible {eligible}, requested {requested}"
    )]
    InsufficientSpendableBalance {
        account: AccountId,
        eligible: Amount,
        requested: Amount,
    },
    #[error(
        "insufficient allowance for {spender} over {owner}: approved {approved}, requested {requested}"
    )]
    InsufficientAllowance {
        owner: AccountId,
        spender: AccountId,
        approved: Amount,
        requested: Amount,
    },
    #[error("arithmetic overflow in {context}")]
    Overflow { context: &'static str },
}

/// Holdings of a single account, split by how recently they arrived.
///
/// `pending` is whatever was credited at `pending_block`. Once the chain
/// moves past that height the pending amount is logically spendable, but it
/// is only folded into `spendable` by the next credit or debit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountEntry {
    pub spendable: Amount,
    pub pending: Amount,
    pub pending_block: Option<BlockHeight>,
}

impl AccountEntry {
    /// Total holdings regardless of age.
    pub fn total(&self) -> Amount {
        self.spendable.saturating_add(self.pending)
    }

    /// Whether the pending amount was credited strictly before `block`.
    ///
    /// A height that runs backwards relative to `pending_block` is treated as
    /// the same block, so the pending amount stays locked.
    pub fn pending_is_aged(&self, block: BlockHeight) -> bool {
        self.pending_block.map_or(true, |credited| credited < block)
    }

    /// Amount that a debit at `block` may draw on.
    pub fn eligible(&self, block: BlockHeight) -> Result<Amount, LedgerError> {
        if self.pending_is_aged(block) {
            self.spendable
                .checked_add(self.pending)
                .ok_or(LedgerError::Overflow {
                    context: "eligible balance",
                })
        } else {
            Ok(self.spendable)
        }
    }

    fn roll_over(&mut self, block: BlockHeight) -> Result<(), LedgerError> {
        if self.pending_is_aged(block) && self.pending > 0 {
            self.spendable =
                self.spendable
                    .checked_add(self.pending)
                    .ok_or(LedgerError::Overflow {
                        context: "pending roll-over",
                    })?;
            self.pending = 0;
        }
        Ok(())
    }

    fn credit(&mut self, amount: Amount, block: BlockHeight) -> Result<(), LedgerError> {
        let aged = self.pending_is_aged(block);
        self.roll_over(block)?;
        self.pending = self
            .pending
            .checked_add(amount)
            .ok_or(LedgerError::Overflow { context: "credit" })?;
        self.spendable
            .checked_add(self.pending)
            .ok_or(LedgerError::Overflow { context: "credit" })?;
        if aged {
            self.pending_block = Some(block);
        }
        Ok(())
    }

    fn debit(
        &mut self,
        account: &AccountId,
        amount: Amount,
        block: BlockHeight,
    ) -> Result<(), LedgerError> {
        let eligible = self.eligible(block)?;
        if amount > eligible {
            return Err(LedgerError::InsufficientSpendableBalance {
                account: account.clone(),
                eligible,
                requested: amount,
            });
        }
        self.roll_over(block)?;
        self.spendable -= amount;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Transfer {
        from: AccountId,
        to: AccountId,
        #[serde(with = "u128_str")]
        amount: Amount,
    },
    Approval {
        owner: AccountId,
        spender: AccountId,
        #[serde(with = "u128_str")]
        amount: Amount,
    },
    Mint {
        to: AccountId,
        #[serde(with = "u128_str")]
        amount: Amount,
        block: BlockHeight,
    },
}

impl LedgerEvent {
    pub(crate) fn commit(&self, hasher: &mut Sha256) {
        match self {
            LedgerEvent::Transfer { from, to, amount } => {
                hasher.update(b"transfer");
                hasher.update(from.as_bytes());
                hasher.update(to.as_bytes());
                hasher.update(amount.to_le_bytes());
            }
            LedgerEvent::Approval {
                owner,
                spender,
                amount,
            } => {
                hasher.update(b"approval");
                hasher.update(owner.as_bytes());
                hasher.update(spender.as_bytes());
                hasher.update(amount.to_le_bytes());
            }
            LedgerEvent::Mint { to, amount, block } => {
                hasher.update(b"mint");
                hasher.update(to.as_bytes());
                hasher.update(amount.to_le_bytes());
                hasher.update(block.to_le_bytes());
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub total_supply: Amount,
    pub accounts: BTreeMap<AccountId, AccountEntry>,
    pub allowances: BTreeMap<AccountId, BTreeMap<AccountId, Amount>>,
    #[serde(with = "crate::ledger::serde_hex")]
    pub merkle_root: [u8; 32],
}

/// Account table enforcing the receive-then-spend delay.
///
/// Every balance change goes through the crate-private `credit` and `debit`
/// primitives. Neither touches `total_supply`, so they stay behind
/// [`Ledger::transfer`], which pairs them so value is conserved, and
/// [`Ledger::mint`], the only path besides genesis that grows the supply.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Ledger {
    accounts: BTreeMap<AccountId, AccountEntry>,
    allowances: BTreeMap<AccountId, BTreeMap<AccountId, Amount>>,
    total_supply: Amount,
    #[serde(skip)]
    events: Vec<LedgerEvent>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Founding allocation, credited straight to `spendable` so the first
    /// block after deployment does not see it as pending.
    pub fn allocate_genesis(
        &mut self,
        account: &AccountId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        let supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(LedgerError::Overflow {
                context: "total supply",
            })?;
        let mut entry = self.accounts.get(account).cloned().unwrap_or_default();
        entry.spendable = entry
            .spendable
            .checked_add(amount)
            .ok_or(LedgerError::Overflow {
                context: "genesis allocation",
            })?;
        self.accounts.insert(account.clone(), entry);
        self.total_supply = supply;
        tracing::debug!(%account, amount, "genesis allocation");
        Ok(())
    }

    pub(crate) fn credit(
        &mut self,
        account: &AccountId,
        amount: Amount,
        block: BlockHeight,
    ) -> Result<(), LedgerError> {
        let mut entry = self.accounts.get(account).cloned().unwrap_or_default();
        entry.credit(amount, block)?;
        self.accounts.insert(account.clone(), entry);
        tracing::debug!(%account, amount, block, "credit");
        Ok(())
    }

    pub(crate) fn debit(
        &mut self,
        account: &AccountId,
        amount: Amount,
        block: BlockHeight,
    ) -> Result<(), LedgerError> {
        let mut entry = self.accounts.get(account).cloned().unwrap_or_default();
        if let Err(err) = entry.debit(account, amount, block) {
            tracing::warn!(%account, amount, block, error = %err, "debit rejected");
            return Err(err);
        }
        // A zero debit against an unknown account must not create an entry.
        if let Some(slot) = self.accounts.get_mut(account) {
            *slot = entry;
        }
        tracing::debug!(%account, amount, block, "debit");
        Ok(())
    }

    pub fn transfer(
        &mut self,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
        block: BlockHeight,
    ) -> Result<(), LedgerError> {
        let saved = self.accounts.get(from).cloned();
        self.debit(from, amount, block)?;
        if let Err(err) = self.credit(to, amount, block) {
            match saved {
                Some(entry) => self.accounts.insert(from.clone(), entry),
                None => self.accounts.remove(from),
            };
            return Err(err);
        }
        self.events.push(LedgerEvent::Transfer {
            from: from.clone(),
            to: to.clone(),
            amount,
        });
        Ok(())
    }

    /// Moves `amount` from `owner` to `to` on behalf of `spender`, consuming
    /// exactly `amount` of the approved allowance.
    pub fn transfer_from(
        &mut self,
        spender: &AccountId,
        owner: &AccountId,
        to: &AccountId,
        amount: Amount,
        block: BlockHeight,
    ) -> Result<(), LedgerError> {
        let approved = self.allowance(owner, spender);
        if approved < amount {
            tracing::warn!(%owner, %spender, approved, amount, "allowance exceeded");
            return Err(LedgerError::InsufficientAllowance {
                owner: owner.clone(),
                spender: spender.clone(),
                approved,
                requested: amount,
            });
        }
        self.transfer(owner, to, amount, block)?;
        self.set_allowance(owner, spender, approved - amount);
        Ok(())
    }

    pub fn approve(&mut self, owner: &AccountId, spender: &AccountId, amount: Amount) {
        self.set_allowance(owner, spender, amount);
        self.events.push(LedgerEvent::Approval {
            owner: owner.clone(),
            spender: spender.clone(),
            amount,
        });
        tracing::debug!(%owner, %spender, amount, "approval");
    }

    pub fn increase_allowance(
        &mut self,
        owner: &AccountId,
        spender: &AccountId,
        added: Amount,
    ) -> Result<(), LedgerError> {
        let amount = self
            .allowance(owner, spender)
            .checked_add(added)
            .ok_or(LedgerError::Overflow {
                context: "allowance",
            })?;
        self.approve(owner, spender, amount);
        Ok(())
    }

    pub fn decrease_allowance(
        &mut self,
        owner: &AccountId,
        spender: &AccountId,
        subtracted: Amount,
    ) -> Result<(), LedgerError> {
        let approved = self.allowance(owner, spender);
        let amount =
            approved
                .checked_sub(subtracted)
                .ok_or_else(|| LedgerError::InsufficientAllowance {
                    owner: owner.clone(),
                    spender: spender.clone(),
                    approved,
                    requested: subtracted,
                })?;
        self.approve(owner, spender, amount);
        Ok(())
    }

    /// Credits freshly issued tokens to `account` as pending at `block`.
    pub fn mint(
        &mut self,
        account: &AccountId,
        amount: Amount,
        block: BlockHeight,
    ) -> Result<(), LedgerError> {
        let supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(LedgerError::Overflow {
                context: "total supply",
            })?;
        self.credit(account, amount, block)?;
        self.total_supply = supply;
        self.events.push(LedgerEvent::Mint {
            to: account.clone(),
            amount,
            block,
        });
        Ok(())
    }

    /// Total holdings, spendable plus pending. Read-only; never rolls over.
    pub fn balance_of(&self, account: &AccountId) -> Amount {
        self.accounts.get(account).map_or(0, AccountEntry::total)
    }

    /// What a debit at `block` could draw from `account`.
    pub fn spendable_balance_of(&self, account: &AccountId, block: BlockHeight) -> Amount {
        self.accounts
            .get(account)
            .and_then(|entry| entry.eligible(block).ok())
            .unwrap_or(0)
    }

    pub fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Amount {
        self.allowances
            .get(owner)
            .and_then(|spenders| spenders.get(spender))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_supply(&self) -> Amount {
        self.total_supply
    }

    pub fn account(&self, account: &AccountId) -> Option<&AccountEntry> {
        self.accounts.get(account)
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&AccountId, &AccountEntry)> {
        self.accounts.iter()
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<LedgerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            total_supply: self.total_supply,
            accounts: self.accounts.clone(),
            allowances: self.allowances.clone(),
            merkle_root: compute_merkle_root(&self.accounts, &self.allowances),
        }
    }

    fn set_allowance(&mut self, owner: &AccountId, spender: &AccountId, amount: Amount) {
        self.allowances
            .entry(owner.clone())
            .or_default()
            .insert(spender.clone(), amount);
    }
}

/// Amounts as decimal strings. Internally tagged enums buffer through serde's
/// content model, which has no 128-bit integers, and TOML tops out at `i64`.
pub(crate) mod u128_str {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.trim().parse::<u128>().map_err(D::Error::custom)
    }
}

pub(crate) mod serde_hex {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&encoded, &mut out).map_err(D::Error::custom)?;
        Ok(out)
    }
}

fn compute_merkle_root(
    accounts: &BTreeMap<AccountId, AccountEntry>,
    allowances: &BTreeMap<AccountId, BTreeMap<AccountId, Amount>>,
) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::new();
    for (account, entry) in accounts {
        let mut hasher = Sha256::new();
        hasher.update(b"acct");
        hasher.update(account.as_bytes());
        hasher.update(entry.spendable.to_le_bytes());
        hasher.update(entry.pending.to_le_bytes());
        match entry.pending_block {
            Some(block) => {
                hasher.update([1u8]);
                hasher.update(block.to_le_bytes());
            }
            None => hasher.update([0u8]),
        }
        leaves.push(hasher.finalize().into());
    }
    for (owner, spenders) in allowances {
        for (spender, amount) in spenders {
            let mut hasher = Sha256::new();
            hasher.update(b"allowance");
            hasher.update(owner.as_bytes());
            hasher.update(spender.as_bytes());
            hasher.update(amount.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
    }
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"unspendable-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}
