use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ledger::{serde_hex, u128_str, AccountId, Amount, BlockHeight};
use crate::sale::{SaleError, Token, TokenEvent};

/// One operation inside a transaction. The caller and block height come from
/// the enclosing [`Transaction`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Call {
    Transfer {
        to: AccountId,
        #[serde(with = "u128_str")]
        amount: Amount,
    },
    TransferFrom {
        owner: AccountId,
        to: AccountId,
        #[serde(with = "u128_str")]
        amount: Amount,
    },
    Approve {
        spender: AccountId,
        #[serde(with = "u128_str")]
        amount: Amount,
    },
    IncreaseAllowance {
        spender: AccountId,
        #[serde(with = "u128_str")]
        amount: Amount,
    },
    DecreaseAllowance {
        spender: AccountId,
        #[serde(with = "u128_str")]
        amount: Amount,
    },
    /// Spends the payment attached to the transaction.
    BuyTokensForAddress { recipient: AccountId },
    SetTokenRate {
        #[serde(with = "u128_str")]
        rate: Amount,
    },
    IncreaseReserve {
        #[serde(with = "u128_str")]
        amount: Amount,
    },
    WithdrawReserve {
        to: AccountId,
        #[serde(with = "u128_str")]
        amount: Amount,
    },
    WithdrawProceeds,
    TransferOwnership { new_owner: AccountId },
}

impl Call {
    fn commit(&self, hasher: &mut Sha256) {
        fn field(hasher: &mut Sha256, bytes: &[u8]) {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        match self {
            Call::Transfer { to, amount } => {
                field(hasher, b"transfer");
                field(hasher, to.as_bytes());
                field(hasher, &amount.to_le_bytes());
            }
            Call::TransferFrom { owner, to, amount } => {
                field(hasher, b"transfer_from");
                field(hasher, owner.as_bytes());
                field(hasher, to.as_bytes());
                field(hasher, &amount.to_le_bytes());
            }
            Call::Approve { spender, amount } => {
                field(hasher, b"approve");
                field(hasher, spender.as_bytes());
                field(hasher, &amount.to_le_bytes());
            }
            Call::IncreaseAllowance { spender, amount } => {
                field(hasher, b"increase_allowance");
                field(hasher, spender.as_bytes());
                field(hasher, &amount.to_le_bytes());
            }
            Call::DecreaseAllowance { spender, amount } => {
                field(hasher, b"decrease_allowance");
                field(hasher, spender.as_bytes());
                field(hasher, &amount.to_le_bytes());
            }
            Call::BuyTokensForAddress { recipient } => {
                field(hasher, b"buy_tokens_for_address");
                field(hasher, recipient.as_bytes());
            }
            Call::SetTokenRate { rate } => {
                field(hasher, b"set_token_rate");
                field(hasher, &rate.to_le_bytes());
            }
            Call::IncreaseReserve { amount } => {
                field(hasher, b"increase_reserve");
                field(hasher, &amount.to_le_bytes());
            }
            Call::WithdrawReserve { to, amount } => {
                field(hasher, b"withdraw_reserve");
                field(hasher, to.as_bytes());
                field(hasher, &amount.to_le_bytes());
            }
            Call::WithdrawProceeds => field(hasher, b"withdraw_proceeds"),
            Call::TransferOwnership { new_owner } => {
                field(hasher, b"transfer_ownership");
                field(hasher, new_owner.as_bytes());
            }
        }
    }
}

/// A single atomic unit of execution: every call succeeds or none of them
/// leave a trace.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub caller: AccountId,
    pub block: BlockHeight,
    /// Base currency attached to the transaction.
    #[serde(default, with = "u128_str")]
    pub payment: Amount,
    pub calls: Vec<Call>,
}

impl Transaction {
    pub fn new(caller: impl Into<AccountId>, block: BlockHeight, calls: Vec<Call>) -> Self {
        Self {
            caller: caller.into(),
            block,
            payment: 0,
            calls,
        }
    }

    pub fn with_payment(mut self, payment: Amount) -> Self {
        self.payment = payment;
        self
    }

    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"tx");
        hasher.update(self.caller.as_bytes());
        hasher.update(self.block.to_le_bytes());
        hasher.update(self.payment.to_le_bytes());
        hasher.update((self.calls.len() as u64).to_le_bytes());
        for call in &self.calls {
            call.commit(&mut hasher);
        }
        hasher.finalize().into()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    #[error(transparent)]
    Sale(#[from] SaleError),
    #[error("payment of {amount} attached but no purchase consumed it")]
    UnconsumedPayment { amount: Amount },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReceiptOutcome {
    Accepted {
        events: Vec<TokenEvent>,
        /// Proceeds paid out by `withdraw_proceeds` calls.
        #[serde(with = "u128_str")]
        paid_out: Amount,
    },
    Rejected {
        /// Index of the failing call; `None` when the transaction as a whole
        /// was refused.
        call_index: Option<usize>,
        reason: String,
    },
}

impl ReceiptOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReceiptOutcome::Accepted { .. })
    }

    fn commit(&self, hasher: &mut Sha256) {
        match self {
            ReceiptOutcome::Accepted { events, paid_out } => {
                hasher.update(b"accepted");
                hasher.update((events.len() as u64).to_le_bytes());
                for event in events {
                    match event {
                        TokenEvent::Ledger(inner) => inner.commit(hasher),
                        TokenEvent::Sale(inner) => inner.commit(hasher),
                    }
                }
                hasher.update(paid_out.to_le_bytes());
            }
            ReceiptOutcome::Rejected { call_index, reason } => {
                hasher.update(b"rejected");
                hasher.update(call_index.map_or(u64::MAX, |idx| idx as u64).to_le_bytes());
                hasher.update(reason.as_bytes());
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    #[serde(with = "serde_hex")]
    pub tx_digest: [u8; 32],
    pub caller: AccountId,
    pub block: BlockHeight,
    pub outcome: ReceiptOutcome,
}

impl Receipt {
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.tx_digest);
        self.outcome.commit(&mut hasher);
        hasher.finalize().into()
    }
}

impl Token {
    /// Runs `tx` against a staged copy of the token and commits the copy only
    /// if every call succeeds.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Receipt {
        let tx_digest = tx.digest();
        let mut staged = self.clone();
        staged.take_events();
        let outcome = match staged.run_calls(tx) {
            Ok(paid_out) => {
                let events = staged.take_events();
                *self = staged;
                tracing::debug!(
                    caller = %tx.caller,
                    block = tx.block,
                    calls = tx.calls.len(),
                    events = events.len(),
                    "transaction accepted"
                );
                ReceiptOutcome::Accepted { events, paid_out }
            }
            Err((call_index, err)) => {
                tracing::warn!(
                    caller = %tx.caller,
                    block = tx.block,
                    call_index = ?call_index,
                    error = %err,
                    "transaction rejected"
                );
                ReceiptOutcome::Rejected {
                    call_index,
                    reason: err.to_string(),
                }
            }
        };
        Receipt {
            tx_digest,
            caller: tx.caller.clone(),
            block: tx.block,
            outcome,
        }
    }

    fn run_calls(&mut self, tx: &Transaction) -> Result<Amount, (Option<usize>, TxError)> {
        let mut payment = tx.payment;
        let mut paid_out: Amount = 0;
        for (idx, call) in tx.calls.iter().enumerate() {
            self.run_call(&tx.caller, tx.block, call, &mut payment, &mut paid_out)
                .map_err(|err| (Some(idx), TxError::from(err)))?;
        }
        if payment > 0 {
            return Err((None, TxError::UnconsumedPayment { amount: payment }));
        }
        Ok(paid_out)
    }

    fn run_call(
        &mut self,
        caller: &AccountId,
        block: BlockHeight,
        call: &Call,
        payment: &mut Amount,
        paid_out: &mut Amount,
    ) -> Result<(), SaleError> {
        match call {
            Call::Transfer { to, amount } => self.transfer(caller, to, *amount, block),
            Call::TransferFrom { owner, to, amount } => {
                self.transfer_from(caller, owner, to, *amount, block)
            }
            Call::Approve { spender, amount } => self.approve(caller, spender, *amount),
            Call::IncreaseAllowance { spender, amount } => {
                self.increase_allowance(caller, spender, *amount)
            }
            Call::DecreaseAllowance { spender, amount } => {
                self.decrease_allowance(caller, spender, *amount)
            }
            Call::BuyTokensForAddress { recipient } => {
                self.buy_tokens_for_address(recipient, *payment, block)?;
                *payment = 0;
                Ok(())
            }
            Call::SetTokenRate { rate } => self.set_token_rate(caller, *rate),
            Call::IncreaseReserve { amount } => self.increase_reserve(caller, *amount, block),
            Call::WithdrawReserve { to, amount } => {
                self.withdraw_reserve(caller, to, *amount, block)
            }
            Call::WithdrawProceeds => {
                let amount = self.withdraw_proceeds(caller, block)?;
                *paid_out = paid_out.saturating_add(amount);
                Ok(())
            }
            Call::TransferOwnership { new_owner } => self.transfer_ownership(caller, new_owner),
        }
    }
}
