//! Fungible token ledger that refuses to spend funds in the block they arrive.
//!
//! An account credited at height `N` cannot pass those tokens on until height
//! `N + 1`, which closes the window for same-block arbitrage and flash-loan
//! style extraction. On top of the ledger sits a small sale desk that sells
//! reserve inventory for base currency at an owner-set rate.
//!
//! * [`ledger`]: per-account spendable/pending bookkeeping, allowances and
//!   the snapshot merkle root.
//! * [`sale`]: the [`sale::Token`]: metadata, ownership, rate-based
//!   purchases, reserve minting and proceeds.
//! * [`tx`]: all-or-nothing execution of multi-call transactions with
//!   receipts.
//! * [`config`]: TOML deployment parameters.

pub mod config;
pub mod ledger;
pub mod sale;
pub mod tx;

pub use config::{ConfigError, TokenConfig};
pub use ledger::{AccountEntry, AccountId, Amount, BlockHeight, Ledger, LedgerError};
pub use sale::{SaleError, Token, TokenEvent};
pub use tx::{Call, Receipt, ReceiptOutcome, Transaction, TxError};
