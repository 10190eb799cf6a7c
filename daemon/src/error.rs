use thiserror::Error;

use agbot_common::crypto::CryptoError;
use agbot_common::messages::MessageError;
use agbot_common::policy::PolicyError;

use crate::exchange::ExchangeError;
use crate::ledger::LedgerError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
