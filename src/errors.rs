//! Error types for the connectivity core

use thiserror::Error;

pub type ChandlerResult<T> = Result<T, ChandlerError>;

/// Errors returned from the Chandler session pipelines.
#[derive(Error, Debug)]
pub enum ChandlerError {
    #[error("invalid advertisement: {0}")]
    InvalidAdvertisement(String),

    #[error("gateway {0} denied by trust policy")]
    TrustDenied(String),

    #[error("no pricing option matches an accepted mint")]
    NoCompatiblePricing,

    #[error("insufficient funds: need {needed} sats, have {available} sats")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("price {price_per_unit} sat/{unit} exceeds budget {max_per_unit} sat/{unit}")]
    BudgetExceeded {
        price_per_unit: f64,
        max_per_unit: f64,
        unit: &'static str,
    },

    #[error("payment rejected by gateway: {0}")]
    PaymentRejected(String),

    #[error("payment transport failure: {0}")]
    PaymentTransport(String),

    #[error("invalid session response: {0}")]
    SessionInvalidResponse(String),

    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("config error: {0}")]
    Config(String),
}

/// Errors surfaced by wallet implementations.
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("mint not known to wallet: {0}")]
    UnknownMint(String),

    #[error("insufficient funds at {mint}: need {needed} sats, have {available} sats")]
    InsufficientFunds {
        mint: String,
        needed: u64,
        available: u64,
    },

    #[error("wallet storage error: {0}")]
    Storage(String),

    #[error("wallet backend error: {0}")]
    Backend(String),
}

/// Errors from parsing or building signed protocol events.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("expected event kind {expected}, got {got}")]
    WrongKind { expected: u16, got: u16 },

    #[error("invalid event signature")]
    BadSignature,

    #[error("missing required tag: {0}")]
    MissingTag(&'static str),

    #[error("invalid tag value: {0}")]
    InvalidTag(String),
}

/// Errors from a single gateway probe.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,

    #[error("probe cancelled")]
    Cancelled,

    #[error("gateway returned status {0}")]
    Status(u16),

    #[error("probe transport failure: {0}")]
    Transport(String),
}

/// Errors from the radio / link configuration surface.
#[derive(Error, Debug)]
pub enum RadioError {
    #[error("scan failed: {0}")]
    Scan(String),

    #[error("radio command failed: {0}")]
    Command(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors loading the daemon configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}
