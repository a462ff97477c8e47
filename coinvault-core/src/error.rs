use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Naming
    #[error("the name {0:?} is already in use")]
    DuplicateName(String),
    #[error("account {account:?} already has a bin named {bin:?}")]
    DuplicateBinName { account: String, bin: String },
    #[error("keychain content is already stored as {0:?}")]
    DuplicateKeychain(String),
    #[error("keychain {0:?} not found")]
    UnknownKeychain(String),
    #[error("account {0:?} not found")]
    UnknownAccount(String),
    #[error("account {account:?} has no bin named {bin:?}")]
    UnknownBin { account: String, bin: String },
    #[error("output {0} not found")]
    UnknownOutput(u64),
    #[error("transaction {0} not found")]
    UnknownTx(u64),

    // Key custody
    #[error("keychain {0:?} is locked")]
    KeychainLocked(String),
    #[error("chain codes are locked")]
    ChainCodesLocked,
    #[error("keychain {0:?} has no private key")]
    NoPrivateKey(String),
    #[error("invalid passphrase")]
    InvalidPassphrase,
    #[error("entropy must be 32 bytes, got {0}")]
    InvalidEntropy(usize),

    // Policy and amounts
    #[error("invalid signing policy: {minsigs} of {keychains}")]
    InvalidPolicy { minsigs: u32, keychains: usize },
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("invalid amount")]
    InvalidAmount,
    #[error("no outputs selected")]
    NoOutputsSelected,
    #[error("output {0} cannot be spent")]
    OutputNotSpendable(u64),
    #[error("no eligible keychains are unlocked")]
    NoEligibleKeychains,
    #[error("transaction {id} is {status}")]
    InvalidTxState { id: u64, status: String },

    // Vault state
    #[error("no vault is open")]
    VaultNotOpen,
    #[error("vault is busy")]
    VaultBusy,
    #[error("failed to open vault store: {0}")]
    StoreOpenError(String),
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("invalid export: {0}")]
    InvalidExport(String),
    #[error("{0} is not supported")]
    Unsupported(&'static str),

    // Wrapped external errors
    #[error(transparent)]
    Secp256k1(#[from] bitcoin::secp256k1::Error),
    #[error(transparent)]
    Bip32(#[from] bitcoin::bip32::Error),
    #[error("sighash: {0}")]
    Sighash(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    PushBytes(#[from] bitcoin::script::PushBytesError),
    #[error(transparent)]
    Psbt(#[from] bitcoin::psbt::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
