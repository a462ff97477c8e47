/// Bin every account receives payments into unless told otherwise.
pub const DEFAULT_BIN_NAME: &str = "@default";
/// Bin that receives change outputs of transactions built by the vault.
pub const CHANGE_BIN_NAME: &str = "@change";

pub const CHANGE_BIN_INDEX: u32 = 1;
pub const DEFAULT_BIN_INDEX: u32 = 2;

pub const ENTROPY_LEN: usize = 32;

/// Largest n for a P2SH m-of-n redeem script (520 byte push limit).
pub const MAX_MULTISIG_KEYS: usize = 15;

pub const DEFAULT_UNUSED_POOL_SIZE: u32 = 25;

pub const STORE_FORMAT_VERSION: u32 = 1;
pub const EXPORT_FORMAT_VERSION: u32 = 1;

pub const CHANGE_LABEL: &str = "change";
