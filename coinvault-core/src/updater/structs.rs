use bitcoin::{Amount, ScriptBuf};

/// An output paying to a script the scanner was asked to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundOutput {
    pub script_pubkey: ScriptBuf,
    pub value: Amount,
}
