//! Transaction builder and signer.
//!
//! A vault transaction is stored unsigned and collects signatures keychain by
//! keychain. Its status only moves forward:
//! `Unsigned -> PartiallySigned -> Signed -> Broadcast`.

mod builder;
mod exchange;
mod signer;

use std::fmt;

use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, OutPoint, ScriptBuf, Sequence, Txid,
    Witness,
};
use serde::{Deserialize, Serialize};

use crate::{error::Result, ledger};

pub(crate) use builder::TxBuilder;
pub(crate) use exchange::{export_psbt, TxExchange};
pub(crate) use signer::{signed_transaction, TxSigner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Unsigned,
    PartiallySigned,
    Signed,
    Broadcast,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Unsigned => "UNSIGNED",
            TxStatus::PartiallySigned => "PARTIALLY_SIGNED",
            TxStatus::Signed => "SIGNED",
            TxStatus::Broadcast => "BROADCAST",
        };
        f.write_str(s)
    }
}

/// Destination of a transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub script: ScriptBuf,
    pub value: u64,
}

impl OutputSpec {
    pub fn new(script: ScriptBuf, value: u64) -> Self {
        Self { script, value }
    }
}

/// Parameters of [`Vault::create_tx`](crate::Vault::create_tx).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub version: i32,
    pub lock_time: u32,
    /// Outputs to spend. Empty lets the builder select inputs, if
    /// `auto_select` allows it.
    pub inputs: Vec<u64>,
    pub outputs: Vec<OutputSpec>,
    pub fee: u64,
    /// Bin receiving change; `@change` when unset.
    pub change_bin: Option<String>,
    pub auto_select: bool,
}

impl TxRequest {
    pub fn new(outputs: Vec<OutputSpec>, fee: u64) -> Self {
        Self {
            version: 1,
            lock_time: 0,
            inputs: Vec::new(),
            outputs,
            fee,
            change_bin: None,
            auto_select: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSignature {
    pub keychain_id: u64,
    pub pubkey: bitcoin::secp256k1::PublicKey,
    /// DER signature followed by the sighash type byte.
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub txout_id: u64,
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_id: u64,
    /// Valid signatures, in the key order of the redeem script.
    pub signatures: Vec<InputSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOutput {
    pub txout_id: u64,
    pub vout: u32,
    pub value: u64,
}

/// A transaction built by the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub account_id: u64,
    pub version: i32,
    pub lock_time: u32,
    pub inputs: Vec<TxInput>,
    /// Includes the change output, if any.
    pub outputs: Vec<OutputSpec>,
    pub fee: u64,
    pub change: Option<ChangeOutput>,
    pub status: TxStatus,
    /// Set once broadcast.
    pub txid: Option<Txid>,
}

impl Transaction {
    pub fn total_in(&self) -> Result<u64> {
        ledger::sum_amounts(self.inputs.iter().map(|i| i.value))
    }

    pub fn total_out(&self) -> Result<u64> {
        ledger::sum_amounts(self.outputs.iter().map(|o| o.value))
    }

    pub fn change_value(&self) -> u64 {
        self.change.map(|c| c.value).unwrap_or_default()
    }

    /// The transaction with empty scriptSigs.
    pub fn unsigned_tx(&self) -> bitcoin::Transaction {
        let sequence = if self.lock_time == 0 {
            Sequence::MAX
        } else {
            Sequence::ENABLE_LOCKTIME_NO_RBF
        };
        bitcoin::Transaction {
            version: Version(self.version),
            lock_time: LockTime::from_consensus(self.lock_time),
            input: self
                .inputs
                .iter()
                .map(|i| bitcoin::TxIn {
                    previous_output: i.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence,
                    witness: Witness::default(),
                })
                .collect(),
            output: self
                .outputs
                .iter()
                .map(|o| bitcoin::TxOut {
                    value: Amount::from_sat(o.value),
                    script_pubkey: o.script.clone(),
                })
                .collect(),
        }
    }
}
