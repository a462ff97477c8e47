//! Output ledger.
//!
//! Maps every script the vault can sign for to its owning
//! (account, bin, index) and tracks the outputs paying to those scripts.

mod manager;

use std::collections::HashSet;

use bitcoin::{Amount, OutPoint, Script, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

pub(crate) use manager::LedgerManager;

use crate::{
    error::{Error, Result},
    store::VaultRecords,
    tx::TxStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ScriptStatus {
    Unused,
    Issued,
    Used,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SigningScriptRecord {
    pub id: u64,
    pub account_id: u64,
    pub bin_id: u64,
    pub index: u32,
    pub script_pubkey: ScriptBuf,
    pub redeem_script: ScriptBuf,
    pub status: ScriptStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    /// Issued by the vault, not yet seen on chain.
    Pending,
    Unspent,
    Spent,
}

/// An output owned by one of the vault's accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub id: u64,
    pub account_id: u64,
    pub bin_id: u64,
    pub script_id: u64,
    /// Derivation index of the script within its bin.
    pub index: u32,
    pub script: ScriptBuf,
    pub value: u64,
    pub label: String,
    pub status: OutputStatus,
    pub outpoint: Option<OutPoint>,
    pub height: Option<u32>,
    pub spending_txid: Option<Txid>,
}

/// Where a script of the vault comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOwner {
    pub account: String,
    pub bin: String,
    pub index: u32,
}

pub(crate) fn outputs_for_account(
    records: &VaultRecords,
    account: &str,
    include_spent: bool,
) -> Result<Vec<TxOut>> {
    let account_id = records.account_id(account)?;
    Ok(records
        .txouts
        .values()
        .filter(|o| o.account_id == account_id)
        .filter(|o| include_spent || o.status != OutputStatus::Spent)
        .cloned()
        .collect())
}

/// Sum of the unspent outputs of an account.
pub(crate) fn balance(records: &VaultRecords, account: &str) -> Result<u64> {
    let account_id = records.account_id(account)?;
    sum_amounts(
        records
            .txouts
            .values()
            .filter(|o| o.account_id == account_id && o.status == OutputStatus::Unspent)
            .map(|o| o.value),
    )
}

pub(crate) fn resolve_script(records: &VaultRecords, script: &Script) -> Result<Option<ScriptOwner>> {
    let Some(record) = records.script_by_pubkey(script) else {
        return Ok(None);
    };
    let account = records.account(record.account_id)?;
    Ok(Some(ScriptOwner {
        account: account.name.clone(),
        bin: account.bin(record.bin_id)?.name.clone(),
        index: record.index,
    }))
}

/// Outputs referenced by stored transactions that were not broadcast yet.
pub(crate) fn reserved_outputs(records: &VaultRecords) -> HashSet<u64> {
    records
        .txs
        .values()
        .filter(|tx| tx.status != TxStatus::Broadcast)
        .flat_map(|tx| tx.inputs.iter().map(|i| i.txout_id))
        .collect()
}

/// Unspent, unreserved outputs of an account, oldest first.
pub(crate) fn spendable_outputs(records: &VaultRecords, account_id: u64) -> Vec<&TxOut> {
    let reserved = reserved_outputs(records);
    records
        .txouts
        .values()
        .filter(|o| o.account_id == account_id && is_spendable(o))
        .filter(|o| !reserved.contains(&o.id))
        .collect()
}

pub(crate) fn is_spendable(txout: &TxOut) -> bool {
    txout.status == OutputStatus::Unspent && txout.outpoint.is_some()
}

/// Rejects amounts above the total money supply.
pub(crate) fn check_amount(value: u64) -> Result<u64> {
    if value > Amount::MAX_MONEY.to_sat() {
        return Err(Error::InvalidAmount);
    }
    Ok(value)
}

pub(crate) fn sum_amounts(values: impl IntoIterator<Item = u64>) -> Result<u64> {
    values
        .into_iter()
        .try_fold(0u64, |acc, value| acc.checked_add(value))
        .ok_or(Error::InvalidAmount)
}
