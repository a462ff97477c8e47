//! PSBT exchange between co-signers.
//!
//! A vault transaction travels as a PSBT carrying, per input, the redeem
//! script, the spent output and the signatures gathered so far. The receiving
//! vault keeps only the signatures it can verify against its own copy of the
//! account.

use std::collections::HashSet;

use bitcoin::{
    psbt::{Psbt, PsbtSighashType},
    secp256k1::{All, Secp256k1},
    sighash::{EcdsaSighashType, SighashCache},
    Amount,
};

use super::{
    signer::{key_position, signing_message, status_of, verify},
    InputSignature, OutputSpec, Transaction, TxInput, TxStatus,
};
use crate::{
    account::AccountRecord,
    error::{Error, Result},
    ledger::{self, SigningScriptRecord},
    script::redeem_script_pubkeys,
    store::VaultRecords,
    vault::{VaultEvent, WorkingSet},
};

pub(crate) fn export_psbt(records: &VaultRecords, tx_id: u64) -> Result<Psbt> {
    let tx = records.tx(tx_id)?;
    let mut psbt = Psbt::from_unsigned_tx(tx.unsigned_tx())?;
    for (input, slot) in tx.inputs.iter().zip(psbt.inputs.iter_mut()) {
        let script = records.script(input.script_id)?;
        slot.redeem_script = Some(script.redeem_script.clone());
        slot.witness_utxo = Some(bitcoin::TxOut {
            value: Amount::from_sat(input.value),
            script_pubkey: script.script_pubkey.clone(),
        });
        slot.sighash_type = Some(PsbtSighashType::from(EcdsaSighashType::All));
        for sig in &input.signatures {
            let parsed = bitcoin::ecdsa::Signature::from_slice(&sig.signature).map_err(|e| {
                Error::IntegrityViolation(format!("stored signature on tx {tx_id}: {e}"))
            })?;
            slot.partial_sigs
                .insert(bitcoin::PublicKey::new(sig.pubkey), parsed);
        }
    }
    log::debug!("exported tx {tx_id} with {} inputs as psbt", tx.inputs.len());
    Ok(psbt)
}

/// Brings a co-signer's PSBT into the working set.
pub(crate) struct TxExchange<'w, 'c> {
    ws: &'w mut WorkingSet<'c>,
}

impl<'w, 'c> TxExchange<'w, 'c> {
    pub fn new(ws: &'w mut WorkingSet<'c>) -> Self {
        Self { ws }
    }

    /// Merges the verified signatures of `psbt` into the stored transaction
    /// with the same unsigned txid, or stores it as a new transaction.
    ///
    /// A new transaction may only spend outputs this vault has observed
    /// itself, unspent and not reserved by another transaction: the legacy
    /// signing hash does not commit to input values.
    pub fn import(&mut self, psbt: Psbt) -> Result<Transaction> {
        let unsigned_txid = psbt.unsigned_tx.compute_txid();
        let existing = self
            .ws
            .records
            .txs
            .values()
            .find(|t| t.unsigned_tx().compute_txid() == unsigned_txid)
            .cloned();

        let (mut tx, is_new) = match existing {
            Some(tx) if tx.status == TxStatus::Broadcast => {
                return Err(Error::InvalidTxState {
                    id: tx.id,
                    status: tx.status.to_string(),
                })
            }
            Some(tx) => (tx, false),
            None => (self.rebuild(&psbt)?, true),
        };

        let records = &self.ws.records;
        let secp = self.ws.secp;
        let unsigned = tx.unsigned_tx();
        let cache = SighashCache::new(&unsigned);
        let mut added = 0usize;
        let mut dropped = 0usize;

        for (index, (input, slot)) in tx.inputs.iter_mut().zip(&psbt.inputs).enumerate() {
            let script = records.script(input.script_id)?;
            let account = records.account(script.account_id)?;
            if let Some(redeem) = &slot.redeem_script {
                if *redeem != script.redeem_script {
                    return Err(Error::InvalidExport(format!(
                        "input {index} carries a foreign redeem script"
                    )));
                }
            }
            let msg = signing_message(&cache, index, script)?;
            let offered = slot.partial_sigs.iter().map(|(pubkey, sig)| (pubkey.inner, sig.to_vec()));
            let (kept, rejected) =
                merge_signatures(secp, account, script, &msg, &mut input.signatures, offered)?;
            added += kept;
            dropped += rejected;
        }

        let status = status_of(records, &tx)?;
        tx.status = tx.status.max(status);
        if dropped > 0 {
            log::warn!("ignored {dropped} unverifiable signatures in psbt {unsigned_txid}");
        }
        log::info!(
            "imported psbt {unsigned_txid} as tx {}: {added} new signatures, now {}",
            tx.id,
            tx.status
        );

        let id = tx.id;
        self.ws.records.txs.insert(id, tx.clone());
        self.ws.events.push(if is_new {
            VaultEvent::TxInserted { id, status: tx.status }
        } else {
            VaultEvent::TxUpdated { id, status: tx.status }
        });
        Ok(tx)
    }

    /// Unsigned vault transaction equivalent to `psbt`.
    fn rebuild(&mut self, psbt: &Psbt) -> Result<Transaction> {
        let records = &self.ws.records;
        let unsigned = &psbt.unsigned_tx;
        if unsigned.input.is_empty() {
            return Err(Error::InvalidExport("psbt spends nothing".to_string()));
        }

        let reserved = ledger::reserved_outputs(records);
        let mut seen = HashSet::new();
        let mut account_id = None;
        let mut inputs = Vec::with_capacity(unsigned.input.len());
        for (index, (txin, slot)) in unsigned.input.iter().zip(&psbt.inputs).enumerate() {
            let invalid = |what: &str| Error::InvalidExport(format!("input {index} {what}"));
            let spent = slot
                .witness_utxo
                .as_ref()
                .ok_or_else(|| invalid("does not carry the spent output"))?;
            let script = records
                .script_by_pubkey(&spent.script_pubkey)
                .ok_or_else(|| invalid("does not spend from this vault"))?;
            if *account_id.get_or_insert(script.account_id) != script.account_id {
                return Err(invalid("spends from another account"));
            }

            let txout = records
                .txout_by_outpoint(&txin.previous_output)
                .ok_or_else(|| invalid("spends an output this vault has not observed"))?;
            if txout.script_id != script.id
                || !ledger::is_spendable(txout)
                || reserved.contains(&txout.id)
                || !seen.insert(txout.id)
            {
                return Err(Error::OutputNotSpendable(txout.id));
            }
            if txout.value != spent.value.to_sat() {
                return Err(invalid("disagrees with the observed value"));
            }
            inputs.push(TxInput {
                txout_id: txout.id,
                outpoint: txin.previous_output,
                value: txout.value,
                script_id: script.id,
                signatures: Vec::new(),
            });
        }

        let outputs = unsigned
            .output
            .iter()
            .map(|o| {
                Ok(OutputSpec::new(
                    o.script_pubkey.clone(),
                    ledger::check_amount(o.value.to_sat())?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let total_in = ledger::sum_amounts(inputs.iter().map(|i| i.value))?;
        let total_out = ledger::sum_amounts(outputs.iter().map(|o| o.value))?;
        let fee = total_in.checked_sub(total_out).ok_or(Error::InsufficientFunds {
            needed: total_out,
            available: total_in,
        })?;

        let account_id =
            account_id.ok_or_else(|| Error::InvalidExport("psbt spends nothing".to_string()))?;
        let tx = Transaction {
            id: self.ws.records.allocate_id(),
            account_id,
            version: unsigned.version.0,
            lock_time: unsigned.lock_time.to_consensus_u32(),
            inputs,
            outputs,
            fee,
            change: None,
            status: TxStatus::Unsigned,
            txid: None,
        };
        if tx.unsigned_tx() != *unsigned {
            return Err(Error::InvalidExport(
                "psbt uses sequence numbers or scripts this vault does not build".to_string(),
            ));
        }
        Ok(tx)
    }
}

/// Adds the verified signatures among `offered` to `signatures`, keeping
/// redeem script key order. Returns how many were added and how many were
/// rejected.
fn merge_signatures(
    secp: &Secp256k1<All>,
    account: &AccountRecord,
    script: &SigningScriptRecord,
    msg: &bitcoin::secp256k1::Message,
    signatures: &mut Vec<InputSignature>,
    offered: impl Iterator<Item = (bitcoin::secp256k1::PublicKey, Vec<u8>)>,
) -> Result<(usize, usize)> {
    let pubkeys = redeem_script_pubkeys(&script.redeem_script)?;
    if pubkeys.len() != account.keychain_ids.len() {
        return Err(Error::IntegrityViolation(format!(
            "redeem script of script {} does not match account {:?}",
            script.id, account.name
        )));
    }

    let (mut added, mut rejected) = (0, 0);
    for (pubkey, signature) in offered {
        let Some(pos) = pubkeys.iter().position(|p| *p == pubkey) else {
            rejected += 1;
            continue;
        };
        let candidate = InputSignature {
            keychain_id: account.keychain_ids[pos],
            pubkey,
            signature,
        };
        if signatures.iter().any(|s| s.keychain_id == candidate.keychain_id) {
            continue;
        }
        if !verify(secp, msg, &candidate) {
            rejected += 1;
            continue;
        }
        signatures.push(candidate);
        added += 1;
    }
    signatures.sort_by_key(|s| key_position(account, s.keychain_id));
    Ok((added, rejected))
}
