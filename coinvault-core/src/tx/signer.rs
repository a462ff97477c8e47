use std::collections::HashSet;

use bitcoin::{
    ecdsa,
    hashes::Hash,
    opcodes::all::OP_PUSHBYTES_0,
    script::{Builder, PushBytesBuf},
    secp256k1::Message,
    sighash::{EcdsaSighashType, SighashCache},
    OutPoint,
};

use super::{InputSignature, Transaction, TxStatus};
use crate::{
    account::AccountRecord,
    error::{Error, Result},
    keychain,
    ledger::{LedgerManager, SigningScriptRecord},
    script::redeem_script_pubkeys,
    store::VaultRecords,
    vault::{VaultEvent, WorkingSet},
};

/// Legacy P2SH signing hash of input `index`.
pub(super) fn signing_message(
    cache: &SighashCache<&bitcoin::Transaction>,
    index: usize,
    script: &SigningScriptRecord,
) -> Result<Message> {
    let sighash = cache
        .legacy_signature_hash(index, &script.redeem_script, EcdsaSighashType::All.to_u32())
        .map_err(|e| Error::Sighash(e.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Position of each account keychain in the redeem script.
pub(super) fn key_position(account: &AccountRecord, keychain_id: u64) -> Option<usize> {
    account.keychain_ids.iter().position(|id| *id == keychain_id)
}

pub(crate) struct TxSigner<'w, 'c> {
    ws: &'w mut WorkingSet<'c>,
}

impl<'w, 'c> TxSigner<'w, 'c> {
    pub fn new(ws: &'w mut WorkingSet<'c>) -> Self {
        Self { ws }
    }

    /// Adds signatures from the unlocked keychains of each input's account,
    /// optionally restricted to `restrict_to`. Signatures already present are
    /// re-verified; invalid ones are dropped.
    pub fn sign(
        &mut self,
        tx_id: u64,
        restrict_to: Option<&[&str]>,
        allow_partial: bool,
    ) -> Result<Transaction> {
        let mut tx = self.ws.records.tx(tx_id)?.clone();
        match tx.status {
            TxStatus::Broadcast => {
                return Err(Error::InvalidTxState {
                    id: tx_id,
                    status: tx.status.to_string(),
                })
            }
            TxStatus::Signed => return Ok(tx),
            TxStatus::Unsigned | TxStatus::PartiallySigned => {}
        }

        let allowed = restrict_to
            .map(|names| {
                names
                    .iter()
                    .map(|n| self.ws.records.keychain_id(n))
                    .collect::<Result<HashSet<u64>>>()
            })
            .transpose()?;
        let records = &self.ws.records;
        let session = &self.ws.session;
        let secp = self.ws.secp;

        let eligible = |account: &AccountRecord| -> Vec<(usize, u64)> {
            account
                .keychain_ids
                .iter()
                .copied()
                .enumerate()
                .filter(|(_, id)| allowed.as_ref().map_or(true, |a| a.contains(id)))
                .filter(|(_, id)| session.is_unlocked(*id))
                .collect()
        };

        let mut any_eligible = false;
        for input in &tx.inputs {
            let account = records.account(records.script(input.script_id)?.account_id)?;
            any_eligible |= !eligible(account).is_empty();
        }
        if !any_eligible && !allow_partial {
            return Err(Error::NoEligibleKeychains);
        }

        let unsigned = tx.unsigned_tx();
        let cache = SighashCache::new(&unsigned);
        let mut added = 0usize;
        let mut dropped = 0usize;

        for (index, input) in tx.inputs.iter_mut().enumerate() {
            let script = records.script(input.script_id)?;
            let account = records.account(script.account_id)?;
            let bin = account.bin(script.bin_id)?;
            let pubkeys = redeem_script_pubkeys(&script.redeem_script)?;
            if pubkeys.len() != account.keychain_ids.len() {
                return Err(Error::IntegrityViolation(format!(
                    "redeem script of script {} has {} keys, account {:?} has {}",
                    script.id,
                    pubkeys.len(),
                    account.name,
                    account.keychain_ids.len()
                )));
            }
            let minsigs = account.minsigs as usize;
            let msg = signing_message(&cache, index, script)?;

            let before = input.signatures.len();
            input.signatures.retain(|sig| {
                key_position(account, sig.keychain_id)
                    .map(|pos| pubkeys[pos] == sig.pubkey && verify(secp, &msg, sig))
                    .unwrap_or(false)
            });
            dropped += before - input.signatures.len();

            let hardened = account.derivation.is_hardened();
            for (pos, keychain_id) in eligible(account) {
                if input.signatures.len() >= minsigs {
                    break;
                }
                if input.signatures.iter().any(|s| s.keychain_id == keychain_id) {
                    continue;
                }
                let key = keychain::load(records, session, keychain_id)?
                    .derive_child(secp, bin.index, hardened)?
                    .derive_child(secp, script.index, hardened)?;
                if key.pubkey() != pubkeys[pos] {
                    return Err(Error::IntegrityViolation(format!(
                        "derived key of {:?} does not match script {}",
                        key.name(),
                        script.id
                    )));
                }
                let signature = ecdsa::Signature {
                    signature: secp.sign_ecdsa(&msg, &key.secret_key()?),
                    sighash_type: EcdsaSighashType::All,
                };
                input.signatures.push(InputSignature {
                    keychain_id,
                    pubkey: key.pubkey(),
                    signature: signature.to_vec(),
                });
                added += 1;
            }
            input
                .signatures
                .sort_by_key(|s| key_position(account, s.keychain_id));
        }

        let status = status_of(records, &tx)?;
        tx.status = tx.status.max(status);
        if dropped > 0 {
            log::warn!("dropped {dropped} invalid signatures from tx {tx_id}");
        }
        log::info!("added {added} signatures to tx {tx_id}, now {}", tx.status);

        self.ws.records.txs.insert(tx_id, tx.clone());
        self.ws.events.push(VaultEvent::TxUpdated {
            id: tx_id,
            status: tx.status,
        });
        Ok(tx)
    }

    /// Records a signed transaction as broadcast: inputs become spent and the
    /// change output becomes spendable.
    pub fn mark_broadcast(&mut self, tx_id: u64) -> Result<Transaction> {
        let final_tx = signed_transaction(&self.ws.records, tx_id)?;
        let txid = final_tx.compute_txid();
        let mut tx = self.ws.records.tx(tx_id)?.clone();

        let mut ledger = LedgerManager::new(self.ws);
        for input in &tx.inputs {
            ledger.mark_spent(input.txout_id, txid)?;
        }
        if let Some(change) = tx.change {
            let script = &tx.outputs[change.vout as usize].script;
            ledger.record_observed_output(
                script,
                change.value,
                OutPoint::new(txid, change.vout),
                None,
            )?;
        }

        tx.status = TxStatus::Broadcast;
        tx.txid = Some(txid);
        self.ws.records.txs.insert(tx_id, tx.clone());
        self.ws.events.push(VaultEvent::TxUpdated {
            id: tx_id,
            status: tx.status,
        });
        log::info!("tx {tx_id} broadcast as {txid}");
        Ok(tx)
    }

    /// Forgets a transaction that was never broadcast, releasing its inputs.
    /// The change index stays consumed.
    pub fn discard(&mut self, tx_id: u64) -> Result<()> {
        let tx = self.ws.records.tx(tx_id)?;
        if tx.status == TxStatus::Broadcast {
            return Err(Error::InvalidTxState {
                id: tx_id,
                status: tx.status.to_string(),
            });
        }
        let change = tx.change;
        if let Some(change) = change {
            self.ws.records.txouts.remove(&change.txout_id);
        }
        self.ws.records.txs.remove(&tx_id);
        self.ws.events.push(VaultEvent::TxDiscarded { id: tx_id });
        log::info!("discarded tx {tx_id}");
        Ok(())
    }
}

pub(super) fn verify(
    secp: &bitcoin::secp256k1::Secp256k1<bitcoin::secp256k1::All>,
    msg: &Message,
    sig: &InputSignature,
) -> bool {
    match ecdsa::Signature::from_slice(&sig.signature) {
        Ok(parsed) => {
            parsed.sighash_type == EcdsaSighashType::All
                && secp
                    .verify_ecdsa(msg, &parsed.signature, &sig.pubkey)
                    .is_ok()
        }
        Err(_) => false,
    }
}

pub(super) fn status_of(records: &VaultRecords, tx: &Transaction) -> Result<TxStatus> {
    if tx.inputs.is_empty() {
        return Err(Error::IntegrityViolation(format!("tx {} has no inputs", tx.id)));
    }
    let mut complete = true;
    let mut any = false;
    for input in &tx.inputs {
        let minsigs = required_signatures(records, input.script_id)?;
        complete &= input.signatures.len() >= minsigs;
        any |= !input.signatures.is_empty();
    }
    Ok(match (complete, any) {
        (true, _) => TxStatus::Signed,
        (false, true) => TxStatus::PartiallySigned,
        (false, false) => TxStatus::Unsigned,
    })
}

fn required_signatures(records: &VaultRecords, script_id: u64) -> Result<usize> {
    let script = records.script(script_id)?;
    Ok(records.account(script.account_id)?.minsigs as usize)
}

/// Assembles the final transaction: every scriptSig is
/// `OP_0 <sig_1> .. <sig_m> <redeem script>`.
pub(crate) fn signed_transaction(
    records: &VaultRecords,
    tx_id: u64,
) -> Result<bitcoin::Transaction> {
    let tx = records.tx(tx_id)?;
    if tx.status < TxStatus::Signed {
        return Err(Error::InvalidTxState {
            id: tx_id,
            status: tx.status.to_string(),
        });
    }

    let mut final_tx = tx.unsigned_tx();
    for (txin, input) in final_tx.input.iter_mut().zip(&tx.inputs) {
        let minsigs = required_signatures(records, input.script_id)?;
        if input.signatures.len() < minsigs {
            return Err(Error::IntegrityViolation(format!(
                "input {} of tx {tx_id} has {} of {minsigs} signatures",
                input.outpoint,
                input.signatures.len()
            )));
        }

        let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
        for sig in input.signatures.iter().take(minsigs) {
            builder = builder.push_slice(PushBytesBuf::try_from(sig.signature.clone())?);
        }
        let redeem = &records.script(input.script_id)?.redeem_script;
        builder = builder.push_slice(PushBytesBuf::try_from(redeem.to_bytes())?);
        txin.script_sig = builder.into_script();
    }
    Ok(final_tx)
}
