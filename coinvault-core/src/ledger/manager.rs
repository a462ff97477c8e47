use bitcoin::{OutPoint, Script, Txid};

use super::{check_amount, OutputStatus, ScriptStatus, SigningScriptRecord, TxOut};
use crate::{
    account::{AccountManager, DerivedScript},
    error::{Error, Result},
    vault::{VaultEvent, WorkingSet},
};

pub(crate) struct LedgerManager<'w, 'c> {
    ws: &'w mut WorkingSet<'c>,
}

impl<'w, 'c> LedgerManager<'w, 'c> {
    pub fn new(ws: &'w mut WorkingSet<'c>) -> Self {
        Self { ws }
    }

    /// Registers a freshly derived script. A script that already belongs to
    /// the vault means two derivation paths collided.
    pub fn insert_script(
        &mut self,
        account_id: u64,
        bin_id: u64,
        script: DerivedScript,
    ) -> Result<u64> {
        if let Some(existing) = self.ws.records.script_by_pubkey(&script.script_pubkey) {
            return Err(Error::IntegrityViolation(format!(
                "derived script {} collides with script {}",
                script.script_pubkey.to_hex_string(),
                existing.id
            )));
        }
        let id = self.ws.records.allocate_id();
        self.ws.records.scripts.insert(
            id,
            SigningScriptRecord {
                id,
                account_id,
                bin_id,
                index: script.index,
                script_pubkey: script.script_pubkey,
                redeem_script: script.redeem_script,
                status: ScriptStatus::Unused,
            },
        );
        Ok(id)
    }

    /// Creates a pending output on a script taken from a bin's pool.
    pub fn issue(&mut self, script_id: u64, label: &str, value: u64) -> Result<TxOut> {
        check_amount(value)?;
        let script = self.ws.records.script_mut(script_id)?;
        if script.status != ScriptStatus::Unused {
            return Err(Error::IntegrityViolation(format!(
                "script {script_id} was already issued"
            )));
        }
        script.status = ScriptStatus::Issued;
        let script = script.clone();

        let id = self.ws.records.allocate_id();
        let txout = TxOut {
            id,
            account_id: script.account_id,
            bin_id: script.bin_id,
            script_id,
            index: script.index,
            script: script.script_pubkey,
            value,
            label: label.to_string(),
            status: OutputStatus::Pending,
            outpoint: None,
            height: None,
            spending_txid: None,
        };
        self.ws.records.txouts.insert(id, txout.clone());
        self.ws.events.push(VaultEvent::OutputInserted(txout.clone()));
        Ok(txout)
    }

    /// Applies a payment seen on chain. Returns `None` when the script does
    /// not belong to the vault.
    ///
    /// A pending output on the same script is completed in place, otherwise a
    /// new unspent output is created. Seeing the same outpoint again only
    /// updates its height.
    pub fn record_observed_output(
        &mut self,
        script_pubkey: &Script,
        value: u64,
        outpoint: OutPoint,
        height: Option<u32>,
    ) -> Result<Option<TxOut>> {
        check_amount(value)?;
        if let Some(known) = self.ws.records.txout_by_outpoint(&outpoint).map(|o| o.id) {
            let txout = self.ws.records.txout_mut(known)?;
            if height.is_some() && txout.height != height {
                txout.height = height;
                let txout = txout.clone();
                self.ws.events.push(VaultEvent::OutputUpdated(txout.clone()));
                return Ok(Some(txout));
            }
            return Ok(Some(txout.clone()));
        }

        let Some(script) = self.ws.records.script_by_pubkey(script_pubkey).cloned() else {
            return Ok(None);
        };
        if script.status == ScriptStatus::Unused {
            // paid before it was handed out: take it out of the pool
            let bin = self
                .ws
                .records
                .account_mut(script.account_id)?
                .bin_mut(script.bin_id)?;
            bin.unused.retain(|id| *id != script.id);
            AccountManager::new(self.ws).refill_best_effort(script.account_id, script.bin_id)?;
        }
        self.ws.records.script_mut(script.id)?.status = ScriptStatus::Used;

        let pending = self
            .ws
            .records
            .txouts
            .values()
            .find(|o| o.script_id == script.id && o.status == OutputStatus::Pending && o.outpoint.is_none())
            .map(|o| o.id);

        let txout = match pending {
            Some(id) => {
                let txout = self.ws.records.txout_mut(id)?;
                txout.value = value;
                txout.outpoint = Some(outpoint);
                txout.height = height;
                txout.status = OutputStatus::Unspent;
                let txout = txout.clone();
                self.ws.events.push(VaultEvent::OutputUpdated(txout.clone()));
                txout
            }
            None => {
                let id = self.ws.records.allocate_id();
                let txout = TxOut {
                    id,
                    account_id: script.account_id,
                    bin_id: script.bin_id,
                    script_id: script.id,
                    index: script.index,
                    script: script.script_pubkey,
                    value,
                    label: String::new(),
                    status: OutputStatus::Unspent,
                    outpoint: Some(outpoint),
                    height,
                    spending_txid: None,
                };
                self.ws.records.txouts.insert(id, txout.clone());
                self.ws.events.push(VaultEvent::OutputInserted(txout.clone()));
                txout
            }
        };
        log::debug!("observed {value} sat on output {} ({outpoint})", txout.id);
        Ok(Some(txout))
    }

    pub fn mark_spent(&mut self, output_id: u64, spending_txid: Txid) -> Result<TxOut> {
        let txout = self.ws.records.txout_mut(output_id)?;
        match txout.status {
            OutputStatus::Spent if txout.spending_txid == Some(spending_txid) => {
                return Ok(txout.clone())
            }
            OutputStatus::Spent => {
                return Err(Error::IntegrityViolation(format!(
                    "output {output_id} is already spent by another transaction"
                )))
            }
            OutputStatus::Pending => return Err(Error::OutputNotSpendable(output_id)),
            OutputStatus::Unspent => {}
        }
        txout.status = OutputStatus::Spent;
        txout.spending_txid = Some(spending_txid);
        let txout = txout.clone();
        self.ws.events.push(VaultEvent::OutputUpdated(txout.clone()));
        Ok(txout)
    }

    /// Marks the output at `outpoint` spent if the vault owns it.
    pub fn mark_outpoint_spent(
        &mut self,
        outpoint: &OutPoint,
        spending_txid: Txid,
    ) -> Result<Option<TxOut>> {
        match self.ws.records.txout_by_outpoint(outpoint).map(|o| o.id) {
            Some(id) => self.mark_spent(id, spending_txid).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_best_height(&mut self, height: u32) {
        if self.ws.records.best_height != height {
            self.ws.records.best_height = height;
            self.ws.events.push(VaultEvent::BestHeightChanged(height));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::{
        account::AccountOptions,
        config::VaultConfig,
        constants::DEFAULT_BIN_NAME,
        keychain::KeychainManager,
        ledger::{balance, outputs_for_account, resolve_script},
    };
    use bitcoin::secp256k1::{All, Secp256k1};

    fn outpoint(vout: u32) -> OutPoint {
        OutPoint::new(
            Txid::from_str("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
                .unwrap(),
            vout,
        )
    }

    fn setup<T>(f: impl FnOnce(&mut WorkingSet<'_>) -> T) -> T {
        let secp = Secp256k1::<All>::new();
        let config = VaultConfig {
            unused_pool_size: 2,
            ..Default::default()
        };
        let mut ws = WorkingSet::fresh(&secp, &config).unwrap();
        KeychainManager::new(&mut ws).create_root("k1", &[1; 32]).unwrap();
        KeychainManager::new(&mut ws).create_root("k2", &[2; 32]).unwrap();
        AccountManager::new(&mut ws)
            .create("A", 1, &["k1", "k2"], AccountOptions::default())
            .unwrap();
        f(&mut ws)
    }

    #[test]
    fn pending_output_is_completed_by_observation() {
        setup(|ws| {
            let issued = AccountManager::new(ws)
                .issue_output("A", DEFAULT_BIN_NAME, "rent", 1_000)
                .unwrap();
            assert_eq!(balance(&ws.records, "A").unwrap(), 0);

            let seen = LedgerManager::new(ws)
                .record_observed_output(&issued.script, 1_200, outpoint(0), Some(100))
                .unwrap()
                .unwrap();
            assert_eq!(seen.id, issued.id);
            assert_eq!(seen.label, "rent");
            assert_eq!(seen.value, 1_200);
            assert_eq!(seen.status, OutputStatus::Unspent);
            assert_eq!(balance(&ws.records, "A").unwrap(), 1_200);

            // second payment to the same script is a new output
            let again = LedgerManager::new(ws)
                .record_observed_output(&issued.script, 5, outpoint(1), None)
                .unwrap()
                .unwrap();
            assert_ne!(again.id, issued.id);
            assert_eq!(outputs_for_account(&ws.records, "A", false).unwrap().len(), 2);
        });
    }

    #[test]
    fn unknown_scripts_are_ignored() {
        setup(|ws| {
            let foreign = bitcoin::ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x01]);
            assert!(LedgerManager::new(ws)
                .record_observed_output(&foreign, 10, outpoint(0), None)
                .unwrap()
                .is_none());
            assert!(resolve_script(&ws.records, &foreign).unwrap().is_none());
        });
    }

    #[test]
    fn payment_to_pooled_script_leaves_the_pool() {
        setup(|ws| {
            let account_id = ws.records.account_id("A").unwrap();
            let bin = ws.records.account(account_id).unwrap().bin_by_name(DEFAULT_BIN_NAME).unwrap();
            let pooled = ws.records.script(bin.unused[0]).unwrap().clone();

            let owner = resolve_script(&ws.records, &pooled.script_pubkey).unwrap().unwrap();
            assert_eq!(owner.account, "A");
            assert_eq!(owner.bin, DEFAULT_BIN_NAME);
            assert_eq!(owner.index, 0);

            LedgerManager::new(ws)
                .record_observed_output(&pooled.script_pubkey, 10, outpoint(3), Some(1))
                .unwrap();
            let issued = AccountManager::new(ws)
                .issue_output("A", DEFAULT_BIN_NAME, "", 0)
                .unwrap();
            assert_eq!(issued.index, 1);
        });
    }

    #[test]
    fn amounts_above_money_supply_are_rejected() {
        setup(|ws| {
            let too_much = bitcoin::Amount::MAX_MONEY.to_sat() + 1;
            let issued = AccountManager::new(ws)
                .issue_output("A", DEFAULT_BIN_NAME, "", 0)
                .unwrap();
            assert!(matches!(
                LedgerManager::new(ws).record_observed_output(
                    &issued.script,
                    too_much,
                    outpoint(0),
                    Some(1)
                ),
                Err(Error::InvalidAmount)
            ));
            assert!(matches!(
                AccountManager::new(ws).issue_output("A", DEFAULT_BIN_NAME, "", too_much),
                Err(Error::InvalidAmount)
            ));

            let max = bitcoin::Amount::MAX_MONEY.to_sat();
            LedgerManager::new(ws)
                .record_observed_output(&issued.script, max, outpoint(1), Some(1))
                .unwrap();
            assert_eq!(balance(&ws.records, "A").unwrap(), max);
        });
    }

    #[test]
    fn spending() {
        setup(|ws| {
            let issued = AccountManager::new(ws)
                .issue_output("A", DEFAULT_BIN_NAME, "", 0)
                .unwrap();
            let mut ledger = LedgerManager::new(ws);
            assert!(matches!(
                ledger.mark_spent(issued.id, outpoint(0).txid),
                Err(Error::OutputNotSpendable(_))
            ));
            ledger
                .record_observed_output(&issued.script, 50, outpoint(0), Some(7))
                .unwrap();
            let spender = outpoint(9).txid;
            let spent = ledger.mark_outpoint_spent(&outpoint(0), spender).unwrap().unwrap();
            assert_eq!(spent.status, OutputStatus::Spent);
            assert_eq!(spent.spending_txid, Some(spender));
            assert!(matches!(ledger.mark_spent(999, spender), Err(Error::UnknownOutput(999))));

            assert!(outputs_for_account(&ws.records, "A", false).unwrap().is_empty());
            assert_eq!(outputs_for_account(&ws.records, "A", true).unwrap().len(), 1);
            assert_eq!(balance(&ws.records, "A").unwrap(), 0);
        });
    }
}
