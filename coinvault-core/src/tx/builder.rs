use std::collections::HashSet;

use bdk_coin_select::{Candidate, CoinSelector};

use super::{ChangeOutput, OutputSpec, Transaction, TxInput, TxRequest, TxStatus};
use crate::{
    account::AccountManager,
    constants::{CHANGE_BIN_NAME, CHANGE_LABEL},
    error::{Error, Result},
    ledger::{self, TxOut},
    vault::{VaultEvent, WorkingSet},
};

/// Rough weight of a P2SH multisig input; the fee itself is caller supplied.
const MULTISIG_INPUT_WEIGHT: u32 = 4 * 300;

pub(crate) struct TxBuilder<'w, 'c> {
    ws: &'w mut WorkingSet<'c>,
}

impl<'w, 'c> TxBuilder<'w, 'c> {
    pub fn new(ws: &'w mut WorkingSet<'c>) -> Self {
        Self { ws }
    }

    pub fn create(&mut self, account: &str, request: TxRequest) -> Result<Transaction> {
        let account_id = self.ws.records.account_id(account)?;
        let change_bin = request.change_bin.as_deref().unwrap_or(CHANGE_BIN_NAME);
        let change_bin_id = self
            .ws
            .records
            .account(account_id)?
            .bin_by_name(change_bin)?
            .id;

        for output in &request.outputs {
            ledger::check_amount(output.value)?;
        }
        let target = ledger::sum_amounts(
            std::iter::once(ledger::check_amount(request.fee)?)
                .chain(request.outputs.iter().map(|o| o.value)),
        )?;

        let selected = if request.inputs.is_empty() {
            if !request.auto_select {
                return Err(Error::NoOutputsSelected);
            }
            self.select(account_id, target)?
        } else {
            self.explicit_inputs(account_id, &request.inputs, request.fee, target)?
        };

        if selected.is_empty() {
            return Err(Error::NoOutputsSelected);
        }
        let total_in = ledger::sum_amounts(selected.iter().map(|o| o.value))?;
        let change_value = total_in.checked_sub(target).ok_or(Error::InsufficientFunds {
            needed: target,
            available: total_in,
        })?;

        let mut outputs = request.outputs;
        let change = if change_value > 0 {
            let txout = AccountManager::new(self.ws).issue_to_bin(
                account_id,
                change_bin_id,
                CHANGE_LABEL,
                change_value,
            )?;
            outputs.push(OutputSpec::new(txout.script, change_value));
            Some(ChangeOutput {
                txout_id: txout.id,
                vout: (outputs.len() - 1) as u32,
                value: change_value,
            })
        } else {
            None
        };

        let inputs = selected
            .into_iter()
            .map(|o| {
                let outpoint = o.outpoint.ok_or(Error::OutputNotSpendable(o.id))?;
                Ok(TxInput {
                    txout_id: o.id,
                    outpoint,
                    value: o.value,
                    script_id: o.script_id,
                    signatures: Vec::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let id = self.ws.records.allocate_id();
        let tx = Transaction {
            id,
            account_id,
            version: request.version,
            lock_time: request.lock_time,
            inputs,
            outputs,
            fee: request.fee,
            change,
            status: TxStatus::Unsigned,
            txid: None,
        };
        self.ws.records.txs.insert(id, tx.clone());
        self.ws.events.push(VaultEvent::TxInserted {
            id,
            status: tx.status,
        });
        log::info!(
            "created tx {id} for account {account:?}: {} inputs, {} outputs, fee {}, change {change_value}",
            tx.inputs.len(),
            tx.outputs.len(),
            tx.fee
        );
        Ok(tx)
    }

    /// Greedy oldest-first selection: stops at the first prefix of the
    /// spendable outputs covering `target`.
    fn select(&self, account_id: u64, target: u64) -> Result<Vec<TxOut>> {
        if target == 0 {
            return Ok(Vec::new());
        }
        let spendable: Vec<TxOut> = ledger::spendable_outputs(&self.ws.records, account_id)
            .into_iter()
            .cloned()
            .collect();
        let candidates: Vec<Candidate> = spendable
            .iter()
            .map(|o| Candidate {
                value: o.value,
                weight: MULTISIG_INPUT_WEIGHT.into(),
                input_count: 1,
                is_segwit: false,
            })
            .collect();

        let mut selector = CoinSelector::new(&candidates);
        if selector
            .select_until(|cs| cs.selected_value() >= target)
            .is_none()
        {
            return Err(Error::InsufficientFunds {
                needed: target,
                available: ledger::sum_amounts(spendable.iter().map(|o| o.value))?,
            });
        }
        Ok(selector.apply_selection(&spendable).cloned().collect())
    }

    fn explicit_inputs(
        &self,
        account_id: u64,
        ids: &[u64],
        fee: u64,
        target: u64,
    ) -> Result<Vec<TxOut>> {
        let reserved = ledger::reserved_outputs(&self.ws.records);
        let mut seen = HashSet::new();
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            let txout = self.ws.records.txout(*id)?;
            if !seen.insert(*id)
                || txout.account_id != account_id
                || !ledger::is_spendable(txout)
                || reserved.contains(id)
            {
                return Err(Error::OutputNotSpendable(*id));
            }
            selected.push(txout.clone());
        }

        let total_in = ledger::sum_amounts(selected.iter().map(|o| o.value))?;
        if fee > total_in {
            return Err(Error::InvalidAmount);
        }
        if total_in < target {
            return Err(Error::InsufficientFunds {
                needed: target,
                available: total_in,
            });
        }
        Ok(selected)
    }
}
