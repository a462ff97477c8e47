use std::{collections::HashMap, sync::Arc};

use bitcoin::{absolute::Height, BlockHash, OutPoint, Txid};

use super::{FoundOutput, Updater};
use crate::{error::Result, vault::Vault};

/// [`Updater`] writing straight into a shared vault.
pub struct VaultUpdater {
    vault: Arc<Vault>,
    last_progress: Option<Height>,
}

impl VaultUpdater {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self {
            vault,
            last_progress: None,
        }
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }
}

impl Updater for VaultUpdater {
    fn record_scan_progress(&mut self, start: Height, current: Height, end: Height) -> Result<()> {
        log::debug!("scan progress {current} ({start}..={end})");
        self.vault.set_best_height(current.to_consensus_u32())?;
        self.last_progress = Some(current);
        Ok(())
    }

    fn record_block_outputs(
        &mut self,
        height: Height,
        blkhash: BlockHash,
        found_outputs: HashMap<OutPoint, FoundOutput>,
    ) -> Result<()> {
        if found_outputs.is_empty() {
            return Ok(());
        }
        let mut outputs: Vec<_> = found_outputs.into_iter().collect();
        outputs.sort_by_key(|(outpoint, _)| *outpoint);
        let owned = self
            .vault
            .record_block_outputs(height.to_consensus_u32(), &outputs)?;
        log::info!(
            "block {height} ({blkhash}): {owned} of {} outputs belong to the vault",
            outputs.len()
        );
        Ok(())
    }

    fn record_block_inputs(
        &mut self,
        blkheight: Height,
        blkhash: BlockHash,
        found_inputs: HashMap<OutPoint, Txid>,
    ) -> Result<()> {
        if found_inputs.is_empty() {
            return Ok(());
        }
        let mut inputs: Vec<_> = found_inputs.into_iter().collect();
        inputs.sort_by_key(|(outpoint, _)| *outpoint);
        let spent = self.vault.record_block_inputs(&inputs)?;
        log::info!("block {blkheight} ({blkhash}): {spent} vault outputs spent");
        Ok(())
    }

    fn save_to_persistent_storage(&mut self) -> Result<()> {
        // every record_* call is committed on its own
        if let Some(height) = self.last_progress {
            log::debug!("vault state committed up to height {height}");
        }
        Ok(())
    }
}
