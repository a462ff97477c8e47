use std::collections::HashMap;

use bitcoin::{absolute::Height, BlockHash, OutPoint, Txid};

use super::FoundOutput;
use crate::error::Result;

/// Trait for recording chain scan results
///
/// Implementations decide how found outputs, spent inputs and scan progress
/// reach storage.
pub trait Updater {
    /// Ask the updater to record the scanning progress.
    fn record_scan_progress(&mut self, start: Height, current: Height, end: Height) -> Result<()>;

    /// Ask the updater to record the outputs found in a block.
    fn record_block_outputs(
        &mut self,
        height: Height,
        blkhash: BlockHash,
        found_outputs: HashMap<OutPoint, FoundOutput>,
    ) -> Result<()>;

    /// Ask the updater to record the inputs found in a block, each with the
    /// transaction spending it.
    fn record_block_inputs(
        &mut self,
        blkheight: Height,
        blkhash: BlockHash,
        found_inputs: HashMap<OutPoint, Txid>,
    ) -> Result<()>;

    /// Ask the updater to save all recorded changes to persistent storage.
    fn save_to_persistent_storage(&mut self) -> Result<()>;
}
