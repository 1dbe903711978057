//! Ordered list of blocks and the index of the one being run.

use reachlab_types::{BlockConfig, LabError};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BlockSequencer {
    blocks: Vec<BlockConfig>,
    index: usize,
}

impl BlockSequencer {
    /// Validate every block up front so a bad block cannot surface mid-session.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Config`] for an empty list or the first invalid
    /// block, prefixed with its position.
    pub fn new(blocks: Vec<BlockConfig>) -> Result<Self, LabError> {
        if blocks.is_empty() {
            return Err(LabError::Config(
                "at least one block must be configured".to_string(),
            ));
        }
        for (i, block) in blocks.iter().enumerate() {
            block
                .validate()
                .map_err(|e| LabError::Config(format!("block {i}: {e}")))?;
            let overlap = block.overlapping_indices();
            if !overlap.is_empty() {
                warn!(block = i, indices = ?overlap, "trials listed as catch and channel; catch wins");
            }
        }
        Ok(Self { blocks, index: 0 })
    }

    pub fn current(&self) -> &BlockConfig {
        &self.blocks[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn has_next(&self) -> bool {
        self.index + 1 < self.blocks.len()
    }

    /// Move to the next block. Returns `false`, leaving the index unchanged,
    /// when the current block is the last one.
    pub fn advance(&mut self) -> bool {
        if !self.has_next() {
            return false;
        }
        self.index += 1;
        info!(block = self.index, of = self.blocks.len(), "advancing to next block");
        true
    }

    /// Trials across every block.
    pub fn total_trials(&self) -> u32 {
        self.blocks.iter().map(|b| b.total_trials).sum()
    }
}
