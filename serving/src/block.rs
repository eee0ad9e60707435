use thiserror::Error;
use tracing::error;

/// Identifier of a physical block, it doubles as the block's index in its
/// device's arena.
pub type BlockId = u32;

/// Represents the device on which a block is allocated.
///
/// `Cpu`: The block lives in the secondary (swap) pool
///
/// `Gpu`: The block lives in the accelerator KV cache pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockDevice {
    Cpu,
    Gpu,
}

/// Computes the number of blocks needed to hold `num_tokens` tokens.
pub fn num_blocks_for_tokens(num_tokens: usize, block_size: usize) -> usize {
    num_tokens.div_ceil(block_size)
}

/// Represents the state of a block in the KV cache.
///
/// A physical block is a fixed-size slot of `block_size` tokens worth of KV state.
/// Its `ref_count` counts the number of block tables that reference it. It is
/// larger than one only when prefix sharing forked a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalTokenBlock {
    /// Block number, unique per device
    block_number: BlockId,
    /// Number of tokens the block can hold
    block_size: usize,
    /// Device where the block lives
    device: BlockDevice,
    /// Number of block tables referencing this block
    ref_count: usize,
}

impl PhysicalTokenBlock {
    /// Constructor
    pub fn new(block_number: BlockId, block_size: usize, device: BlockDevice) -> Self {
        Self {
            block_number,
            block_size,
            device,
            ref_count: 0,
        }
    }

    /// Getter for `block_number`
    pub fn block_number(&self) -> BlockId {
        self.block_number
    }

    /// Getter for `block_size`
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Getter for `device`
    pub fn device(&self) -> BlockDevice {
        self.device
    }

    /// Getter for `ref_count`
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Increments the reference count
    pub fn increment_ref_count(&mut self) {
        self.ref_count += 1;
    }

    /// Decreases the reference count.
    ///
    /// # Errors
    ///
    /// Returns `BlockError::ReferenceCountError` if the block is not referenced at all.
    pub fn decrease_ref_count(&mut self) -> Result<(), BlockError> {
        if self.ref_count == 0 {
            error!(
                "Reference counter is already zero for block {}, cannot decrease it",
                self.block_number
            );
            return Err(BlockError::ReferenceCountError(self.block_number));
        }
        self.ref_count -= 1;
        Ok(())
    }
}

/// A `BlockTable` maps the logical blocks of a sequence to physical blocks.
///
/// Entry `i` holds the physical block storing the KV state of tokens
/// `[i * block_size, (i + 1) * block_size)`. All blocks of a table live on the
/// same device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockTable {
    /// Device of every block in the table
    device: BlockDevice,
    /// Ordered physical block ids
    block_ids: Vec<BlockId>,
}

impl BlockTable {
    /// Constructor
    pub fn new(device: BlockDevice, block_ids: Vec<BlockId>) -> Self {
        Self { device, block_ids }
    }

    /// Getter for `device`
    pub fn device(&self) -> BlockDevice {
        self.device
    }

    /// Ordered physical block ids
    pub fn ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// Number of blocks in the table
    pub fn len(&self) -> usize {
        self.block_ids.len()
    }

    /// Checks if the table holds no blocks
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Last block of the table, if any
    pub fn last(&self) -> Option<BlockId> {
        self.block_ids.last().copied()
    }

    /// Block at logical index `index`
    pub fn get(&self, index: usize) -> Option<BlockId> {
        self.block_ids.get(index).copied()
    }

    /// Appends new blocks at the end of the table
    pub fn extend(&mut self, block_ids: impl IntoIterator<Item = BlockId>) {
        self.block_ids.extend(block_ids)
    }

    /// Replaces the block at logical index `index`, returning the previous one.
    pub fn replace(&mut self, index: usize, block_id: BlockId) -> Option<BlockId> {
        self.block_ids
            .get_mut(index)
            .map(|slot| std::mem::replace(slot, block_id))
    }

    /// Number of tokens the table can hold
    pub fn capacity_in_tokens(&self, block_size: usize) -> usize {
        self.block_ids.len() * block_size
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("Reference counter error, cannot decrease reference counter of free block `{0}`")]
    ReferenceCountError(BlockId),
}
