use thiserror::Error;
use tracing::{error, info_span, instrument, trace, Span};

use crate::block::{BlockDevice, BlockError, BlockId, PhysicalTokenBlock};

/// `BlockAllocator` - Manages the fixed pool of physical token blocks of a device.
///
/// Blocks live in an arena indexed by their `BlockId`. The allocator keeps a
/// free list of unreferenced blocks; an allocated block leaves the free list and
/// only returns to it once its reference count drops back to zero.
#[derive(Debug)]
pub struct BlockAllocator {
    /// Device of the managed blocks
    device: BlockDevice,
    /// Arena of blocks, indexed by block number
    blocks: Vec<PhysicalTokenBlock>,
    /// Free blocks available, the next block to hand out sits at the end
    free_blocks: Vec<BlockId>,
    /// Tracing span
    span: Span,
}

impl BlockAllocator {
    /// Constructor
    pub fn new(block_size: usize, device: BlockDevice, num_blocks: usize) -> Self {
        let blocks = (0..(num_blocks as BlockId))
            .map(|i| PhysicalTokenBlock::new(i, block_size, device))
            .collect();
        // Reversed, so that blocks are handed out in ascending order
        let free_blocks = (0..(num_blocks as BlockId)).rev().collect();

        Self {
            device,
            blocks,
            free_blocks,
            span: info_span!("block-allocator"),
        }
    }

    /// Allocates `num_blocks` physical blocks from the pool of free blocks.
    ///
    /// Allocation is all-or-nothing: if fewer than `num_blocks` blocks are free, no
    /// block is reserved and `BlockAllocatorError::OutOfMemory` is returned.
    #[instrument(skip_all)]
    pub fn allocate(&mut self, num_blocks: usize) -> Result<Vec<BlockId>, BlockAllocatorError> {
        let span = self.span.clone();
        let _enter = span.enter();
        if num_blocks > self.free_blocks.len() {
            error!(
                "Out of memory on {:?}, requested {num_blocks} blocks but only {} are free",
                self.device,
                self.free_blocks.len()
            );
            return Err(BlockAllocatorError::OutOfMemory {
                requested: num_blocks,
                available: self.free_blocks.len(),
            });
        }

        let split_index = self.free_blocks.len() - num_blocks;
        let mut allocated = self.free_blocks.split_off(split_index);
        allocated.reverse();
        for block_id in allocated.iter() {
            self.blocks[*block_id as usize].increment_ref_count();
        }
        trace!("Allocated blocks {allocated:?} on {:?}", self.device);

        Ok(allocated)
    }

    /// Adds a new reference to an already allocated block, used when two block
    /// tables share a prefix.
    #[instrument(skip_all)]
    pub fn share(&mut self, block_id: BlockId) -> Result<(), BlockAllocatorError> {
        let span = self.span.clone();
        let _enter = span.enter();
        let block = self.block_mut(block_id)?;
        if block.ref_count() == 0 {
            error!("Cannot share block {block_id}, as it is not allocated");
            return Err(BlockAllocatorError::BlockNotAllocated(block_id));
        }
        block.increment_ref_count();
        Ok(())
    }

    /// Frees a set of (already allocated) blocks.
    ///
    /// Each block's reference count is decreased; blocks that are no longer
    /// referenced return to the free list.
    ///
    /// # Errors
    ///
    /// * `BlockAllocatorError::BlockNotFound` if a block id does not belong to the pool
    /// * `BlockAllocatorError::CannotDoubleFree` if a block is already free
    ///
    /// Both indicate a broken invariant on the caller side.
    #[instrument(skip_all)]
    pub fn free(&mut self, block_ids: &[BlockId]) -> Result<(), BlockAllocatorError> {
        let span = self.span.clone();
        let _enter = span.enter();
        for block_id in block_ids {
            let block = self.block_mut(*block_id)?;
            if block.ref_count() == 0 {
                error!("Double free! {block_id} is already freed.");
                return Err(BlockAllocatorError::CannotDoubleFree(*block_id));
            }
            block.decrease_ref_count()?;
            if block.ref_count() == 0 {
                self.free_blocks.push(*block_id);
            }
        }
        Ok(())
    }

    /// Reference count of a block
    pub fn ref_count(&self, block_id: BlockId) -> Result<usize, BlockAllocatorError> {
        self.blocks
            .get(block_id as usize)
            .map(|b| b.ref_count())
            .ok_or(BlockAllocatorError::BlockNotFound(block_id))
    }

    /// Getter for `device`
    pub fn device(&self) -> BlockDevice {
        self.device
    }

    /// Gets number of free blocks
    pub fn get_num_free_blocks(&self) -> usize {
        self.free_blocks.len()
    }

    /// Gets total number of blocks
    pub fn get_num_total_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn block_mut(&mut self, block_id: BlockId) -> Result<&mut PhysicalTokenBlock, BlockAllocatorError> {
        let device = self.device;
        self.blocks.get_mut(block_id as usize).ok_or_else(|| {
            error!("Block {block_id} does not belong to the {device:?} pool");
            BlockAllocatorError::BlockNotFound(block_id)
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockAllocatorError {
    #[error("Cannot free unused block, with block_number = `{0}`")]
    CannotDoubleFree(BlockId),
    #[error("Block not found, with block_number = `{0}`")]
    BlockNotFound(BlockId),
    #[error("Block is not allocated, with block_number = `{0}`")]
    BlockNotAllocated(BlockId),
    #[error("Out of memory error, requested `{requested}` blocks but `{available}` are available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("Block error: `{0}`")]
    BlockError(#[from] BlockError),
}
