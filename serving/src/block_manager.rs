use std::collections::HashMap;

use crate::{
    block::{num_blocks_for_tokens, BlockDevice, BlockId, BlockTable},
    block_allocator::{BlockAllocator, BlockAllocatorError},
};

use thiserror::Error;
use tracing::{debug, error, info_span, instrument, trace, Span};

/// Represents the status of a potential block allocation for a sequence.
///
/// - `Ok`: The sequence can be allocated immediately.
/// - `Later`: The sequence cannot be allocated now, but may be allocated later.
///     This occurs when the allocator's capacity is sufficient,
///     but most of the blocks are currently in use.
/// - `Never`: The sequence can never be allocated because it requires more blocks
///     than the GPU's total capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStatus {
    Ok,
    Later,
    Never,
}

/// `BlockSpaceManager` - Manages the mapping between sequences and physical token blocks.
///
/// It owns one `BlockAllocator` per device. The GPU pool backs running sequences,
/// the CPU pool is the secondary store used by swap based preemption.
#[derive(Debug)]
pub struct BlockSpaceManager {
    /// Block size
    block_size: usize,
    /// Block tables, mapping: `sequence_id` -> `BlockTable`
    block_tables: HashMap<u64, BlockTable>,
    /// CPU allocator
    cpu_allocator: BlockAllocator,
    /// GPU allocator
    gpu_allocator: BlockAllocator,
    /// Tracing span
    span: Span,
}

impl BlockSpaceManager {
    /// Constructor
    pub fn new(block_size: usize, num_cpu_blocks: usize, num_gpu_blocks: usize) -> Self {
        Self {
            block_size,
            block_tables: HashMap::new(),
            cpu_allocator: BlockAllocator::new(block_size, BlockDevice::Cpu, num_cpu_blocks),
            gpu_allocator: BlockAllocator::new(block_size, BlockDevice::Gpu, num_gpu_blocks),
            span: info_span!("block-space-manager"),
        }
    }

    /// Checks whether a sequence of `num_tokens` tokens can be allocated on the GPU,
    /// keeping `reserved_blocks` free blocks aside for sequences that are already running.
    pub fn can_allocate(&self, num_tokens: usize, reserved_blocks: usize) -> AllocationStatus {
        let num_required_blocks = num_blocks_for_tokens(num_tokens, self.block_size);
        if num_required_blocks > self.gpu_allocator.get_num_total_blocks() {
            return AllocationStatus::Never;
        }
        if num_required_blocks + reserved_blocks > self.gpu_allocator.get_num_free_blocks() {
            return AllocationStatus::Later;
        }
        AllocationStatus::Ok
    }

    /// Allocates a fresh GPU block table, covering `num_tokens` tokens, for a sequence.
    ///
    /// # Errors
    ///
    /// * `BlockSpaceManagerError::SequenceAlreadyAllocated` if the sequence owns a table already
    /// * `BlockSpaceManagerError::BlockAllocatorError` if the pool cannot satisfy the request
    #[instrument(skip(self))]
    pub fn allocate(
        &mut self,
        sequence_id: u64,
        num_tokens: usize,
    ) -> Result<(), BlockSpaceManagerError> {
        let _enter = self.span.enter();
        if self.block_tables.contains_key(&sequence_id) {
            error!("Sequence with id = {sequence_id} already owns a block table");
            return Err(BlockSpaceManagerError::SequenceAlreadyAllocated(sequence_id));
        }

        let num_required_blocks = num_blocks_for_tokens(num_tokens, self.block_size);
        let block_ids = self.gpu_allocator.allocate(num_required_blocks)?;
        trace!("Allocated blocks {block_ids:?} for sequence with id = {sequence_id}");
        self.block_tables
            .insert(sequence_id, BlockTable::new(BlockDevice::Gpu, block_ids));

        Ok(())
    }

    /// Number of free GPU blocks a sequence needs, so that its table covers
    /// `new_len` tokens once its length grows from `current_len` to `new_len`.
    ///
    /// It accounts for the extension blocks, plus a copy-on-write block if the first
    /// block written to is shared with another table.
    pub fn num_required_blocks(
        &self,
        sequence_id: u64,
        current_len: usize,
        new_len: usize,
    ) -> Result<usize, BlockSpaceManagerError> {
        let block_table = self.gpu_block_table(sequence_id)?;
        let num_extension_blocks =
            num_blocks_for_tokens(new_len, self.block_size).saturating_sub(block_table.len());
        let num_copy_blocks = usize::from(self.written_block_is_shared(block_table, current_len, new_len)?);
        Ok(num_extension_blocks + num_copy_blocks)
    }

    /// Extends the block table of a sequence, so that it covers `new_len` tokens.
    ///
    /// If the block receiving the first new token is shared with another table, it
    /// performs copy-on-write: a new block is allocated, the shared block reference
    /// is released and the pair `(old, new)` is returned so that the KV contents
    /// can be copied before the write.
    #[instrument(skip(self))]
    pub fn append_slots(
        &mut self,
        sequence_id: u64,
        current_len: usize,
        new_len: usize,
    ) -> Result<Option<(BlockId, BlockId)>, BlockSpaceManagerError> {
        let _enter = self.span.enter();
        let (num_extension_blocks, cow_index) = {
            let block_table = self.gpu_block_table(sequence_id)?;
            let num_extension_blocks =
                num_blocks_for_tokens(new_len, self.block_size).saturating_sub(block_table.len());
            let cow_index = if self.written_block_is_shared(block_table, current_len, new_len)? {
                Some(current_len / self.block_size)
            } else {
                None
            };
            (num_extension_blocks, cow_index)
        };

        // All-or-nothing, we allocate every block needed before touching the table
        let mut new_blocks = self
            .gpu_allocator
            .allocate(num_extension_blocks + usize::from(cow_index.is_some()))?;

        let mut copy_on_write = None;
        if let Some(index) = cow_index {
            // DON'T PANIC: we requested at least one block above
            let new_block = new_blocks.remove(0);
            let block_table = self
                .block_tables
                .get_mut(&sequence_id)
                .ok_or(BlockSpaceManagerError::MissingSequence(sequence_id))?;
            let old_block = block_table
                .replace(index, new_block)
                .ok_or(BlockSpaceManagerError::MissingSequence(sequence_id))?;
            self.gpu_allocator.free(&[old_block])?;
            debug!("Copy on write for sequence with id = {sequence_id}, {old_block} -> {new_block}");
            copy_on_write = Some((old_block, new_block));
        }

        if !new_blocks.is_empty() {
            let block_table = self
                .block_tables
                .get_mut(&sequence_id)
                .ok_or(BlockSpaceManagerError::MissingSequence(sequence_id))?;
            trace!("Extending block table of sequence with id = {sequence_id} with {new_blocks:?}");
            block_table.extend(new_blocks);
        }

        Ok(copy_on_write)
    }

    /// Forks the block table of a parent sequence into a child sequence.
    ///
    /// No physical block is allocated, the child shares every block of the parent
    /// (each block's reference count grows by one). Writes into a shared block go
    /// through copy-on-write in `append_slots`.
    #[instrument(skip(self))]
    pub fn fork(
        &mut self,
        parent_sequence_id: u64,
        child_sequence_id: u64,
    ) -> Result<(), BlockSpaceManagerError> {
        let _enter = self.span.enter();
        if self.block_tables.contains_key(&child_sequence_id) {
            error!("Child sequence with id = {child_sequence_id} already owns a block table");
            return Err(BlockSpaceManagerError::SequenceAlreadyAllocated(
                child_sequence_id,
            ));
        }
        let source_block_table = self.gpu_block_table(parent_sequence_id)?.clone();
        for block_id in source_block_table.ids() {
            self.gpu_allocator.share(*block_id)?;
        }
        self.block_tables
            .insert(child_sequence_id, source_block_table);
        Ok(())
    }

    /// Checks if the GPU blocks of a sequence fit in the free CPU blocks.
    pub fn can_swap_out(&self, sequence_id: u64) -> Result<bool, BlockSpaceManagerError> {
        let block_table = self.gpu_block_table(sequence_id)?;
        Ok(block_table.len() <= self.cpu_allocator.get_num_free_blocks())
    }

    /// Swaps out the GPU blocks of a sequence into the CPU pool.
    ///
    /// # Returns
    ///
    /// A mapping of GPU block numbers to their corresponding CPU block numbers.
    #[instrument(skip(self))]
    pub fn swap_out(
        &mut self,
        sequence_id: u64,
    ) -> Result<HashMap<BlockId, BlockId>, BlockSpaceManagerError> {
        let _enter = self.span.enter();
        let gpu_block_ids = self.gpu_block_table(sequence_id)?.ids().to_vec();
        let cpu_block_ids = self.cpu_allocator.allocate(gpu_block_ids.len())?;
        self.gpu_allocator.free(&gpu_block_ids)?;

        trace!("Swapped out sequence with id = {sequence_id} to CPU blocks {cpu_block_ids:?}");
        let mapping = gpu_block_ids
            .into_iter()
            .zip(cpu_block_ids.iter().copied())
            .collect();
        self.block_tables
            .insert(sequence_id, BlockTable::new(BlockDevice::Cpu, cpu_block_ids));

        Ok(mapping)
    }

    /// Checks if a swapped out sequence can be brought back to the GPU, keeping
    /// `reserved_blocks` free blocks aside.
    pub fn can_swap_in(
        &self,
        sequence_id: u64,
        reserved_blocks: usize,
    ) -> Result<AllocationStatus, BlockSpaceManagerError> {
        let block_table = self.cpu_block_table(sequence_id)?;
        if block_table.len() > self.gpu_allocator.get_num_total_blocks() {
            return Ok(AllocationStatus::Never);
        }
        if block_table.len() + reserved_blocks > self.gpu_allocator.get_num_free_blocks() {
            return Ok(AllocationStatus::Later);
        }
        Ok(AllocationStatus::Ok)
    }

    /// Swaps in the CPU blocks of a sequence into the GPU pool.
    ///
    /// # Returns
    ///
    /// A mapping of CPU block numbers to their corresponding GPU block numbers.
    #[instrument(skip(self))]
    pub fn swap_in(
        &mut self,
        sequence_id: u64,
    ) -> Result<HashMap<BlockId, BlockId>, BlockSpaceManagerError> {
        let _enter = self.span.enter();
        let cpu_block_ids = self.cpu_block_table(sequence_id)?.ids().to_vec();
        let gpu_block_ids = self.gpu_allocator.allocate(cpu_block_ids.len())?;
        self.cpu_allocator.free(&cpu_block_ids)?;

        trace!("Swapped in sequence with id = {sequence_id} to GPU blocks {gpu_block_ids:?}");
        let mapping = cpu_block_ids
            .into_iter()
            .zip(gpu_block_ids.iter().copied())
            .collect();
        self.block_tables
            .insert(sequence_id, BlockTable::new(BlockDevice::Gpu, gpu_block_ids));

        Ok(mapping)
    }

    /// Releases the block table of a sequence. Freeing a sequence without a block
    /// table is a no-op.
    #[instrument(skip(self))]
    pub fn free(&mut self, sequence_id: u64) -> Result<(), BlockSpaceManagerError> {
        let _enter = self.span.enter();
        let block_table = match self.block_tables.remove(&sequence_id) {
            Some(block_table) => block_table,
            None => {
                trace!("Sequence with id = {sequence_id} owns no block table, nothing to free");
                return Ok(());
            }
        };

        match block_table.device() {
            BlockDevice::Gpu => self.gpu_allocator.free(block_table.ids())?,
            BlockDevice::Cpu => self.cpu_allocator.free(block_table.ids())?,
        }
        Ok(())
    }

    /// Releases every block table
    #[instrument(skip_all)]
    pub fn reset(&mut self) -> Result<(), BlockSpaceManagerError> {
        let sequence_ids = self.block_tables.keys().copied().collect::<Vec<_>>();
        for sequence_id in sequence_ids {
            self.free(sequence_id)?;
        }
        Ok(())
    }

    /// Block table of a sequence, if any
    pub fn block_table(&self, sequence_id: u64) -> Option<&BlockTable> {
        self.block_tables.get(&sequence_id)
    }

    /// Physical block ids of the block table of a sequence, if any
    pub fn get_block_table_ids(&self, sequence_id: u64) -> Option<Vec<BlockId>> {
        self.block_tables
            .get(&sequence_id)
            .map(|block_table| block_table.ids().to_vec())
    }

    /// Checks if the block table of a sequence lives in the CPU pool
    pub fn is_swapped(&self, sequence_id: u64) -> bool {
        self.block_tables
            .get(&sequence_id)
            .map(|block_table| block_table.device() == BlockDevice::Cpu)
            .unwrap_or(false)
    }

    /// Getter for `block_size`
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Gets the number of free GPU blocks
    pub fn get_number_of_free_gpu_blocks(&self) -> usize {
        self.gpu_allocator.get_num_free_blocks()
    }

    /// Gets the number of free CPU blocks
    pub fn get_number_of_free_cpu_blocks(&self) -> usize {
        self.cpu_allocator.get_num_free_blocks()
    }

    /// Gets the total number of GPU blocks
    pub fn get_num_total_gpu_blocks(&self) -> usize {
        self.gpu_allocator.get_num_total_blocks()
    }

    /// Gets the total number of CPU blocks
    pub fn get_num_total_cpu_blocks(&self) -> usize {
        self.cpu_allocator.get_num_total_blocks()
    }

    fn gpu_block_table(&self, sequence_id: u64) -> Result<&BlockTable, BlockSpaceManagerError> {
        self.device_block_table(sequence_id, BlockDevice::Gpu)
    }

    fn cpu_block_table(&self, sequence_id: u64) -> Result<&BlockTable, BlockSpaceManagerError> {
        self.device_block_table(sequence_id, BlockDevice::Cpu)
    }

    fn device_block_table(
        &self,
        sequence_id: u64,
        device: BlockDevice,
    ) -> Result<&BlockTable, BlockSpaceManagerError> {
        let block_table = self.block_tables.get(&sequence_id).ok_or_else(|| {
            error!("Missing block table for sequence with id = {sequence_id}");
            BlockSpaceManagerError::MissingSequence(sequence_id)
        })?;
        if block_table.device() != device {
            error!(
                "Block table of sequence with id = {sequence_id} lives on {:?}, expected {device:?}",
                block_table.device()
            );
            return Err(BlockSpaceManagerError::InvalidDevice {
                sequence_id,
                device: block_table.device(),
            });
        }
        Ok(block_table)
    }

    fn written_block_is_shared(
        &self,
        block_table: &BlockTable,
        current_len: usize,
        new_len: usize,
    ) -> Result<bool, BlockSpaceManagerError> {
        if new_len <= current_len {
            return Ok(false);
        }
        match block_table.get(current_len / self.block_size) {
            Some(block_id) => Ok(self.gpu_allocator.ref_count(block_id)? > 1),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
impl BlockSpaceManager {
    /// Number of distinct GPU blocks referenced by at least one block table
    pub(crate) fn num_referenced_gpu_blocks(&self) -> usize {
        self.block_tables
            .values()
            .filter(|block_table| block_table.device() == BlockDevice::Gpu)
            .flat_map(|block_table| block_table.ids().iter().copied())
            .collect::<std::collections::HashSet<_>>()
            .len()
    }
}

#[derive(Debug, Error)]
pub enum BlockSpaceManagerError {
    #[error("Block allocator error: `{0}`")]
    BlockAllocatorError(#[from] BlockAllocatorError),
    #[error("Missing block table for sequence with id = `{0}`")]
    MissingSequence(u64),
    #[error("Sequence with id = `{0}` already owns a block table")]
    SequenceAlreadyAllocated(u64),
    #[error("Block table of sequence with id = `{sequence_id}` lives on `{device:?}`")]
    InvalidDevice {
        sequence_id: u64,
        device: BlockDevice,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate() {
        const BLOCK_SIZE: usize = 4;
        const NUM_CPU_BLOCKS: usize = 4;
        const NUM_GPU_BLOCKS: usize = 4;
        let mut block_manager = BlockSpaceManager::new(BLOCK_SIZE, NUM_CPU_BLOCKS, NUM_GPU_BLOCKS);

        // Allocate one block per sequence, until all GPU blocks are in use
        for i in 0..NUM_GPU_BLOCKS {
            assert_eq!(block_manager.can_allocate(BLOCK_SIZE, 0), AllocationStatus::Ok);
            block_manager
                .allocate(i as u64, BLOCK_SIZE)
                .expect("Failed to allocate");
        }

        // We can't allocate further blocks, as all available blocks have been already allocated
        assert_eq!(
            block_manager.can_allocate(BLOCK_SIZE, 0),
            AllocationStatus::Later
        );
        // A sequence larger than the whole pool can never be allocated
        assert_eq!(
            block_manager.can_allocate(BLOCK_SIZE * NUM_GPU_BLOCKS + 1, 0),
            AllocationStatus::Never
        );
        assert!(matches!(
            block_manager.allocate(0, BLOCK_SIZE),
            Err(BlockSpaceManagerError::SequenceAlreadyAllocated(0))
        ));
    }

    #[test]
    fn test_can_allocate_with_reserved_blocks() {
        let block_manager = BlockSpaceManager::new(4, 0, 10);
        assert_eq!(block_manager.can_allocate(12, 7), AllocationStatus::Ok);
        assert_eq!(block_manager.can_allocate(12, 8), AllocationStatus::Later);
    }

    #[test]
    fn test_append_slot_single_seq() {
        const BLOCK_SIZE: usize = 4;
        let mut block_manager = BlockSpaceManager::new(BLOCK_SIZE, 4, 4);

        block_manager
            .allocate(0, BLOCK_SIZE)
            .expect("Failed to allocate block");

        // Nothing to append, the table already covers the sequence
        let before_num_free_blocks = block_manager.get_number_of_free_gpu_blocks();
        assert_eq!(block_manager.num_required_blocks(0, BLOCK_SIZE, BLOCK_SIZE).unwrap(), 0);
        assert!(block_manager
            .append_slots(0, BLOCK_SIZE, BLOCK_SIZE)
            .expect("Failed to append slot")
            .is_none());
        assert_eq!(
            before_num_free_blocks,
            block_manager.get_number_of_free_gpu_blocks()
        );

        // One more token requires a new block
        assert_eq!(
            block_manager.num_required_blocks(0, BLOCK_SIZE, BLOCK_SIZE + 1).unwrap(),
            1
        );
        assert!(block_manager
            .append_slots(0, BLOCK_SIZE, BLOCK_SIZE + 1)
            .expect("Failed to append slot")
            .is_none());
        assert_eq!(
            before_num_free_blocks,
            block_manager.get_number_of_free_gpu_blocks() + 1
        );
        assert_eq!(block_manager.get_block_table_ids(0), Some(vec![0, 1]));

        // The next tokens fit in the last block
        assert!(block_manager
            .append_slots(0, BLOCK_SIZE + 1, 2 * BLOCK_SIZE)
            .expect("Failed to append slot")
            .is_none());
        assert_eq!(block_manager.get_block_table_ids(0), Some(vec![0, 1]));
    }

    #[test]
    fn test_append_slot_with_cow() {
        const BLOCK_SIZE: usize = 4;
        let mut block_manager = BlockSpaceManager::new(BLOCK_SIZE, 4, 4);

        // Allocates a 3 token prompt to a single GPU block, one slot is left in the block
        block_manager.allocate(0, 3).expect("Failed to allocate");

        // Fork the sequence (increase `ref_count` by one) so that CoW will be required when we append a new token
        block_manager.fork(0, 2).expect("Failed to fork");
        assert_eq!(block_manager.get_block_table_ids(2), Some(vec![0]));
        assert_eq!(block_manager.get_number_of_free_gpu_blocks(), 3);

        assert_eq!(block_manager.num_required_blocks(2, 3, 4).unwrap(), 1);
        let before_num_free_blocks = block_manager.get_number_of_free_gpu_blocks();
        let cows = block_manager
            .append_slots(2, 3, 4)
            .expect("Failed to append slots to child sequence");
        assert_eq!(cows, Some((0, 1)));
        assert_eq!(block_manager.get_block_table_ids(2), Some(vec![1]));
        assert_eq!(block_manager.get_block_table_ids(0), Some(vec![0]));
        assert_eq!(
            before_num_free_blocks,
            block_manager.get_number_of_free_gpu_blocks() + 1
        );

        // The parent now owns the block alone, no more copies
        assert_eq!(block_manager.append_slots(0, 3, 4).unwrap(), None);
    }

    #[test]
    fn test_fork_and_free() {
        const BLOCK_SIZE: usize = 4;
        let mut block_manager = BlockSpaceManager::new(BLOCK_SIZE, 4, 8);

        block_manager.allocate(0, 8).expect("Failed to allocate");
        block_manager.fork(0, 1).expect("Failed to fork");
        assert_eq!(
            block_manager.get_block_table_ids(0),
            block_manager.get_block_table_ids(1)
        );
        assert_eq!(block_manager.get_number_of_free_gpu_blocks(), 6);
        assert_eq!(block_manager.num_referenced_gpu_blocks(), 2);

        // Freeing the parent keeps the shared blocks alive
        block_manager.free(0).expect("Failed to free");
        assert_eq!(block_manager.get_number_of_free_gpu_blocks(), 6);
        block_manager.free(1).expect("Failed to free");
        assert_eq!(block_manager.get_number_of_free_gpu_blocks(), 8);

        // Freeing twice is a no-op
        block_manager.free(1).expect("Failed to free");
        assert_eq!(block_manager.get_number_of_free_gpu_blocks(), 8);

        assert!(matches!(
            block_manager.fork(5, 6),
            Err(BlockSpaceManagerError::MissingSequence(5))
        ));
    }

    #[test]
    fn test_swap() {
        const BLOCK_SIZE: usize = 4;
        let mut block_manager = BlockSpaceManager::new(BLOCK_SIZE, 4, 4);

        block_manager.allocate(0, 6).expect("Failed to allocate");
        let gpu_blocks = block_manager.get_block_table_ids(0).unwrap();
        assert!(block_manager.can_swap_out(0).unwrap());

        let before_cpu_blocks = block_manager.get_number_of_free_cpu_blocks();
        let before_gpu_blocks = block_manager.get_number_of_free_gpu_blocks();
        let mapping = block_manager.swap_out(0).expect("Failed to swap out");
        assert_eq!(mapping.len(), 2);
        assert_eq!(
            mapping.keys().copied().collect::<std::collections::HashSet<_>>(),
            gpu_blocks.iter().copied().collect()
        );
        assert!(block_manager.is_swapped(0));
        assert_eq!(
            block_manager.get_number_of_free_cpu_blocks(),
            before_cpu_blocks - 2
        );
        assert_eq!(
            block_manager.get_number_of_free_gpu_blocks(),
            before_gpu_blocks + 2
        );

        // A swapped out table cannot grow
        assert!(matches!(
            block_manager.append_slots(0, 6, 7),
            Err(BlockSpaceManagerError::InvalidDevice { .. })
        ));

        assert_eq!(block_manager.can_swap_in(0, 0).unwrap(), AllocationStatus::Ok);
        assert_eq!(block_manager.can_swap_in(0, 3).unwrap(), AllocationStatus::Later);
        let mapping = block_manager.swap_in(0).expect("Failed to swap in");
        assert_eq!(mapping.len(), 2);
        assert!(!block_manager.is_swapped(0));
        assert_eq!(block_manager.get_number_of_free_cpu_blocks(), before_cpu_blocks);
        assert_eq!(block_manager.get_number_of_free_gpu_blocks(), before_gpu_blocks);
    }

    #[test]
    fn test_reset() {
        const BLOCK_SIZE: usize = 4;
        const NUM_GPU_BLOCKS: usize = 4;
        let mut block_manager = BlockSpaceManager::new(BLOCK_SIZE, 4, NUM_GPU_BLOCKS);

        for i in 0..NUM_GPU_BLOCKS {
            block_manager
                .allocate(i as u64, BLOCK_SIZE)
                .expect("Failed to allocate");
        }
        block_manager.swap_out(0).expect("Failed to swap out");
        assert_eq!(block_manager.get_number_of_free_gpu_blocks(), 1);

        block_manager.reset().expect("Failed to reset");
        assert_eq!(
            block_manager.get_number_of_free_gpu_blocks(),
            NUM_GPU_BLOCKS
        );
        assert_eq!(block_manager.get_number_of_free_cpu_blocks(), 4);
        assert!(block_manager.block_table(0).is_none());
    }
}
