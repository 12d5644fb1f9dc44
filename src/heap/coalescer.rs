//! Coalescer.
//!
//! 解放されたブロックを、前後に隣接する空きブロックと併合してからフリーリングに戻す.
//!
//! 隣接ブロックの状態は境界タグから判定する.
//! 直前のブロックのフッタは`Block::read_from`で合わせて読み込まれるので、
//! 前方の併合判定のために追加のI/Oは発生しない.
use super::block::{Block, BlockOffset, MAX_BLOCK_SIZE};
use super::Heap;
use crate::nvm::NonVolatileMemory;
use crate::{ErrorKind, Result};

impl<N> Heap<N>
where
    N: NonVolatileMemory,
{
    /// `offset`の割当済みブロックを解放する.
    ///
    /// 返り値は、解放されたブロック自体の長さ(併合前の値).
    pub(super) fn release_block(&mut self, offset: BlockOffset) -> Result<u32> {
        let read = track!(self.read_block(offset))?;
        let released = read.block;
        track_assert!(
            !released.is_free(),
            ErrorKind::InvalidInput,
            "Not an allocated block: {:?}",
            released
        );

        let mut start = released.offset;
        let mut len = released.len;

        if let Some(tag) = read.predecessor.filter(|t| t.free) {
            let prev_offset = track_assert_some!(
                start.backward(tag.len),
                ErrorKind::StorageCorrupted,
                "Broken footer before {:?}: {:?}",
                start,
                tag
            );
            let prev = track!(self.read_block(prev_offset))?.block;
            track_assert_eq!(
                prev.tag(),
                tag,
                ErrorKind::StorageCorrupted,
                "Header and footer mismatch: {:?}",
                prev_offset
            );
            if let Some(merged) = checked_merge(prev.len, len) {
                track!(self.unlink_block(&prev))?;
                start = prev.offset;
                len = merged;
                self.metrics.merged_blocks.increment();
            }
        }

        let next_offset = released.end();
        if next_offset.as_u64() < self.wilderness {
            let next = track!(self.read_block(next_offset))?.block;
            if next.is_free() {
                if let Some(merged) = checked_merge(len, next.len) {
                    track!(self.unlink_block(&next))?;
                    len = merged;
                    self.metrics.merged_blocks.increment();
                }
            }
        }

        track!(self.link_block(start, len))?;
        Ok(released.len)
    }
}

// 併合後の長さがブロック長の上限を超える場合には`None`を返す.
fn checked_merge(a: u32, b: u32) -> Option<u32> {
    a.checked_add(b).filter(|&n| n <= MAX_BLOCK_SIZE)
}

/// 二つのブロックが併合可能かどうか.
pub(super) fn mergeable(a: &Block, b: &Block) -> bool {
    a.is_free() && b.is_free() && checked_merge(a.len, b.len).is_some()
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::heap::{Allocation, POOL_TABLE_SIZE};
    use crate::nvm::MemoryNvm;

    // 長さ100(ブロック長112)の領域を`n`個割り当てる
    fn heap_with_allocations(n: usize) -> Result<(Heap<MemoryNvm>, Vec<Allocation>)> {
        let mut heap = track!(Heap::create(MemoryNvm::default()))?;
        let mut allocations = Vec::new();
        for _ in 0..n {
            allocations.push(track!(heap.allocate(100))?);
        }
        Ok((heap, allocations))
    }

    fn free_block_at(heap: &mut Heap<MemoryNvm>, allocation: &Allocation) -> Result<Block> {
        let offset = track_assert_some!(
            BlockOffset::from_payload(allocation.offset),
            ErrorKind::Other
        );
        let block = track!(heap.read_block(offset))?.block;
        track_assert!(block.is_free(), ErrorKind::Other);
        Ok(block)
    }

    #[test]
    fn release_without_free_neighbors() -> TestResult {
        let (mut heap, a) = track!(heap_with_allocations(3))?;
        track!(heap.release(a[1].offset))?;

        let block = track!(free_block_at(&mut heap, &a[1]))?;
        assert_eq!(block.len, 112);
        assert_eq!(heap.metrics().merged_blocks(), 0);

        let summary = track!(heap.check())?;
        assert_eq!(summary.allocated_blocks, 2);
        assert_eq!(summary.free_blocks, 1);
        Ok(())
    }

    #[test]
    fn merge_with_predecessor() -> TestResult {
        let (mut heap, a) = track!(heap_with_allocations(3))?;
        track!(heap.release(a[0].offset))?;
        track!(heap.release(a[1].offset))?;

        let block = track!(free_block_at(&mut heap, &a[0]))?;
        assert_eq!(block.len, 224);
        assert_eq!(heap.metrics().merged_blocks(), 1);

        let summary = track!(heap.check())?;
        assert_eq!(summary.free_blocks, 1);
        assert_eq!(summary.free_bytes, 224);
        Ok(())
    }

    #[test]
    fn merge_with_successor() -> TestResult {
        let (mut heap, a) = track!(heap_with_allocations(3))?;
        track!(heap.release(a[1].offset))?;
        track!(heap.release(a[0].offset))?;

        let block = track!(free_block_at(&mut heap, &a[0]))?;
        assert_eq!(block.len, 224);

        let summary = track!(heap.check())?;
        assert_eq!(summary.free_blocks, 1);
        Ok(())
    }

    #[test]
    fn merge_with_both_neighbors() -> TestResult {
        let (mut heap, a) = track!(heap_with_allocations(4))?;
        track!(heap.release(a[0].offset))?;
        track!(heap.release(a[2].offset))?;
        assert_eq!(track!(heap.check())?.free_blocks, 2);

        track!(heap.release(a[1].offset))?;
        let block = track!(free_block_at(&mut heap, &a[0]))?;
        assert_eq!(block.len, 336);
        assert_eq!(heap.metrics().merged_blocks(), 2);
        assert_eq!(heap.metrics().free_ring_delta(), 1);
        assert_eq!(heap.metrics().released_blocks(), 3);
        assert_eq!(heap.metrics().released_bytes(), 112 * 3);

        let summary = track!(heap.check())?;
        assert_eq!(summary.allocated_blocks, 1);
        assert_eq!(summary.free_blocks, 1);
        assert_eq!(summary.free_bytes, 336);

        // 併合されたブロックから再び割り当てられる
        let b = track!(heap.allocate(300))?;
        assert_eq!(b.offset, a[0].offset);
        assert_eq!(heap.wilderness(), POOL_TABLE_SIZE + 112 * 4);
        Ok(())
    }

    #[test]
    fn last_block_is_kept_in_the_heap() -> TestResult {
        let (mut heap, a) = track!(heap_with_allocations(2))?;
        let wilderness = heap.wilderness();
        track!(heap.release(a[1].offset))?;

        // 末尾のブロックを解放してもファイルは縮まない
        assert_eq!(heap.wilderness(), wilderness);
        assert_eq!(heap.nvm().as_bytes().len() as u64, wilderness);
        let block = track!(free_block_at(&mut heap, &a[1]))?;
        assert_eq!(block.end().as_u64(), wilderness);

        track!(heap.release(a[0].offset))?;
        let summary = track!(heap.check())?;
        assert_eq!(summary.free_blocks, 1);
        assert_eq!(summary.free_bytes, wilderness - POOL_TABLE_SIZE);
        Ok(())
    }

    #[test]
    fn oversized_merge_is_skipped() {
        assert_eq!(checked_merge(24, 24), Some(48));
        assert_eq!(checked_merge(MAX_BLOCK_SIZE - 24, 24), Some(MAX_BLOCK_SIZE));
        assert_eq!(checked_merge(MAX_BLOCK_SIZE - 24, 32), None);
        assert_eq!(checked_merge(MAX_BLOCK_SIZE, MAX_BLOCK_SIZE), None);
    }
}
