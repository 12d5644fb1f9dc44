//! Allocator.
//!
//! # 割当戦略
//!
//! 要求長が属するサイズクラスから上位のクラスに向かって、空ではないリングを順に探索する.
//! 各リングでは、要求長以上の長さを持つ最初の要素が選択される (first-fit).
//!
//! 選択された空きブロックは、余剰分が最小長以上であれば分割され、残りは再びリングに戻される.
//! 探索範囲内に適切なブロックが存在しない場合には、ファイル末尾(wilderness)を伸長して割当を行う.
use std::cmp;

use super::block::{Block, BlockOffset, WriteMode, MIN_BLOCK_SIZE};
use super::size_class::{SizeClass, NUM_SIZE_CLASSES};
use super::Heap;
use crate::nvm::NonVolatileMemory;
use crate::{ErrorKind, Result};

impl<N> Heap<N>
where
    N: NonVolatileMemory,
{
    /// 長さ`len`のブロックを割り当てる.
    pub(super) fn allocate_block(&mut self, len: u32) -> Result<Block> {
        let start = SizeClass::of(u64::from(len));
        let (found, stopped) = track!(self.find_free_block(start, len))?;
        self.hints.set_skip(start, stopped);
        match found {
            Some(free) => track!(self.carve(free, len)),
            None => track!(self.grow_wilderness(len)),
        }
    }

    /// 長さ`len`以上の空きブロックを探す.
    ///
    /// 返り値のタプルの二番目の値は、探索を終えたクラスのインデックス.
    fn find_free_block(&mut self, start: SizeClass, len: u32) -> Result<(Option<Block>, usize)> {
        let mut resume = start.index();
        if self.pools.head(start).is_none() {
            if let Some(skip) = self.hints.skip(start) {
                debug!(
                    self.logger,
                    "Skip cache hit";
                    "class" => start.index(),
                    "resume" => skip,
                    "epoch" => self.hints.epoch()
                );
                self.metrics.skip_cache_hits.increment();
                resume = skip;
            }
        }

        let end = cmp::min(resume + self.scan_limit, NUM_SIZE_CLASSES);
        for index in resume..end {
            let class = track_assert_some!(SizeClass::new(index), ErrorKind::InconsistentState);
            let head = match self.pools.head(class) {
                None => continue,
                Some(head) => head,
            };
            if !self.hints.may_contain(class, u64::from(len)) {
                continue;
            }
            if let Some(block) = track!(self.scan_ring(class, head, len))? {
                return Ok((Some(block), index));
            }
        }
        if end < NUM_SIZE_CLASSES {
            debug!(
                self.logger,
                "Scan window exhausted";
                "class" => start.index(),
                "resume" => resume,
                "end" => end
            );
        }
        Ok((None, end))
    }

    // リングを一周して、長さ`len`以上の最初の要素を探す.
    // 見つからなかった場合には、リング中の最大長をウォーターマークとして記録する.
    fn scan_ring(&mut self, class: SizeClass, head: BlockOffset, len: u32) -> Result<Option<Block>> {
        let max_members = (self.wilderness - BlockOffset::FIRST.as_u64()) / u64::from(MIN_BLOCK_SIZE);
        let mut largest = 0;
        let mut current = head;
        for _ in 0..max_members {
            let block = track!(self.read_block(current))?.block;
            self.metrics.scanned_blocks.increment();

            let (_, next) = track_assert_some!(
                block.ring(),
                ErrorKind::StorageCorrupted,
                "Ring member is not free: {:?}",
                block
            );
            if len <= block.len {
                return Ok(Some(block));
            }
            largest = cmp::max(largest, block.len);
            current = next;
            if current == head {
                self.hints.set_watermark(class, largest);
                return Ok(None);
            }
        }
        track_panic!(
            ErrorKind::StorageCorrupted,
            "Free ring does not return to its head: class={}, head={:?}",
            class.index(),
            head
        );
    }

    // 空きブロック`free`から、長さ`len`の割当済みブロックを切り出す.
    fn carve(&mut self, free: Block, len: u32) -> Result<Block> {
        track!(self.unlink_block(&free))?;

        let mode = if self.zero_fill {
            WriteMode::ZeroFilled
        } else {
            WriteMode::Full
        };
        let remainder = free.len - len;
        if remainder < MIN_BLOCK_SIZE {
            let block = Block::allocated(free.offset, free.len);
            track!(self.write_block(&block, mode))?;
            return Ok(block);
        }

        let block = Block::allocated(free.offset, len);
        track!(self.write_block(&block, mode))?;
        track!(self.link_block(block.end(), remainder))?;
        self.metrics.split_blocks.increment();
        Ok(block)
    }

    /// ファイル末尾を伸長して、長さ`len`の割当済みブロックを作る.
    pub(super) fn grow_wilderness(&mut self, len: u32) -> Result<Block> {
        let block = Block::allocated(BlockOffset::new(self.wilderness), len);
        track!(self.write_block(&block, WriteMode::ZeroFilled))?;
        self.wilderness = block.end().as_u64();
        self.metrics.count_extension(len, self.wilderness);
        debug!(
            self.logger,
            "Wilderness extended";
            "block_len" => len,
            "wilderness" => self.wilderness
        );
        Ok(block)
    }
}
