//! Free Ring.
//!
//! サイズクラス毎の空きブロックの循環双方向リストの操作.
//!
//! リングの先頭位置はプールテーブルに、各要素の前後の位置は空きブロック自身のヘッダに格納されている.
//! リンクの付け替えは、対象ブロックを読み直した上でヘッダのみを書き戻すことで行う.
use super::block::{Block, BlockOffset, WriteMode};
use super::size_class::SizeClass;
use super::Heap;
use crate::nvm::NonVolatileMemory;
use crate::{ErrorKind, Result};

impl<N> Heap<N>
where
    N: NonVolatileMemory,
{
    /// `offset`から始まる長さ`len`の領域を空きブロックとしてリングに追加する.
    ///
    /// ブロックのヘッダとフッタは、この中で書き込まれる.
    pub(super) fn link_block(&mut self, offset: BlockOffset, len: u32) -> Result<Block> {
        let class = SizeClass::of(u64::from(len));
        let block = match self.pools.head(class) {
            None => {
                // 自分自身だけからなるリングを作る
                let block = Block::free(offset, len, offset, offset);
                track!(self.write_block(&block, WriteMode::Full))?;
                track!(self.pools.set_head(&mut self.nvm, class, Some(offset)))?;
                self.hints.bump_epoch();
                block
            }
            Some(head) => {
                // 先頭の直後に挿入する
                let head_block = track!(self.read_block(head))?.block;
                let (_, next) = track_assert_some!(
                    head_block.ring(),
                    ErrorKind::StorageCorrupted,
                    "Ring head is not free: {:?}",
                    head_block
                );
                let block = Block::free(offset, len, head, next);
                track!(self.write_block(&block, WriteMode::Full))?;
                track!(self.relink(head, None, Some(offset)))?;
                track!(self.relink(next, Some(offset), None))?;
                block
            }
        };
        self.hints.raise_watermark(class, len);
        self.metrics.linked_blocks.increment();
        Ok(block)
    }

    /// 空きブロック`block`を、それが属するリングから取り除く.
    ///
    /// `block`自体の内容は変更されない(呼び出し側で上書きされることが前提).
    /// ウォーターマークは減少させない.
    pub(super) fn unlink_block(&mut self, block: &Block) -> Result<()> {
        let (prev, next) = track_assert_some!(
            block.ring(),
            ErrorKind::InconsistentState,
            "Not a free block: {:?}",
            block
        );
        let class = block.class();
        if next == block.offset {
            track_assert_eq!(
                self.pools.head(class),
                Some(block.offset),
                ErrorKind::StorageCorrupted
            );
            track!(self.pools.set_head(&mut self.nvm, class, None))?;
        } else {
            track!(self.relink(prev, None, Some(next)))?;
            track!(self.relink(next, Some(prev), None))?;
            if self.pools.head(class) == Some(block.offset) {
                track!(self.pools.set_head(&mut self.nvm, class, Some(next)))?;
            }
        }
        self.metrics.unlinked_blocks.increment();
        Ok(())
    }

    // `target`のリング上の前後のポインタのうち、`Some`が指定されたものを更新する.
    fn relink(
        &mut self,
        target: BlockOffset,
        prev: Option<BlockOffset>,
        next: Option<BlockOffset>,
    ) -> Result<()> {
        let block = track!(self.read_block(target))?.block;
        let (old_prev, old_next) = track_assert_some!(
            block.ring(),
            ErrorKind::StorageCorrupted,
            "Ring member is not free: {:?}",
            block
        );
        let block = Block::free(
            block.offset,
            block.len,
            prev.unwrap_or(old_prev),
            next.unwrap_or(old_next),
        );
        track!(self.write_block(&block, WriteMode::HeaderOnly))
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::nvm::MemoryNvm;

    // 指定された長さの割当済みブロックを末尾に並べたヒープを作る
    fn heap_with_blocks(lens: &[u32]) -> Result<(Heap<MemoryNvm>, Vec<BlockOffset>)> {
        let mut heap = track!(Heap::create(MemoryNvm::default()))?;
        let mut offsets = Vec::new();
        for &len in lens {
            let block = track!(heap.grow_wilderness(len))?;
            offsets.push(block.offset);
        }
        Ok((heap, offsets))
    }

    fn ring_of(heap: &mut Heap<MemoryNvm>, class: SizeClass) -> Result<Vec<BlockOffset>> {
        let mut members = Vec::new();
        if let Some(head) = heap.pools.head(class) {
            let mut current = head;
            loop {
                members.push(current);
                let block = track!(heap.read_block(current))?.block;
                let (_, next) = block.ring().expect("free block");
                let next_block = track!(heap.read_block(next))?.block;
                assert_eq!(next_block.ring().map(|r| r.0), Some(current));
                current = next;
                if current == head {
                    break;
                }
            }
        }
        Ok(members)
    }

    #[test]
    fn link_and_unlink_works() -> TestResult {
        let (mut heap, offsets) = track!(heap_with_blocks(&[48, 24, 48, 24, 48, 24]))?;
        let class = SizeClass::of(48);
        let epoch = heap.hints.epoch();

        // 新規リング
        let a = track!(heap.link_block(offsets[0], 48))?;
        assert_eq!(heap.pools.head(class), Some(a.offset));
        assert_eq!(heap.hints.epoch(), epoch + 1);
        assert_eq!(track!(ring_of(&mut heap, class))?, vec![offsets[0]]);

        // 先頭の直後に挿入される
        let b = track!(heap.link_block(offsets[2], 48))?;
        assert_eq!(heap.hints.epoch(), epoch + 1);
        assert_eq!(track!(ring_of(&mut heap, class))?, vec![offsets[0], offsets[2]]);
        let c = track!(heap.link_block(offsets[4], 48))?;
        assert_eq!(
            track!(ring_of(&mut heap, class))?,
            vec![offsets[0], offsets[4], offsets[2]]
        );

        // 中間要素の削除
        let c = track!(heap.read_block(c.offset))?.block;
        track!(heap.unlink_block(&c))?;
        assert_eq!(track!(ring_of(&mut heap, class))?, vec![offsets[0], offsets[2]]);

        // 先頭要素の削除
        let a = track!(heap.read_block(a.offset))?.block;
        track!(heap.unlink_block(&a))?;
        assert_eq!(heap.pools.head(class), Some(offsets[2]));
        assert_eq!(track!(ring_of(&mut heap, class))?, vec![offsets[2]]);

        // 最後の要素の削除
        let b = track!(heap.read_block(b.offset))?.block;
        track!(heap.unlink_block(&b))?;
        assert_eq!(heap.pools.head(class), None);
        assert_eq!(track!(ring_of(&mut heap, class))?, vec![]);

        // プールテーブルはファイルにも反映されている
        assert!(heap.nvm.as_bytes()[..8 * 155].iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn unlink_rejects_allocated_block() -> TestResult {
        let (mut heap, offsets) = track!(heap_with_blocks(&[24]))?;
        let block = track!(heap.read_block(offsets[0]))?.block;
        let e = heap.unlink_block(&block).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InconsistentState));
        Ok(())
    }
}
