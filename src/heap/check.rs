//! ヒープの整合性検査.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::block::{Block, BlockOffset, MIN_BLOCK_SIZE};
use super::coalescer::mergeable;
use super::pool_table::{PoolTable, POOL_TABLE_SIZE};
use super::size_class::SizeClass;
use super::Heap;
use crate::nvm::NonVolatileMemory;
use crate::{ErrorKind, Result};

/// 整合性検査の結果得られた、ヒープの統計情報.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeapSummary {
    /// 割当済みブロックの数.
    pub allocated_blocks: u64,

    /// 割当済みブロックの合計バイト数(ヘッダ・フッタ込み).
    pub allocated_bytes: u64,

    /// 空きブロックの数.
    pub free_blocks: u64,

    /// 空きブロックの合計バイト数(ヘッダ・フッタ込み).
    pub free_bytes: u64,

    /// wilderness境界の位置.
    pub wilderness: u64,
}

impl<N> Heap<N>
where
    N: NonVolatileMemory,
{
    /// ヒープ全体を走査して、構造の整合性を検査する.
    ///
    /// 以下の点が検査される:
    ///
    /// - ファイル上のプールテーブルと、メモリ上のものが一致している
    /// - ブロック領域が、隙間なくブロックで敷き詰められている
    /// - 各ブロックのヘッダとフッタが一致している
    /// - 併合可能な空きブロック同士が隣接していない
    /// - 各フリーリングが閉じた循環双方向リストになっており、
    ///   そのサイズクラスに属する空きブロックのみを、漏れなく含んでいる
    ///
    /// 検査はファイル全体を読み込むので、ヒープのサイズに比例した時間が掛かる.
    ///
    /// # Errors
    ///
    /// 不整合が見つかった場合には`ErrorKind::StorageCorrupted`が返される.
    pub fn check(&mut self) -> Result<HeapSummary> {
        match self.check_impl() {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(self.logger, "Heap validation failed: {}", e);
                Err(e)
            }
        }
    }

    fn check_impl(&mut self) -> Result<HeapSummary> {
        track!(self.check_pool_table())?;
        let (summary, free_blocks) = track!(self.check_blocks())?;
        track!(self.check_rings(free_blocks))?;
        Ok(summary)
    }

    fn check_pool_table(&mut self) -> Result<()> {
        let mut buf = vec![0; POOL_TABLE_SIZE as usize];
        track!(self.nvm.read_exact_at(0, &mut buf))?;
        let stored = track!(PoolTable::read_from(&buf[..]))?;
        track_assert!(
            stored == self.pools,
            ErrorKind::StorageCorrupted,
            "Pool table on the storage differs from the cached one"
        );
        Ok(())
    }

    // ブロック列を先頭から順に辿り、空きブロックをクラス毎に集める.
    fn check_blocks(&mut self) -> Result<(HeapSummary, FreeBlocks)> {
        let mut summary = HeapSummary {
            wilderness: self.wilderness,
            ..HeapSummary::default()
        };
        let mut free_blocks = FreeBlocks::default();
        let mut prev: Option<Block> = None;
        let mut offset = BlockOffset::FIRST;
        while offset.as_u64() < self.wilderness {
            track_assert!(
                offset.as_u64() + u64::from(MIN_BLOCK_SIZE) <= self.wilderness,
                ErrorKind::StorageCorrupted,
                "Truncated block at {:?} (wilderness={})",
                offset,
                self.wilderness
            );
            let read = track!(self.read_block(offset))?;
            let block = read.block;

            let footer = track!(Block::read_footer(&mut self.nvm, &block))?;
            track_assert_eq!(
                footer,
                block.tag(),
                ErrorKind::StorageCorrupted,
                "Header and footer mismatch: {:?}",
                block
            );
            track_assert_eq!(
                read.predecessor,
                prev.as_ref().map(|p| p.tag()),
                ErrorKind::StorageCorrupted,
                "Unexpected predecessor of {:?}",
                block
            );
            if let Some(ref prev) = prev {
                track_assert!(
                    !mergeable(prev, &block),
                    ErrorKind::StorageCorrupted,
                    "Adjacent free blocks: {:?}, {:?}",
                    prev,
                    block
                );
            }

            if let Some((ring_prev, ring_next)) = block.ring() {
                summary.free_blocks += 1;
                summary.free_bytes += u64::from(block.len);
                free_blocks
                    .classes
                    .entry(block.class())
                    .or_insert_with(BTreeSet::new)
                    .insert(block.offset);
                free_blocks.links.insert(block.offset, (ring_prev, ring_next));
            } else {
                summary.allocated_blocks += 1;
                summary.allocated_bytes += u64::from(block.len);
            }
            offset = block.end();
            prev = Some(block);
        }
        track_assert_eq!(
            offset.as_u64(),
            self.wilderness,
            ErrorKind::StorageCorrupted
        );
        Ok((summary, free_blocks))
    }

    fn check_rings(&self, mut free_blocks: FreeBlocks) -> Result<()> {
        for class in SizeClass::all() {
            let members = free_blocks.classes.remove(&class).unwrap_or_default();
            let head = match self.pools.head(class) {
                None => {
                    track_assert!(
                        members.is_empty(),
                        ErrorKind::StorageCorrupted,
                        "Free blocks not in any ring: class={}, blocks={:?}",
                        class.index(),
                        members
                    );
                    continue;
                }
                Some(head) => head,
            };

            let mut visited = 0;
            let mut current = head;
            loop {
                track_assert!(
                    members.contains(&current),
                    ErrorKind::StorageCorrupted,
                    "Unexpected ring member: class={}, offset={:?}",
                    class.index(),
                    current
                );
                visited += 1;
                track_assert!(
                    visited <= members.len(),
                    ErrorKind::StorageCorrupted,
                    "Free ring does not return to its head: class={}, head={:?}",
                    class.index(),
                    head
                );

                let (_, next) = free_blocks.links[&current];
                let next_prev = free_blocks.links.get(&next).map(|l| l.0);
                track_assert_eq!(
                    next_prev,
                    Some(current),
                    ErrorKind::StorageCorrupted,
                    "Broken backward link: class={}, offset={:?}, next={:?}",
                    class.index(),
                    current,
                    next
                );
                current = next;
                if current == head {
                    break;
                }
            }
            track_assert_eq!(
                visited,
                members.len(),
                ErrorKind::StorageCorrupted,
                "Free blocks not in the ring: class={}",
                class.index()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FreeBlocks {
    classes: BTreeMap<SizeClass, BTreeSet<BlockOffset>>,
    links: HashMap<BlockOffset, (BlockOffset, BlockOffset)>,
}
