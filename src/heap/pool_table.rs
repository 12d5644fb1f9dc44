//! Pool Table.
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use super::block::{BlockOffset, BLOCK_ALIGNMENT};
use super::size_class::{SizeClass, NUM_SIZE_CLASSES};
use crate::nvm::NonVolatileMemory;
use crate::{ErrorKind, Result};

/// 一つのエントリのサイズ.
const ENTRY_SIZE: u64 = 8;

/// ファイル先頭に配置されるプールテーブルのサイズ.
///
/// ブロック領域は、この直後から始まる.
pub const POOL_TABLE_SIZE: u64 = NUM_SIZE_CLASSES as u64 * ENTRY_SIZE;

/// サイズクラス毎のフリーリングの先頭位置を保持するテーブル.
///
/// ファイル上では155個の64bit整数(big-endian)として表現され、`0`は「リングが空」を意味する.
///
/// メモリ上のこの構造体は、ファイル上のテーブルの写しであり、
/// 更新は常に`set_head`経由で即座にファイルに書き戻される.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolTable {
    heads: Vec<Option<BlockOffset>>,
}
impl PoolTable {
    /// 全てのリングが空のテーブルを生成する.
    pub fn new() -> Self {
        PoolTable {
            heads: vec![None; NUM_SIZE_CLASSES],
        }
    }

    /// テーブルを`reader`から読み込む.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut heads = Vec::with_capacity(NUM_SIZE_CLASSES);
        for index in 0..NUM_SIZE_CLASSES {
            let head = track_io!(reader.read_u64::<BigEndian>())?;
            if head == 0 {
                heads.push(None);
                continue;
            }
            track_assert!(
                head >= POOL_TABLE_SIZE && head % BLOCK_ALIGNMENT == 0,
                ErrorKind::StorageCorrupted,
                "Broken pool table entry: class={}, head={}",
                index,
                head
            );
            heads.push(Some(BlockOffset::new(head)));
        }
        Ok(PoolTable { heads })
    }

    /// テーブル全体を`writer`に書き込む.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        for head in &self.heads {
            track_io!(writer.write_u64::<BigEndian>(Self::encode(*head)))?;
        }
        Ok(())
    }

    /// `class`のリングの先頭位置を返す.
    pub fn head(&self, class: SizeClass) -> Option<BlockOffset> {
        self.heads[class.index()]
    }

    /// `class`のリングの先頭位置を更新し、対応するエントリを`nvm`に書き戻す.
    pub fn set_head<N>(&mut self, nvm: &mut N, class: SizeClass, head: Option<BlockOffset>) -> Result<()>
    where
        N: NonVolatileMemory,
    {
        let mut buf = Vec::with_capacity(ENTRY_SIZE as usize);
        track_io!(buf.write_u64::<BigEndian>(Self::encode(head)))?;
        track!(nvm.write_all_at(class.index() as u64 * ENTRY_SIZE, &buf))?;
        self.heads[class.index()] = head;
        Ok(())
    }

    /// 空ではないリングを持つクラスの一覧を返す.
    pub fn non_empty_classes<'a>(&'a self) -> impl Iterator<Item = (SizeClass, BlockOffset)> + 'a {
        SizeClass::all().filter_map(move |class| self.head(class).map(|head| (class, head)))
    }

    fn encode(head: Option<BlockOffset>) -> u64 {
        head.map_or(0, |h| h.as_u64())
    }
}
