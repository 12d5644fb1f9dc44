//! Block Codec.
//!
//! ブロックのバイナリ形式(全て big-endian):
//!
//! ```text
//! offset+0           : header (4 bytes) = total_length | is_free
//! offset+4           : ring-prev (8 bytes)   ... 空きブロックの場合のみ意味を持つ
//! offset+12          : ring-next (8 bytes)   ... 同上
//! offset+20          : payload
//! offset+len-4       : footer (4 bytes) = header と同じ値
//! ```
//!
//! 割当済みブロックでは`offset+4`以降の全てが利用者向けのペイロードとなる.
//! ビット単位のパッキング(長さと空きフラグの共存)を扱うのは、このモジュールだけである.
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::cmp;

use super::pool_table::POOL_TABLE_SIZE;
use super::size_class::SizeClass;
use crate::nvm::NonVolatileMemory;
use crate::{ErrorKind, Result};

/// ブロックの境界に要求されるアライメント.
pub const BLOCK_ALIGNMENT: u64 = 8;

/// ブロックの最小長.
///
/// ヘッダ、リングの前後ポインタ、フッタを格納可能な長さ.
pub const MIN_BLOCK_SIZE: u32 = 24;

/// ブロックの最大長.
pub const MAX_BLOCK_SIZE: u32 = 0xFFFF_FFF8;

/// ヘッダ(境界タグ)のサイズ.
pub(crate) const TAG_SIZE: u64 = 4;

/// ヘッダとリングの前後ポインタを含めた、ブロック先頭の固定領域のサイズ.
pub(crate) const HEADER_REGION_SIZE: u64 = TAG_SIZE + 8 + 8;

/// 割当済みブロックのオーバヘッド(ヘッダとフッタ).
pub(crate) const ALLOCATION_OVERHEAD: u64 = TAG_SIZE * 2;

const FREE_FLAG: u32 = 1;

const ZERO_FILL_CHUNK_SIZE: usize = 64 * 1024;

/// ヒープファイル内のブロックの位置.
///
/// 値は常にブロック領域(プールテーブルの直後からwilderness境界まで)を指す.
/// 実際のファイルに対する範囲検査は、ブロックの読み込み時に行われる.
#[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct BlockOffset(u64);
impl BlockOffset {
    /// 先頭ブロックの位置.
    pub const FIRST: BlockOffset = BlockOffset(POOL_TABLE_SIZE);

    pub(crate) fn new(offset: u64) -> Self {
        BlockOffset(offset)
    }

    /// ペイロードの位置から、それを含むブロックの位置を求める.
    pub(crate) fn from_payload(payload_offset: u64) -> Option<Self> {
        payload_offset.checked_sub(TAG_SIZE).map(BlockOffset)
    }

    /// 位置の値を返す.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// ブロックのペイロードの開始位置を返す.
    pub fn payload(self) -> u64 {
        self.0 + TAG_SIZE
    }

    pub(crate) fn forward(self, len: u32) -> Self {
        BlockOffset(self.0 + u64::from(len))
    }

    pub(crate) fn backward(self, len: u32) -> Option<Self> {
        self.0.checked_sub(u64::from(len)).map(BlockOffset)
    }
}

/// 境界タグ.
///
/// ブロックの先頭(ヘッダ)と末尾(フッタ)に同じ値が格納される.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryTag {
    /// ブロックの長さ(ヘッダ・フッタ込み).
    pub len: u32,

    /// 空きブロックかどうか.
    pub free: bool,
}
impl BoundaryTag {
    pub(crate) fn decode(word: u32) -> Self {
        BoundaryTag {
            len: word & !FREE_FLAG,
            free: word & FREE_FLAG != 0,
        }
    }

    pub(crate) fn encode(self) -> u32 {
        if self.free {
            self.len | FREE_FLAG
        } else {
            self.len
        }
    }

    fn is_well_formed(self) -> bool {
        MIN_BLOCK_SIZE <= self.len && u64::from(self.len) % BLOCK_ALIGNMENT == 0
    }
}

/// ブロックの状態.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// 空きブロック.
    ///
    /// 同じサイズクラスのフリーリング上の、前後の要素を保持している.
    Free {
        /// リング上の前の要素.
        prev: BlockOffset,

        /// リング上の次の要素.
        next: BlockOffset,
    },

    /// 割当済みブロック.
    Allocated,
}

/// ヒープファイル内の一つのブロック.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// ブロックの位置.
    pub offset: BlockOffset,

    /// ブロックの長さ(ヘッダ・フッタ込み).
    pub len: u32,

    /// ブロックの状態.
    pub state: BlockState,
}
impl Block {
    /// 空きブロックを生成する.
    pub fn free(offset: BlockOffset, len: u32, prev: BlockOffset, next: BlockOffset) -> Self {
        Block {
            offset,
            len,
            state: BlockState::Free { prev, next },
        }
    }

    /// 割当済みブロックを生成する.
    pub fn allocated(offset: BlockOffset, len: u32) -> Self {
        Block {
            offset,
            len,
            state: BlockState::Allocated,
        }
    }

    /// 空きブロックかどうかを判定する.
    pub fn is_free(&self) -> bool {
        self.ring().is_some()
    }

    /// 空きブロックであれば、リング上の前後の要素を返す.
    pub fn ring(&self) -> Option<(BlockOffset, BlockOffset)> {
        match self.state {
            BlockState::Free { prev, next } => Some((prev, next)),
            BlockState::Allocated => None,
        }
    }

    /// ブロックの境界タグを返す.
    pub fn tag(&self) -> BoundaryTag {
        BoundaryTag {
            len: self.len,
            free: self.is_free(),
        }
    }

    /// ブロックが属するサイズクラスを返す.
    pub fn class(&self) -> SizeClass {
        SizeClass::of(u64::from(self.len))
    }

    /// 直後のブロックの位置を返す.
    pub fn end(&self) -> BlockOffset {
        self.offset.forward(self.len)
    }

    /// 割当済みブロックとして、利用者が使用可能なバイト数を返す.
    pub fn payload_len(&self) -> u64 {
        u64::from(self.len) - ALLOCATION_OVERHEAD
    }

    /// `offset`の位置にあるブロックを`nvm`から読み込む.
    ///
    /// 直前のブロックのフッタも合わせて読み込まれる.
    /// 先頭ブロックの場合には、直前のブロックは存在しないものとして扱われる.
    ///
    /// # Errors
    ///
    /// - `offset`がブロック領域の外を指している場合には`ErrorKind::InvalidInput`
    /// - 境界タグに有り得ない長さが記録されている場合には`ErrorKind::StorageCorrupted`
    pub(crate) fn read_from<N>(nvm: &mut N, offset: BlockOffset, wilderness: u64) -> Result<ReadBlock>
    where
        N: NonVolatileMemory,
    {
        track_assert!(
            offset >= BlockOffset::FIRST,
            ErrorKind::InvalidInput,
            "Out of the block area: {:?}",
            offset
        );
        track_assert_eq!(
            offset.as_u64() % BLOCK_ALIGNMENT,
            0,
            ErrorKind::InvalidInput,
            "Unaligned block offset: {:?}",
            offset
        );
        track_assert!(
            offset.as_u64() + u64::from(MIN_BLOCK_SIZE) <= wilderness,
            ErrorKind::InvalidInput,
            "Out of the block area: {:?} (wilderness={})",
            offset,
            wilderness
        );

        let has_predecessor = offset != BlockOffset::FIRST;
        let mut buf = [0; (TAG_SIZE + HEADER_REGION_SIZE) as usize];
        let buf = if has_predecessor {
            track!(nvm.read_exact_at(offset.as_u64() - TAG_SIZE, &mut buf[..]))?;
            &buf[..]
        } else {
            track!(nvm.read_exact_at(offset.as_u64(), &mut buf[TAG_SIZE as usize..]))?;
            &buf[TAG_SIZE as usize..]
        };
        let mut reader = buf;

        let predecessor = if has_predecessor {
            let tag = BoundaryTag::decode(track_io!(reader.read_u32::<BigEndian>())?);
            track_assert!(
                tag.is_well_formed()
                    && u64::from(tag.len) <= offset.as_u64() - BlockOffset::FIRST.as_u64(),
                ErrorKind::StorageCorrupted,
                "Broken footer before {:?}: {:?}",
                offset,
                tag
            );
            Some(tag)
        } else {
            None
        };

        let tag = BoundaryTag::decode(track_io!(reader.read_u32::<BigEndian>())?);
        track_assert!(
            tag.is_well_formed() && offset.as_u64() + u64::from(tag.len) <= wilderness,
            ErrorKind::StorageCorrupted,
            "Broken header at {:?}: {:?} (wilderness={})",
            offset,
            tag,
            wilderness
        );
        let prev = BlockOffset(track_io!(reader.read_u64::<BigEndian>())?);
        let next = BlockOffset(track_io!(reader.read_u64::<BigEndian>())?);

        let block = if tag.free {
            Block::free(offset, tag.len, prev, next)
        } else {
            Block::allocated(offset, tag.len)
        };
        Ok(ReadBlock { predecessor, block })
    }

    /// `block`のフッタを読み込む.
    pub(crate) fn read_footer<N>(nvm: &mut N, block: &Block) -> Result<BoundaryTag>
    where
        N: NonVolatileMemory,
    {
        let mut buf = [0; TAG_SIZE as usize];
        track!(nvm.read_exact_at(block.end().as_u64() - TAG_SIZE, &mut buf))?;
        let mut reader = &buf[..];
        let word = track_io!(reader.read_u32::<BigEndian>())?;
        Ok(BoundaryTag::decode(word))
    }

    /// ブロックを`nvm`に書き込む.
    pub(crate) fn write_to<N>(&self, nvm: &mut N, mode: WriteMode) -> Result<()>
    where
        N: NonVolatileMemory,
    {
        let (prev, next) = self
            .ring()
            .map_or((0, 0), |(prev, next)| (prev.as_u64(), next.as_u64()));
        let word = self.tag().encode();

        let mut header = Vec::with_capacity(HEADER_REGION_SIZE as usize);
        track_io!(header.write_u32::<BigEndian>(word))?;
        track_io!(header.write_u64::<BigEndian>(prev))?;
        track_io!(header.write_u64::<BigEndian>(next))?;

        let mut footer = Vec::with_capacity(TAG_SIZE as usize);
        track_io!(footer.write_u32::<BigEndian>(word))?;

        match mode {
            WriteMode::HeaderOnly => {
                track!(nvm.write_all_at(self.offset.as_u64(), &header))?;
            }
            WriteMode::Full => {
                track!(nvm.write_all_at(self.offset.as_u64(), &header))?;
                track!(nvm.write_all_at(self.end().as_u64() - TAG_SIZE, &footer))?;
            }
            WriteMode::ZeroFilled => {
                track!(nvm.write_all_at(self.offset.as_u64(), &header))?;
                let mut remaining =
                    (u64::from(self.len) - HEADER_REGION_SIZE - TAG_SIZE) as usize;
                let zeros = vec![0; cmp::min(remaining, ZERO_FILL_CHUNK_SIZE)];
                while remaining > 0 {
                    let size = cmp::min(remaining, zeros.len());
                    track_io!(nvm.write_all(&zeros[..size]))?;
                    remaining -= size;
                }
                track_io!(nvm.write_all(&footer))?;
            }
        }
        Ok(())
    }
}

/// ブロックの書き込み方法.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// ヘッダ(境界タグとリングの前後ポインタ)のみを書き込む.
    ///
    /// リングの付け替えのように、長さと状態が変わらない場合に使用する.
    HeaderOnly,

    /// ヘッダとフッタを書き込む.
    ///
    /// ペイロードの内容は変更されない.
    Full,

    /// ヘッダとフッタを書き込み、ペイロードをゼロで埋める.
    ///
    /// ファイル末尾を伸長する際には、このモードを使用する必要がある.
    ZeroFilled,
}

/// `Block::read_from`の結果.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadBlock {
    /// 直前のブロックの境界タグ (先頭ブロックの場合は`None`).
    pub predecessor: Option<BoundaryTag>,

    /// 読み込まれたブロック.
    pub block: Block,
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::nvm::{MemoryNvm, NonVolatileMemory};

    fn nvm_with_block_area(size: usize) -> MemoryNvm {
        MemoryNvm::new(vec![0xFF; POOL_TABLE_SIZE as usize + size])
    }

    #[test]
    fn boundary_tag_works() {
        let tag = BoundaryTag { len: 48, free: true };
        assert_eq!(tag.encode(), 49);
        assert_eq!(BoundaryTag::decode(49), tag);

        let tag = BoundaryTag { len: 48, free: false };
        assert_eq!(tag.encode(), 48);
        assert_eq!(BoundaryTag::decode(48), tag);

        assert_eq!(BoundaryTag::decode(MAX_BLOCK_SIZE | 1).len, MAX_BLOCK_SIZE);
    }

    #[test]
    fn write_and_read_works() -> TestResult {
        let mut nvm = nvm_with_block_area(24 + 48);
        let wilderness = nvm.size();
        let first = BlockOffset::FIRST;
        let second = first.forward(24);

        let a = Block::allocated(first, 24);
        let b = Block::free(second, 48, second, second);
        track!(a.write_to(&mut nvm, WriteMode::Full))?;
        track!(b.write_to(&mut nvm, WriteMode::ZeroFilled))?;

        let read = track!(Block::read_from(&mut nvm, first, wilderness))?;
        assert_eq!(read.predecessor, None);
        assert_eq!(read.block, a);
        assert_eq!(track!(Block::read_footer(&mut nvm, &a))?, a.tag());

        let read = track!(Block::read_from(&mut nvm, second, wilderness))?;
        assert_eq!(read.predecessor, Some(a.tag()));
        assert_eq!(read.block, b);
        assert_eq!(track!(Block::read_footer(&mut nvm, &b))?, b.tag());

        // 割当済みブロックのリングポインタ部分はゼロで書き込まれる
        let payload = &nvm.as_bytes()[first.as_u64() as usize + 4..][..16];
        assert_eq!(payload, &[0; 16][..]);

        // 空きブロックのペイロードはゼロ埋めされている
        let payload = &nvm.as_bytes()[second.as_u64() as usize + 20..][..24];
        assert_eq!(payload, &[0; 24][..]);
        Ok(())
    }

    #[test]
    fn header_only_write_keeps_footer_and_payload() -> TestResult {
        let mut nvm = nvm_with_block_area(64);
        let wilderness = nvm.size();
        let offset = BlockOffset::FIRST;

        let b = Block::free(offset, 64, offset, offset);
        track!(b.write_to(&mut nvm, WriteMode::Full))?;
        let payload_before = nvm.as_bytes()[offset.as_u64() as usize + 20..][..40].to_owned();

        let relinked = Block::free(offset, 64, BlockOffset::new(2000), BlockOffset::new(3000));
        track!(relinked.write_to(&mut nvm, WriteMode::HeaderOnly))?;

        let read = track!(Block::read_from(&mut nvm, offset, wilderness))?;
        assert_eq!(read.block, relinked);
        assert_eq!(
            &nvm.as_bytes()[offset.as_u64() as usize + 20..][..40],
            &payload_before[..]
        );
        assert_eq!(track!(Block::read_footer(&mut nvm, &relinked))?, relinked.tag());
        Ok(())
    }

    #[test]
    fn out_of_range_offsets_are_rejected() -> TestResult {
        let mut nvm = nvm_with_block_area(48);
        let wilderness = nvm.size();
        track!(Block::allocated(BlockOffset::FIRST, 48).write_to(&mut nvm, WriteMode::Full))?;

        let e = Block::read_from(&mut nvm, BlockOffset::new(8), wilderness).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InvalidInput));

        let e = Block::read_from(&mut nvm, BlockOffset::FIRST.forward(4), wilderness).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InvalidInput));

        let e = Block::read_from(&mut nvm, BlockOffset::FIRST.forward(48), wilderness).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InvalidInput));
        Ok(())
    }

    #[test]
    fn broken_header_is_detected() -> TestResult {
        let mut nvm = nvm_with_block_area(48);
        let wilderness = nvm.size();

        // 長さが最小長未満
        track!(Block::allocated(BlockOffset::FIRST, 16).write_to(&mut nvm, WriteMode::HeaderOnly))?;
        let e = Block::read_from(&mut nvm, BlockOffset::FIRST, wilderness).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::StorageCorrupted));

        // wilderness境界を超えている
        track!(Block::allocated(BlockOffset::FIRST, 56).write_to(&mut nvm, WriteMode::HeaderOnly))?;
        let e = Block::read_from(&mut nvm, BlockOffset::FIRST, wilderness).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::StorageCorrupted));
        Ok(())
    }
}
