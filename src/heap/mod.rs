//! ディスク上のヒープ.
//!
//! このモジュール自体は、具体的なI/O処理(e.g., ファイル処理)とは切り離されており、
//! [NonVolatileMemory]実装を永続化層として利用する.
//!
//! # ファイル形式
//!
//! ```text
//! [0, 1240)          : プールテーブル (155個の64bit整数、各サイズクラスのフリーリングの先頭位置)
//! [1240, wilderness) : ブロック列 (隙間なく敷き詰められている)
//! ```
//!
//! 各ブロックの形式については[Block]を参照のこと.
//!
//! [NonVolatileMemory]: ../nvm/trait.NonVolatileMemory.html
//! [Block]: ./struct.Block.html
use slog::Logger;

pub use self::block::{
    Block, BlockOffset, BlockState, BoundaryTag, BLOCK_ALIGNMENT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
pub use self::builder::HeapBuilder;
pub use self::check::HeapSummary;
pub use self::pool_table::POOL_TABLE_SIZE;
pub use self::size_class::{SizeClass, NUM_SIZE_CLASSES};

use self::block::{ReadBlock, WriteMode, ALLOCATION_OVERHEAD};
use self::class_hints::ClassHints;
use self::pool_table::PoolTable;
use crate::metrics::HeapMetrics;
use crate::nvm::NonVolatileMemory;
use crate::{ErrorKind, Result};

mod allocator;
mod block;
mod builder;
mod check;
mod class_hints;
mod coalescer;
mod free_ring;
mod pool_table;
mod size_class;

/// 一回の割当で探索するサイズクラス数の上限のデフォルト値.
pub const DEFAULT_SCAN_LIMIT: usize = 75;

/// 割当結果.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    /// ペイロードの開始位置.
    ///
    /// 解放時には、この値を`Heap::release`に渡す.
    pub offset: u64,

    /// 利用者が使用可能なペイロードのバイト数.
    ///
    /// 要求したサイズ以上となる.
    pub len: u64,
}
impl Allocation {
    fn new(block: &Block) -> Self {
        Allocation {
            offset: block.offset.payload(),
            len: block.payload_len(),
        }
    }
}

/// ディスク上の動的メモリアロケータ.
///
/// 一つのファイル(`NonVolatileMemory`)をヒープとみなして、可変長のブロックの割当・解放を行う.
///
/// 空きブロックはサイズクラス毎の循環双方向リスト(フリーリング)で管理され、
/// その情報は全てファイル内に格納されている.
/// そのため、インスタンスを破棄して再度`open`すれば、前回の状態から割当を継続できる.
///
/// # 注意
///
/// - 排他制御は行わないので、同じファイルに対する書き込みは、このインスタンス経由のみに限定する必要がある
/// - 書き込みの途中でクラッシュした場合のファイルの整合性は保証されない
#[derive(Debug)]
pub struct Heap<N>
where
    N: NonVolatileMemory,
{
    nvm: N,
    pools: PoolTable,
    hints: ClassHints,
    wilderness: u64,
    scan_limit: usize,
    zero_fill: bool,
    metrics: HeapMetrics,
    logger: Logger,
}
impl<N> Heap<N>
where
    N: NonVolatileMemory,
{
    /// デフォルト設定で、新規にヒープを生成する.
    ///
    /// `nvm`の既存の内容は全て破棄される.
    pub fn create(nvm: N) -> Result<Self> {
        track!(HeapBuilder::new().create(nvm))
    }

    /// デフォルト設定で、既に存在するヒープをオープンする.
    pub fn open(nvm: N) -> Result<Self> {
        track!(HeapBuilder::new().open(nvm))
    }

    /// `len`バイトのペイロードを格納可能なブロックを割り当てる.
    ///
    /// 十分な長さの空きブロックが見つからない場合には、ファイル末尾を伸長して割当を行う.
    /// そのため(I/Oエラーを除けば)失敗することはない.
    ///
    /// # Errors
    ///
    /// ブロック長が32bitの範囲を超えてしまう場合には`ErrorKind::InvalidInput`が返される.
    pub fn allocate(&mut self, len: u64) -> Result<Allocation> {
        let block_len = track!(allocation_block_len(len))?;
        let block = track!(self.allocate_block(block_len))?;
        self.metrics.count_allocation(block.len);
        Ok(Allocation::new(&block))
    }

    /// `offset`が指すブロックを解放する.
    ///
    /// `offset`には`allocate`が返したペイロード位置を指定する.
    /// 解放されたブロックは、前後の空きブロックと併合された上でフリーリングに追加される.
    ///
    /// # Errors
    ///
    /// `offset`が割当済みブロックを指していないことが(安価に)判明した場合には`ErrorKind::InvalidInput`が返される.
    /// ただし、全ての誤用が検出されるわけではない.
    pub fn release(&mut self, offset: u64) -> Result<()> {
        let block_offset = track_assert_some!(
            BlockOffset::from_payload(offset),
            ErrorKind::InvalidInput,
            "offset={}",
            offset
        );
        let len = track!(self.release_block(block_offset))?;
        self.metrics.count_releasion(len);
        Ok(())
    }

    /// `offset`が指す割当済みブロックの、ペイロードのバイト数を返す.
    pub fn payload_len(&mut self, offset: u64) -> Result<u64> {
        let block = track!(self.read_allocated_block(offset))?;
        Ok(block.payload_len())
    }

    /// `offset`が指す割当済みブロックのペイロードの先頭に`data`を書き込む.
    ///
    /// # Errors
    ///
    /// `data`がペイロードに収まらない場合には`ErrorKind::InvalidInput`が返される.
    pub fn write_payload(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let block = track!(self.read_allocated_block(offset))?;
        track_assert!(
            data.len() as u64 <= block.payload_len(),
            ErrorKind::InvalidInput;
            offset,
            data.len(),
            block.payload_len()
        );
        track!(self.nvm.write_all_at(offset, data))
    }

    /// `offset`が指す割当済みブロックのペイロードの先頭から`buf`を埋めるだけのバイト列を読み込む.
    ///
    /// # Errors
    ///
    /// `buf`がペイロードよりも長い場合には`ErrorKind::InvalidInput`が返される.
    pub fn read_payload(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let block = track!(self.read_allocated_block(offset))?;
        track_assert!(
            buf.len() as u64 <= block.payload_len(),
            ErrorKind::InvalidInput;
            offset,
            buf.len(),
            block.payload_len()
        );
        track!(self.nvm.read_exact_at(offset, buf))
    }

    /// ヒープの内容を物理デバイスに同期する.
    pub fn sync(&mut self) -> Result<()> {
        track!(self.nvm.sync())
    }

    /// 現在のwilderness境界(i.e., ブロック領域の末尾)の位置を返す.
    pub fn wilderness(&self) -> u64 {
        self.wilderness
    }

    /// ヒープのメトリクスを返す.
    pub fn metrics(&self) -> &HeapMetrics {
        &self.metrics
    }

    /// ヒープが使用している`NonVolatileMemory`への参照を返す.
    pub fn nvm(&self) -> &N {
        &self.nvm
    }

    /// インスタンスを破棄して、使用していた`NonVolatileMemory`を返す.
    ///
    /// メモリ上の探索ヒントは全て破棄される.
    /// `NonVolatileMemory`も合わせて閉じたい場合には、単にインスタンスをドロップすれば良い.
    pub fn into_nvm(self) -> N {
        self.nvm
    }

    fn read_block(&mut self, offset: BlockOffset) -> Result<ReadBlock> {
        track!(Block::read_from(&mut self.nvm, offset, self.wilderness))
    }

    fn write_block(&mut self, block: &Block, mode: WriteMode) -> Result<()> {
        track!(block.write_to(&mut self.nvm, mode))
    }

    fn read_allocated_block(&mut self, offset: u64) -> Result<Block> {
        let block_offset = track_assert_some!(
            BlockOffset::from_payload(offset),
            ErrorKind::InvalidInput,
            "offset={}",
            offset
        );
        let block = track!(self.read_block(block_offset))?.block;
        track_assert!(
            !block.is_free(),
            ErrorKind::InvalidInput,
            "Not an allocated block: offset={}",
            offset
        );
        Ok(block)
    }
}

/// 要求サイズ`len`に対応するブロック長を計算する.
///
/// ヘッダとフッタの分を加えて8バイト境界に切り上げたもの(ただし最小長は`MIN_BLOCK_SIZE`).
fn allocation_block_len(len: u64) -> Result<u32> {
    let block_len = len
        .checked_add(ALLOCATION_OVERHEAD + BLOCK_ALIGNMENT - 1)
        .map(|n| n / BLOCK_ALIGNMENT * BLOCK_ALIGNMENT);
    let block_len = track_assert_some!(
        block_len.filter(|&n| n <= u64::from(MAX_BLOCK_SIZE)),
        ErrorKind::InvalidInput,
        "Too large allocation request: {}",
        len
    );
    Ok(std::cmp::max(block_len as u32, MIN_BLOCK_SIZE))
}
