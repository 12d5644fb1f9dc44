use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};

use super::block::BLOCK_ALIGNMENT;
use super::class_hints::ClassHints;
use super::pool_table::{PoolTable, POOL_TABLE_SIZE};
use super::{Heap, DEFAULT_SCAN_LIMIT};
use crate::metrics::HeapMetrics;
use crate::nvm::NonVolatileMemory;
use crate::{ErrorKind, Result};

/// `Heap`のビルダ.
#[derive(Debug, Clone)]
pub struct HeapBuilder {
    scan_limit: usize,
    zero_fill: bool,
    logger: Logger,
    metrics: MetricBuilder,
}
impl HeapBuilder {
    /// 新しい`HeapBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        HeapBuilder {
            scan_limit: DEFAULT_SCAN_LIMIT,
            zero_fill: false,
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// 一回の割当で探索するサイズクラス数の上限を設定する.
    ///
    /// 探索を開始したクラスから、この数のクラスを調べても適切な空きブロックが見つからなかった場合には、
    /// ファイル末尾を伸長して割当が行われる.
    ///
    /// `1`未満の値が指定された場合には、ヒープの構築時にエラーが返される.
    ///
    /// デフォルト値は`75`.
    pub fn scan_limit(&mut self, limit: usize) -> &mut Self {
        self.scan_limit = limit;
        self
    }

    /// 空きブロックを再利用して割当を行う際に、ペイロードをゼロで埋めるかどうかを設定する.
    ///
    /// ファイル末尾を伸長して割り当てたブロックは、この設定に関わらず常にゼロで埋められている.
    ///
    /// デフォルト値は`false`.
    pub fn zero_fill(&mut self, enabled: bool) -> &mut Self {
        self.zero_fill = enabled;
        self
    }

    /// ヒープ用の logger を登録する.
    ///
    /// デフォルトでは、ログは全て破棄される.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    ///
    /// デフォルト値は`MetricBuilder::new()`.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// 新規にヒープを生成する.
    ///
    /// `nvm`の既存の内容は全て破棄され、空のプールテーブルが書き込まれる.
    pub fn create<N>(&self, mut nvm: N) -> Result<Heap<N>>
    where
        N: NonVolatileMemory,
    {
        track!(self.validate())?;
        track!(nvm.truncate(0))?;

        let mut buf = Vec::with_capacity(POOL_TABLE_SIZE as usize);
        track!(PoolTable::new().write_to(&mut buf))?;
        track!(nvm.write_all_at(0, &buf))?;
        track!(nvm.sync())?;

        track!(self.open(nvm))
    }

    /// 既に存在するヒープをオープンする.
    ///
    /// プールテーブルを読み込み、現在のサイズをwilderness境界とする.
    /// 探索用のヒントは全て空の状態から始まる.
    pub fn open<N>(&self, mut nvm: N) -> Result<Heap<N>>
    where
        N: NonVolatileMemory,
    {
        track!(self.validate())?;

        let wilderness = nvm.size();
        track_assert!(
            wilderness >= POOL_TABLE_SIZE,
            ErrorKind::StorageCorrupted,
            "Too small heap file: {} bytes",
            wilderness
        );
        track_assert_eq!(
            (wilderness - POOL_TABLE_SIZE) % BLOCK_ALIGNMENT,
            0,
            ErrorKind::StorageCorrupted,
            "Unaligned wilderness boundary: {}",
            wilderness
        );

        let mut buf = vec![0; POOL_TABLE_SIZE as usize];
        track!(nvm.read_exact_at(0, &mut buf))?;
        let pools = track!(PoolTable::read_from(&buf[..]))?;

        let metrics = HeapMetrics::new(&self.metrics);
        metrics.wilderness_bytes.set(wilderness as f64);

        info!(
            self.logger,
            "Heap opened";
            "wilderness" => wilderness,
            "non_empty_classes" => pools.non_empty_classes().count()
        );
        Ok(Heap {
            nvm,
            pools,
            hints: ClassHints::new(),
            wilderness,
            scan_limit: self.scan_limit,
            zero_fill: self.zero_fill,
            metrics,
            logger: self.logger.clone(),
        })
    }

    fn validate(&self) -> Result<()> {
        track_assert!(
            self.scan_limit > 0,
            ErrorKind::InvalidInput,
            "Invalid scan limit: {}",
            self.scan_limit
        );
        Ok(())
    }
}
impl Default for HeapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::nvm::MemoryNvm;

    #[test]
    fn invalid_scan_limit_is_rejected() -> TestResult {
        let e = HeapBuilder::new()
            .scan_limit(0)
            .create(MemoryNvm::default())
            .err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InvalidInput));

        let heap = track!(HeapBuilder::new().scan_limit(1).create(MemoryNvm::default()))?;
        assert_eq!(heap.scan_limit, 1);
        Ok(())
    }

    #[test]
    fn metrics_reflect_wilderness() -> TestResult {
        let mut heap = track!(HeapBuilder::new().create(MemoryNvm::default()))?;
        assert_eq!(heap.metrics().wilderness_bytes(), POOL_TABLE_SIZE);

        track!(heap.allocate(100))?;
        assert_eq!(heap.metrics().wilderness_bytes(), POOL_TABLE_SIZE + 112);
        assert_eq!(heap.metrics().wilderness_extended_bytes(), 112);
        Ok(())
    }
}
