//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, Gauge, MetricBuilder};

/// [`Heap`]のメトリクス.
///
/// [`Heap`]: ../heap/struct.Heap.html
#[derive(Debug, Clone)]
pub struct HeapMetrics {
    pub(crate) allocated_blocks: Counter,
    pub(crate) allocated_bytes: Counter,
    pub(crate) released_blocks: Counter,
    pub(crate) released_bytes: Counter,
    pub(crate) split_blocks: Counter,
    pub(crate) merged_blocks: Counter,
    pub(crate) linked_blocks: Counter,
    pub(crate) unlinked_blocks: Counter,
    pub(crate) scanned_blocks: Counter,
    pub(crate) skip_cache_hits: Counter,
    pub(crate) wilderness_extensions: Counter,
    pub(crate) wilderness_extended_bytes: Counter,
    pub(crate) wilderness_bytes: Gauge,
}
impl HeapMetrics {
    /// ブロックの割当回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_allocated_blocks_total <COUNTER>
    /// ```
    pub fn allocated_blocks(&self) -> u64 {
        self.allocated_blocks.value() as u64
    }

    /// これまでに割り当てたブロックのバイト数(ヘッダとフッタを含む).
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_allocated_bytes_total <COUNTER>
    /// ```
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.value() as u64
    }

    /// ブロックの解放回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_released_blocks_total <COUNTER>
    /// ```
    pub fn released_blocks(&self) -> u64 {
        self.released_blocks.value() as u64
    }

    /// これまでに解放されたブロックのバイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_released_bytes_total <COUNTER>
    /// ```
    pub fn released_bytes(&self) -> u64 {
        self.released_bytes.value() as u64
    }

    /// 割当時に空きブロックが分割された回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_split_blocks_total <COUNTER>
    /// ```
    pub fn split_blocks(&self) -> u64 {
        self.split_blocks.value() as u64
    }

    /// 解放時に隣接する空きブロックと併合された回数.
    ///
    /// 前後の両方と併合された場合には`2`が加算される.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_merged_blocks_total <COUNTER>
    /// ```
    pub fn merged_blocks(&self) -> u64 {
        self.merged_blocks.value() as u64
    }

    /// フリーリングに含まれる空きブロックの数.
    ///
    /// 再オープン後は、その時点以降の増減分のみが反映される.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_linked_blocks_total - dheap_heap_unlinked_blocks_total
    /// ```
    pub fn free_ring_delta(&self) -> i64 {
        // NOTE: 以下の順番で値を取得しないと負の値が一時的に観測される可能性がある
        let dec = self.unlinked_blocks.value() as i64;
        let inc = self.linked_blocks.value() as i64;
        inc - dec
    }

    /// 割当時の探索で読み込まれたフリーリングの要素数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_scanned_blocks_total <COUNTER>
    /// ```
    pub fn scanned_blocks(&self) -> u64 {
        self.scanned_blocks.value() as u64
    }

    /// スキップキャッシュを使って探索開始クラスを飛ばした回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_skip_cache_hits_total <COUNTER>
    /// ```
    pub fn skip_cache_hits(&self) -> u64 {
        self.skip_cache_hits.value() as u64
    }

    /// ファイル末尾(wilderness)を伸長して割当を行った回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_wilderness_extensions_total <COUNTER>
    /// ```
    pub fn wilderness_extensions(&self) -> u64 {
        self.wilderness_extensions.value() as u64
    }

    /// ファイル末尾の伸長によって増えたバイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_wilderness_extended_bytes_total <COUNTER>
    /// ```
    pub fn wilderness_extended_bytes(&self) -> u64 {
        self.wilderness_extended_bytes.value() as u64
    }

    /// 現在のファイル末尾(wilderness境界)の位置.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dheap_heap_wilderness_bytes <GAUGE>
    /// ```
    pub fn wilderness_bytes(&self) -> u64 {
        self.wilderness_bytes.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("dheap").subsystem("heap");
        HeapMetrics {
            allocated_blocks: builder
                .counter("allocated_blocks_total")
                .help("Number of allocated blocks")
                .finish()
                .expect("Never fails"),
            allocated_bytes: builder
                .counter("allocated_bytes_total")
                .help("Number of allocated bytes")
                .finish()
                .expect("Never fails"),
            released_blocks: builder
                .counter("released_blocks_total")
                .help("Number of released blocks")
                .finish()
                .expect("Never fails"),
            released_bytes: builder
                .counter("released_bytes_total")
                .help("Number of released bytes")
                .finish()
                .expect("Never fails"),
            split_blocks: builder
                .counter("split_blocks_total")
                .help("Number of free blocks split by allocation")
                .finish()
                .expect("Never fails"),
            merged_blocks: builder
                .counter("merged_blocks_total")
                .help("Number of neighbour blocks merged by release")
                .finish()
                .expect("Never fails"),
            linked_blocks: builder
                .counter("linked_blocks_total")
                .help("Number of blocks linked into free rings")
                .finish()
                .expect("Never fails"),
            unlinked_blocks: builder
                .counter("unlinked_blocks_total")
                .help("Number of blocks unlinked from free rings")
                .finish()
                .expect("Never fails"),
            scanned_blocks: builder
                .counter("scanned_blocks_total")
                .help("Number of free ring members visited by allocation")
                .finish()
                .expect("Never fails"),
            skip_cache_hits: builder
                .counter("skip_cache_hits_total")
                .help("Number of allocations resumed from the skip cache")
                .finish()
                .expect("Never fails"),
            wilderness_extensions: builder
                .counter("wilderness_extensions_total")
                .help("Number of allocations served by growing the file")
                .finish()
                .expect("Never fails"),
            wilderness_extended_bytes: builder
                .counter("wilderness_extended_bytes_total")
                .help("Number of bytes appended to the file")
                .finish()
                .expect("Never fails"),
            wilderness_bytes: builder
                .gauge("wilderness_bytes")
                .help("Current position of the wilderness boundary")
                .finish()
                .expect("Never fails"),
        }
    }

    pub(crate) fn count_allocation(&self, block_len: u32) {
        self.allocated_blocks.increment();
        self.allocated_bytes.add_u64(u64::from(block_len));
    }

    pub(crate) fn count_releasion(&self, block_len: u32) {
        self.released_blocks.increment();
        self.released_bytes.add_u64(u64::from(block_len));
    }

    pub(crate) fn count_extension(&self, block_len: u32, wilderness: u64) {
        self.wilderness_extensions.increment();
        self.wilderness_extended_bytes.add_u64(u64::from(block_len));
        self.wilderness_bytes.set(wilderness as f64);
    }
}
