//! Size Class.

/// サイズクラスの総数.
pub const NUM_SIZE_CLASSES: usize = 155;

/// 幅が8バイト固定のクラスの数.
const LINEAR_CLASSES: usize = 126;

/// 幅が8バイト固定のクラスが扱うブロック長の上限.
const LINEAR_LIMIT: u64 = 1024;

/// 先頭のクラスの下限(このクラスには、これを超える長さのブロックが属する).
const FIRST_LOWER_BOUND: u64 = 16;

/// ブロック長に基づく分類(サイズクラス).
///
/// クラス`i`には長さが`(lower_bound(i), upper_bound(i)]`の範囲に収まるブロックが属する.
///
/// - `0..=125`: 幅は8バイト固定 (`(16, 24]`, `(24, 32]`, ..., `(1016, 1024]`)
/// - `126..=154`: 幅がクラス毎に倍になる (`(1024, 1032]`, `(1032, 1048]`, `(1048, 1080]`, ...)
///
/// 末尾のクラスの上限は`2^32`を超えているので、32bitで表現可能な全ての長さが、いずれかのクラスに属する.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);
impl SizeClass {
    /// 最小のクラス.
    pub const MIN: SizeClass = SizeClass(0);

    /// 最大のクラス.
    pub const MAX: SizeClass = SizeClass((NUM_SIZE_CLASSES - 1) as u8);

    /// インデックスに対応するクラスを返す.
    ///
    /// `index`が範囲外の場合には`None`が返される.
    pub fn new(index: usize) -> Option<Self> {
        if index < NUM_SIZE_CLASSES {
            Some(SizeClass(index as u8))
        } else {
            None
        }
    }

    /// 長さが`len`のブロックが属するクラスを返す.
    ///
    /// `len`以上の長さを上限に持つクラスのうち、最小のものが選ばれる.
    /// 1024を超える長さの場合には、クラス境界を倍々に辿るので`O(log len)`となる.
    pub fn of(len: u64) -> Self {
        if len <= LINEAR_LIMIT {
            return SizeClass((len.saturating_sub(FIRST_LOWER_BOUND + 1) / 8) as u8);
        }
        let mut index = LINEAR_CLASSES;
        while index < NUM_SIZE_CLASSES - 1 && Self::upper_bound_of(index) < len {
            index += 1;
        }
        SizeClass(index as u8)
    }

    /// クラスのインデックスを返す.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// このクラスに属するブロックの長さの下限(この値自体は含まない).
    pub fn lower_bound(self) -> u64 {
        if self.0 == 0 {
            FIRST_LOWER_BOUND
        } else {
            Self::upper_bound_of(self.index() - 1)
        }
    }

    /// このクラスに属するブロックの長さの上限(この値自体も含む).
    pub fn upper_bound(self) -> u64 {
        Self::upper_bound_of(self.index())
    }

    /// 長さが`len`のブロックが、このクラスに属するかどうかを判定する.
    pub fn contains(self, len: u64) -> bool {
        self.lower_bound() < len && len <= self.upper_bound()
    }

    /// 次のクラスを返す.
    pub fn next(self) -> Option<Self> {
        Self::new(self.index() + 1)
    }

    /// 全てのクラスを昇順に走査するイテレータを返す.
    pub fn all() -> impl Iterator<Item = SizeClass> {
        (0..NUM_SIZE_CLASSES).map(|i| SizeClass(i as u8))
    }

    fn upper_bound_of(index: usize) -> u64 {
        if index < LINEAR_CLASSES {
            FIRST_LOWER_BOUND + 8 * (index as u64 + 1)
        } else {
            let steps = (index - (LINEAR_CLASSES - 1)) as u32;
            LINEAR_LIMIT + 8 * ((1u64 << steps) - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_classes_work() {
        assert_eq!(SizeClass::of(0).index(), 0);
        assert_eq!(SizeClass::of(16).index(), 0);
        assert_eq!(SizeClass::of(24).index(), 0);
        assert_eq!(SizeClass::of(25).index(), 1);
        assert_eq!(SizeClass::of(32).index(), 1);
        assert_eq!(SizeClass::of(112).index(), 11);
        assert_eq!(SizeClass::of(1016).index(), 124);
        assert_eq!(SizeClass::of(1024).index(), 125);

        let c = SizeClass::of(1024);
        assert_eq!(c.lower_bound(), 1016);
        assert_eq!(c.upper_bound(), 1024);
    }

    #[test]
    fn geometric_classes_work() {
        assert_eq!(SizeClass::of(1025).index(), 126);
        assert_eq!(SizeClass::of(1032).index(), 126);
        assert_eq!(SizeClass::of(1040).index(), 127);
        assert_eq!(SizeClass::of(1048).index(), 127);
        assert_eq!(SizeClass::of(1056).index(), 128);

        let c = SizeClass::new(128).unwrap();
        assert_eq!(c.lower_bound(), 1048);
        assert_eq!(c.upper_bound(), 1080);

        assert_eq!(SizeClass::of(u64::from(u32::max_value())), SizeClass::MAX);
        assert!(SizeClass::MAX.lower_bound() < u64::from(u32::max_value()));
        assert!(SizeClass::MAX.upper_bound() > u64::from(u32::max_value()));
        assert_eq!(SizeClass::of(u64::max_value()), SizeClass::MAX);
    }

    #[test]
    fn classes_tile_the_length_space() {
        let mut prev_upper = 16;
        for class in SizeClass::all() {
            assert_eq!(class.lower_bound(), prev_upper);
            assert!(class.lower_bound() < class.upper_bound());
            prev_upper = class.upper_bound();
        }
        assert_eq!(SizeClass::all().count(), NUM_SIZE_CLASSES);
        assert_eq!(SizeClass::MAX.next(), None);
        assert_eq!(SizeClass::MIN.next(), SizeClass::new(1));
        assert_eq!(SizeClass::new(NUM_SIZE_CLASSES), None);
    }

    #[test]
    fn of_is_monotonic_and_consistent_with_bounds() {
        let mut prev = SizeClass::MIN;
        let mut len = 24;
        while len < 1 << 33 {
            let class = SizeClass::of(len);
            assert!(prev <= class, "len={}", len);
            if class != SizeClass::MAX || len <= class.upper_bound() {
                assert!(class.contains(len), "len={}, class={:?}", len, class);
            }
            prev = class;
            len += 8 + len / 7;
        }
    }
}
