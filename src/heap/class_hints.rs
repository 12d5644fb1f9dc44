//! サイズクラス毎の探索ヒント.
//!
//! ここで保持される情報は全てメモリ上のみのもので、永続化はされない.
//! 破棄されても余分な探索が発生するだけで、割当結果の正しさには影響しない.
use std::cmp;

use super::size_class::{SizeClass, NUM_SIZE_CLASSES};

#[derive(Debug, Clone, Default)]
struct ClassHint {
    // このクラスに属する空きブロックの長さの上限(`None`なら不明).
    watermark: Option<u32>,
    skip: Option<Skip>,
}

#[derive(Debug, Clone, Copy)]
struct Skip {
    resume: usize,
    epoch: u64,
}

/// 各クラスのウォーターマーク(既知の最大空きブロック長)とスキップキャッシュ.
///
/// スキップキャッシュは「このクラスが空の場合には、どのクラスから探索を再開すれば良いか」を保持する.
/// キャッシュは、いずれかのクラスが空から非空に遷移する度に進むエポックで無効化される.
#[derive(Debug, Clone)]
pub(crate) struct ClassHints {
    hints: Vec<ClassHint>,
    epoch: u64,
}
impl ClassHints {
    pub fn new() -> Self {
        ClassHints {
            hints: vec![ClassHint::default(); NUM_SIZE_CLASSES],
            epoch: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 新たにリングが作られた際に呼び出される.
    pub fn bump_epoch(&mut self) {
        self.epoch += 1;
    }

    /// `class`に長さ`len`以上の空きブロックが存在する可能性があるかどうか.
    pub fn may_contain(&self, class: SizeClass, len: u64) -> bool {
        self.hints[class.index()]
            .watermark
            .map_or(true, |w| len <= u64::from(w))
    }

    /// 空きブロックがリングに追加された際に、ウォーターマークを更新する.
    ///
    /// ウォーターマークが不明な場合には、不明のままとなる.
    pub fn raise_watermark(&mut self, class: SizeClass, len: u32) {
        if let Some(w) = self.hints[class.index()].watermark.as_mut() {
            *w = cmp::max(*w, len);
        }
    }

    /// リングを一周した結果、判明した最大長をウォーターマークとして設定する.
    pub fn set_watermark(&mut self, class: SizeClass, len: u32) {
        self.hints[class.index()].watermark = Some(len);
    }

    /// 有効なスキップキャッシュが存在すれば、探索を再開すべきクラスのインデックスを返す.
    ///
    /// 返り値が`NUM_SIZE_CLASSES`の場合は「どのクラスにも候補はない」を意味する.
    pub fn skip(&self, class: SizeClass) -> Option<usize> {
        self.hints[class.index()]
            .skip
            .filter(|s| s.epoch == self.epoch)
            .map(|s| s.resume)
    }

    pub fn set_skip(&mut self, class: SizeClass, resume: usize) {
        debug_assert!(resume <= NUM_SIZE_CLASSES);
        self.hints[class.index()].skip = Some(Skip {
            resume,
            epoch: self.epoch,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_works() {
        let mut hints = ClassHints::new();
        let class = SizeClass::of(112);

        // 不明な間は常に候補となる
        assert!(hints.may_contain(class, 112));
        hints.raise_watermark(class, 104);
        assert!(hints.may_contain(class, 112));

        hints.set_watermark(class, 104);
        assert!(!hints.may_contain(class, 112));
        assert!(hints.may_contain(class, 104));

        hints.raise_watermark(class, 112);
        assert!(hints.may_contain(class, 112));
        hints.raise_watermark(class, 106);
        assert!(hints.may_contain(class, 112));
    }

    #[test]
    fn skip_cache_is_invalidated_by_epoch() {
        let mut hints = ClassHints::new();
        let class = SizeClass::of(24);
        assert_eq!(hints.skip(class), None);

        hints.set_skip(class, 40);
        assert_eq!(hints.skip(class), Some(40));
        assert_eq!(hints.epoch(), 0);

        hints.bump_epoch();
        assert_eq!(hints.skip(class), None);

        hints.set_skip(class, NUM_SIZE_CLASSES);
        assert_eq!(hints.skip(class), Some(NUM_SIZE_CLASSES));
    }
}
