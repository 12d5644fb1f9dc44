//! 不揮発性メモリのインターフェース定義と実装群.
//!
//! このモジュールは[Heap](../heap/struct.Heap.html)がブロックの読み書きに使用する
//! 永続化領域を提供する.
use std::io::{Read, Seek, SeekFrom, Write};

pub use self::file::{FileNvm, FileNvmBuilder};
pub use self::memory::MemoryNvm;

use crate::{ErrorKind, Result};

mod file;
mod memory;

/// 不揮発性メモリを表すトレイト.
///
/// "不揮発性メモリ"は「永続化可能かつ伸長可能なバイト列(領域)」を意味し、ヒープファイルを保存するために使用される.
///
/// 末尾(`size()`の位置)への書き込みは領域の伸長として扱われる.
/// ただし末尾を超えた位置へのシーク(i.e., 穴の空いた書き込み)は許容されない.
pub trait NonVolatileMemory: Sized + Read + Write + Seek {
    /// メモリの内容を、物理デバイスに同期する.
    ///
    /// 内部的にバッファ管理等を行っておらず、常に内容が同期されている場合には、
    /// このメソッド内で特に何かを行う必要はない。
    fn sync(&mut self) -> Result<()>;

    /// 読み書き用カーソルの現在位置を返す.
    fn position(&self) -> u64;

    /// 現在のメモリのサイズ(バイト単位)を返す.
    fn size(&self) -> u64;

    /// メモリのサイズを`size`に切り詰める.
    ///
    /// カーソル位置は`0`に戻される.
    ///
    /// # Errors
    ///
    /// `size`が現在のサイズを超えている場合には、種類が`ErrorKind::InvalidInput`のエラーが返される.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// `SeekFrom`形式で指定された位置を、開始地点からのオフセットに変換する.
    ///
    /// # Errors
    ///
    /// 「指定位置が現在のサイズを超えている」ないし「`0`未満」の場合には、
    /// 種類が`ErrorKind::InvalidInput`のエラーが返される.
    fn convert_to_offset(&self, pos: SeekFrom) -> Result<u64> {
        let offset = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => self.size() as i64 + delta,
            SeekFrom::Current(delta) => self.position() as i64 + delta,
        };
        track_assert!(0 <= offset, ErrorKind::InvalidInput; offset);
        track_assert!(
            offset as u64 <= self.size(),
            ErrorKind::InvalidInput;
            offset,
            self.size()
        );
        Ok(offset as u64)
    }

    /// `offset`の位置から`buf`を埋めるだけのバイト列を読み込む.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        track_io!(self.seek(SeekFrom::Start(offset)))?;
        track_io!(self.read_exact(buf))?;
        Ok(())
    }

    /// `offset`の位置に`buf`の内容を全て書き込む.
    ///
    /// `offset + buf.len()`が現在のサイズを超える場合には、メモリが伸長される.
    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        track_io!(self.seek(SeekFrom::Start(offset)))?;
        track_io!(self.write_all(buf))?;
        Ok(())
    }
}
