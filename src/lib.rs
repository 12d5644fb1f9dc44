//! Disk-resident Heap.
//!
//! `dheap`は、ひとつの(伸長可能な)ファイルをヒープ領域とみなし、
//! 可変長のバイト列(ブロック)の割当と解放を行うアロケータ.
//!
//! # 特徴
//!
//! - 小さな可変長レコードを大量に格納するデータベース向けのディスク上のアロケータ
//! - 割当戦略は"segregated-fit": 155個のサイズクラス毎に空きブロックの循環リスト(フリーリング)を持つ
//! - 空きブロックの管理情報(各リングの先頭位置、リングのリンク)は全てファイル内に永続化される
//!   - プロセスを再起動しても、ファイルを開き直すだけで前回の状態から割当を継続できる
//! - 各ブロックは先頭と末尾に同じ境界タグ(長さ+空きフラグ)を持ち、解放時には前後の空きブロックと併合される
//! - ファイル全体の再配置・デフラグは行わない
//!   - 十分な空きブロックが存在しない場合には、ファイル末尾(wilderness)を伸長して割当を行う
//!   - ファイルが縮小されることはない
//! - 排他制御やトランザクション(クラッシュ時の原子性)は提供しない
//!
//! # モジュールの依存関係
//!
//! ```text
//! heap => nvm
//! ```
//!
//! - [heap]モジュール:
//!   - 主に[Heap]構造体を提供
//!   - `dheap`の利用者が直接触るのはこの構造体
//!   - [nvm]を永続化層として利用し、その上にブロック形式とフリーリングを実装している
//! - [nvm]モジュール:
//!   - 主に[NonVolatileMemory]トレイトとその実装である[FileNvm]を提供
//!   - [heap]に対して永続化層を提供するのが目的
//!
//! [heap]: ./heap/index.html
//! [Heap]: ./heap/struct.Heap.html
//! [nvm]: ./nvm/index.html
//! [NonVolatileMemory]: ./nvm/trait.NonVolatileMemory.html
//! [FileNvm]: ./nvm/struct.FileNvm.html
#![warn(missing_docs)]
extern crate byteorder;
extern crate libc;
extern crate prometrics;
#[cfg(test)]
extern crate tempdir;
#[macro_use]
extern crate trackable;
#[macro_use]
extern crate slog;

pub use crate::error::{Error, ErrorKind};

macro_rules! track_io {
    ($expr:expr) => {
        $expr.map_err(|e: ::std::io::Error| track!(crate::Error::from(e)))
    };
}

pub mod heap;
pub mod metrics;
pub mod nvm;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
