use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::nvm::NonVolatileMemory;
use crate::{ErrorKind, Result};

/// `FileNvm`のビルダ
///
/// exclusive_lock: `FileNvm`の実体ファイルに対するアクセスの排他制御を行うかどうか
///
/// ヒープ自体は排他制御を行わないので、複数プロセスからの同時書き込みを防ぎたい場合にはこれを有効にする.
pub struct FileNvmBuilder {
    exclusive_lock: bool,
}

impl FileNvmBuilder {
    /// デフォルト設定で`FileNvmBuilder`インスタンスを作成する
    ///
    /// デフォルトでは、exclusive_lock = trueとなる
    pub fn new() -> Self {
        FileNvmBuilder {
            exclusive_lock: true,
        }
    }

    fn open_options(&self) -> fs::OpenOptions {
        let mut options = fs::OpenOptions::new();
        options.read(true).write(true).create(false);
        options
    }

    #[cfg(unix)]
    fn set_exclusive_file_lock_if_flag_is_on(&self, file: &File) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        if self.exclusive_lock {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
                track_io!(Err(io::Error::last_os_error()))
            } else {
                Ok(())
            }
        } else {
            Ok(())
        }
    }
    #[cfg(not(unix))]
    fn set_exclusive_file_lock_if_flag_is_on(&self, _file: &File) -> Result<()> {
        Ok(())
    }

    /// exclusive_lockのon/offを設定する
    pub fn exclusive_lock(&mut self, enabled: bool) -> &mut Self {
        self.exclusive_lock = enabled;
        self
    }

    /// 新しい`FileNvm`インスタンスを生成する.
    ///
    /// `filepath`が既に存在する場合にはそれを開き、存在しない場合には新規にファイルを作成する.
    ///
    /// 返り値のタプルの二番目の値は、ファイルが新規作成されたかどうか (`true`なら新規作成).
    pub fn create_if_absent<P: AsRef<Path>>(&mut self, filepath: P) -> Result<(FileNvm, bool)> {
        if filepath.as_ref().exists() {
            track!(self.open(filepath)).map(|s| (s, false))
        } else {
            track!(self.create(filepath)).map(|s| (s, true))
        }
    }

    /// ファイルを新規に作成して`FileNvm`インスタンスを生成する.
    ///
    /// 既にファイルが存在する場合には、その内容は破棄される.
    pub fn create<P: AsRef<Path>>(&mut self, filepath: P) -> Result<FileNvm> {
        if let Some(dir) = filepath.as_ref().parent() {
            track_io!(fs::create_dir_all(dir))?;
        }
        let mut options = self.open_options();
        options.create(true);
        let file = track_io!(options.open(filepath))?;
        track!(self.set_exclusive_file_lock_if_flag_is_on(&file))?;

        // ロックを獲得してから切り詰める
        track_io!(file.set_len(0))?;
        Ok(FileNvm::new(file, 0))
    }

    /// 既存のファイルを開いて`FileNvm`インスタンスを生成する。
    ///
    /// ファイルの現在のサイズが、そのままメモリのサイズとなる.
    pub fn open<P: AsRef<Path>>(&mut self, filepath: P) -> Result<FileNvm> {
        let options = self.open_options();
        let file = track_io!(options.open(filepath))?;
        track!(self.set_exclusive_file_lock_if_flag_is_on(&file))?;
        let size = track_io!(file.metadata())?.len();
        Ok(FileNvm::new(file, size))
    }
}
impl Default for FileNvmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// ファイルベースの`NonVolatileMemory`の実装.
///
/// デフォルト設定では、ファイルに対して排他ロック(`flock(2)`)が獲得される.
#[derive(Debug)]
pub struct FileNvm {
    file: File,
    cursor_position: u64,
    size: u64,
}
impl FileNvm {
    /// デフォルト設定で新しい`FileNvm`インスタンスを生成する.
    ///
    /// `filepath`が既に存在する場合にはそれを開き、存在しない場合には新規にファイルを作成する.
    ///
    /// 返り値のタプルの二番目の値は、ファイルが新規作成されたかどうか (`true`なら新規作成).
    pub fn create_if_absent<P: AsRef<Path>>(filepath: P) -> Result<(Self, bool)> {
        FileNvmBuilder::new().create_if_absent(filepath)
    }

    /// デフォルト設定でファイルを新規に作成して`FileNvm`インスタンスを生成する.
    pub fn create<P: AsRef<Path>>(filepath: P) -> Result<Self> {
        FileNvmBuilder::new().create(filepath)
    }

    /// デフォルト設定で既存のファイルを開き`FileNvm`インスタンスを生成する。
    pub fn open<P: AsRef<Path>>(filepath: P) -> Result<Self> {
        FileNvmBuilder::new().open(filepath)
    }

    fn new(file: File, size: u64) -> FileNvm {
        FileNvm {
            file,
            cursor_position: 0,
            size,
        }
    }

    fn seek_impl(&mut self, position: u64) -> Result<()> {
        track_io!(self.file.seek(io::SeekFrom::Start(position)))?;
        self.cursor_position = position;
        Ok(())
    }
    fn read_impl(&mut self, buf: &mut [u8]) -> Result<usize> {
        let read_size = track_io!(self.file.read(buf))?;
        self.cursor_position += read_size as u64;
        Ok(read_size)
    }
    fn write_impl(&mut self, buf: &[u8]) -> Result<usize> {
        track_io!(self.file.write_all(buf))?;
        self.cursor_position += buf.len() as u64;
        if self.size < self.cursor_position {
            self.size = self.cursor_position;
        }
        Ok(buf.len())
    }

    #[cfg(test)]
    fn inner(&self) -> &File {
        &self.file
    }
}
impl NonVolatileMemory for FileNvm {
    fn sync(&mut self) -> Result<()> {
        track_io!(self.file.sync_data())?;
        Ok(())
    }
    fn position(&self) -> u64 {
        self.cursor_position
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn truncate(&mut self, size: u64) -> Result<()> {
        track_assert!(size <= self.size, ErrorKind::InvalidInput; size, self.size);
        track_io!(self.file.set_len(size))?;
        self.size = size;
        track!(self.seek_impl(0))
    }
}
impl Seek for FileNvm {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let position = self.convert_to_offset(pos)?;
        track!(self.seek_impl(position))?;
        Ok(position)
    }
}
impl Read for FileNvm {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read_size = track!(self.read_impl(buf))?;
        Ok(read_size)
    }
}
impl Write for FileNvm {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written_size = track!(self.write_impl(buf))?;
        Ok(written_size)
    }
    fn flush(&mut self) -> io::Result<()> {
        track_io!(self.file.flush())?;
        Ok(())
    }
}
