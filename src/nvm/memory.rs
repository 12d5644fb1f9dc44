use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use crate::nvm::NonVolatileMemory;
use crate::{ErrorKind, Result};

type Memory = Cursor<Vec<u8>>;

/// メモリベースの`NonVolatileMemory`の実装.
///
/// # 注意
///
/// これは主にテストや性能計測用途を意図した実装であり、
/// `NonVolatileMemory`が本来要求する"不揮発性"は満たしていない.
#[derive(Debug)]
pub struct MemoryNvm {
    memory: Memory,
}
impl MemoryNvm {
    /// 新しい`MemoryNvm`インスタンスを生成する.
    pub fn new(memory: Vec<u8>) -> Self {
        MemoryNvm {
            memory: Cursor::new(memory),
        }
    }

    /// 保持しているバイト列への参照を返す.
    pub fn as_bytes(&self) -> &[u8] {
        self.memory.get_ref()
    }

    /// インスタンスを破棄して、保持しているバイト列を返す.
    pub fn into_bytes(self) -> Vec<u8> {
        self.memory.into_inner()
    }
}
impl Default for MemoryNvm {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
impl NonVolatileMemory for MemoryNvm {
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
    fn position(&self) -> u64 {
        self.memory.position()
    }
    fn size(&self) -> u64 {
        self.memory.get_ref().len() as u64
    }
    fn truncate(&mut self, size: u64) -> Result<()> {
        track_assert!(size <= self.size(), ErrorKind::InvalidInput; size, self.size());
        self.memory.get_mut().truncate(size as usize);
        self.memory.set_position(0);
        Ok(())
    }
}
impl Seek for MemoryNvm {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let position = self.convert_to_offset(pos)?;
        self.memory.set_position(position);
        Ok(position)
    }
}
impl Read for MemoryNvm {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.memory.read(buf)
    }
}
impl Write for MemoryNvm {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.memory.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
