//! メモリアクセス機能

use crate::Result;

/// ターゲットのメモリへの読み書き
///
/// ソフトウェアブレークポイントの挿入と除去にだけ使われるため、
/// キャッシュは持たずに毎回ターゲットへアクセスする想定です。
pub trait MemoryAccess: Send {
    /// メモリからデータを読み取る
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>>;

    /// メモリにデータを書き込む
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// u8値を読み取る
    fn read_u8(&self, addr: u64) -> Result<u8> {
        let bytes = self.read(addr, 1)?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Cannot read u8 from empty bytes at 0x{:x}", addr))
    }

    /// u8値を書き込む
    fn write_u8(&mut self, addr: u64, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }
}
