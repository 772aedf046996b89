//! ソフトウェアブレークポイント（INT3）

use crate::{MemoryAccess, Result};

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// ソフトウェアブレークポイント（INT3命令）
///
/// 1つのブレークポイントサイトにつき1つだけ存在し、
/// サイトの有効なオーナーがいる間だけメモリに書き込まれます。
#[derive(Debug)]
pub struct SoftwareBreakpoint {
    address: u64,
    original_byte: u8,
    enabled: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: 0,
            enabled: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// ブレークポイントが挿入されているかどうか
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 元のバイトを取得する
    pub fn original_byte(&self) -> u8 {
        self.original_byte
    }

    /// ブレークポイントを挿入する
    ///
    /// 指定されたアドレスの命令を0xCC（INT3）で置き換えます。
    pub fn enable(&mut self, memory: &mut dyn MemoryAccess) -> Result<()> {
        if self.enabled {
            return Ok(());
        }

        self.original_byte = memory.read_u8(self.address)?;
        memory.write_u8(self.address, INT3_OPCODE)?;

        self.enabled = true;
        Ok(())
    }

    /// ブレークポイントを除去する
    ///
    /// INT3命令を元のバイトで置き換えます。
    pub fn disable(&mut self, memory: &mut dyn MemoryAccess) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        memory.write_u8(self.address, self.original_byte)?;

        self.enabled = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMemory;

    #[test]
    fn test_enable_disable_restores_byte() {
        let mut memory = SimMemory::new();
        memory.write_u8(0x1000, 0x55).unwrap();

        let mut bp = SoftwareBreakpoint::new(0x1000);
        bp.enable(&mut memory).unwrap();
        assert!(bp.is_enabled());
        assert_eq!(memory.read_u8(0x1000).unwrap(), INT3_OPCODE);
        assert_eq!(bp.original_byte(), 0x55);

        // 二重挿入しても元のバイトは上書きされない
        bp.enable(&mut memory).unwrap();
        assert_eq!(bp.original_byte(), 0x55);

        bp.disable(&mut memory).unwrap();
        assert!(!bp.is_enabled());
        assert_eq!(memory.read_u8(0x1000).unwrap(), 0x55);
    }
}
