//! レジスタ識別子（x86_64）

use std::fmt;

/// x86_64の汎用レジスタ
///
/// gdb-remoteプロトコルのレジスタ番号と対応します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
}

impl Register {
    /// 全てのレジスタ（gdb-remoteの番号順）
    pub const ALL: [Register; 18] = [
        Register::Rax,
        Register::Rbx,
        Register::Rcx,
        Register::Rdx,
        Register::Rsi,
        Register::Rdi,
        Register::Rbp,
        Register::Rsp,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
        Register::Rip,
        Register::Eflags,
    ];

    /// プログラムカウンタ
    pub const PC: Register = Register::Rip;
    /// スタックポインタ
    pub const SP: Register = Register::Rsp;
    /// フレームポインタ
    pub const FP: Register = Register::Rbp;

    /// gdb-remoteのレジスタ番号
    pub fn regnum(&self) -> usize {
        *self as usize
    }

    /// レジスタ番号からレジスタを取得する
    pub fn from_regnum(regnum: usize) -> Option<Self> {
        Self::ALL.get(regnum).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Register::Rax => "rax",
            Register::Rbx => "rbx",
            Register::Rcx => "rcx",
            Register::Rdx => "rdx",
            Register::Rsi => "rsi",
            Register::Rdi => "rdi",
            Register::Rbp => "rbp",
            Register::Rsp => "rsp",
            Register::R8 => "r8",
            Register::R9 => "r9",
            Register::R10 => "r10",
            Register::R11 => "r11",
            Register::R12 => "r12",
            Register::R13 => "r13",
            Register::R14 => "r14",
            Register::R15 => "r15",
            Register::Rip => "rip",
            Register::Eflags => "eflags",
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
