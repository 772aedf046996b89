//! 呼び出し規約と戻り値の取り出し

use ayumi_target::{Register, ThreadState, TypeKind, ValueType};
use std::fmt;

/// スカラーの戻り値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarValue {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Pointer(u64),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(v) => write!(f, "{}", v),
            ScalarValue::Signed(v) => write!(f, "{}", v),
            ScalarValue::Unsigned(v) => write!(f, "{}", v),
            ScalarValue::Pointer(v) => write!(f, "0x{:x}", v),
        }
    }
}

/// 関数の戻り値
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnValue {
    pub type_name: String,
    pub value: ScalarValue,
}

impl fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.type_name, self.value)
    }
}

/// 呼び出し規約
pub trait Abi: Send + Sync {
    fn name(&self) -> &'static str;

    /// 関数から戻った直後のスレッドから戻り値を取り出す
    ///
    /// 取り出せない型の場合は `None` を返します。
    fn return_value(&self, thread: &dyn ThreadState, return_type: &ValueType) -> Option<ReturnValue>;
}

/// System V AMD64 ABI
///
/// 整数・ポインタ・boolはRAXで返されます。
/// 浮動小数点（XMM0）と構造体は扱いません。
#[derive(Debug, Clone, Copy, Default)]
pub struct SysVX86_64;

impl Abi for SysVX86_64 {
    fn name(&self) -> &'static str {
        "sysv-x86_64"
    }

    fn return_value(&self, thread: &dyn ThreadState, return_type: &ValueType) -> Option<ReturnValue> {
        let rax = match return_type.kind {
            TypeKind::Void | TypeKind::Float | TypeKind::Aggregate => return None,
            _ => match thread.read_register(Register::Rax) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!("Could not read rax for return value: {}", e);
                    return None;
                }
            },
        };

        let value = match return_type.kind {
            TypeKind::Bool => ScalarValue::Bool(rax & 0xff != 0),
            TypeKind::Pointer => ScalarValue::Pointer(rax),
            TypeKind::Integer { signed } => {
                let bits = match return_type.size {
                    1 | 2 | 4 | 8 => return_type.size * 8,
                    _ => return None,
                };
                let shift = 64 - bits;
                if signed {
                    ScalarValue::Signed(((rax << shift) as i64) >> shift)
                } else {
                    ScalarValue::Unsigned((rax << shift) >> shift)
                }
            }
            TypeKind::Void | TypeKind::Float | TypeKind::Aggregate => return None,
        };

        Some(ReturnValue {
            type_name: return_type.name.clone(),
            value,
        })
    }
}
