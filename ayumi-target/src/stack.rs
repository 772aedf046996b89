//! スタックフレームとスタック識別子

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// スタック識別子
///
/// 1つの活性化レコードを識別する比較可能なトークンです。
/// CFA（Canonical Frame Address）とインライン深さから構成されます。
///
/// スタックは下位アドレスに向かって伸びるため、より深い（より新しい）フレームほど
/// CFAが小さくなります。順序はこれに合わせ、「小さい = より深い」とします。
/// 同じCFAを持つインラインフレーム同士では、インライン深さが大きい方が小さくなります。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackId {
    cfa: u64,
    inline_depth: u32,
}

impl StackId {
    /// 具象フレームのスタック識別子を作成する
    pub fn new(cfa: u64) -> Self {
        Self {
            cfa,
            inline_depth: 0,
        }
    }

    /// インラインフレームのスタック識別子を作成する
    pub fn inlined(cfa: u64, inline_depth: u32) -> Self {
        Self { cfa, inline_depth }
    }

    pub fn cfa(&self) -> u64 {
        self.cfa
    }

    pub fn inline_depth(&self) -> u32 {
        self.inline_depth
    }

    /// `other` よりも深い（新しい）フレームかどうか
    pub fn is_younger_than(&self, other: &StackId) -> bool {
        self < other
    }

    /// `other` から見たこのフレームの位置
    pub fn compare_to(&self, other: &StackId) -> FrameComparison {
        match self.cmp(other) {
            Ordering::Less => FrameComparison::Younger,
            Ordering::Equal => FrameComparison::Same,
            Ordering::Greater => FrameComparison::Older,
        }
    }
}

impl Ord for StackId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cfa
            .cmp(&other.cfa)
            .then_with(|| other.inline_depth.cmp(&self.inline_depth))
    }
}

impl PartialOrd for StackId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inline_depth == 0 {
            write!(f, "cfa=0x{:x}", self.cfa)
        } else {
            write!(f, "cfa=0x{:x}+inline{}", self.cfa, self.inline_depth)
        }
    }
}

/// フレーム同士の位置関係
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameComparison {
    /// より深い（新しい）フレーム
    Younger,
    Same,
    /// より浅い（古い）フレーム
    Older,
}

/// アドレス範囲（終端は含まない）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:x}-0x{:x})", self.start, self.end)
    }
}

/// 型の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Bool,
    Integer { signed: bool },
    Pointer,
    Float,
    Aggregate,
}

/// 戻り値の型情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueType {
    pub name: String,
    pub kind: TypeKind,
    /// バイトサイズ
    pub size: u32,
}

impl ValueType {
    pub fn new(name: impl Into<String>, kind: TypeKind, size: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
        }
    }

    pub fn is_void(&self) -> bool {
        self.kind == TypeKind::Void
    }
}

/// 関数情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    pub return_type: Option<ValueType>,
}

/// スタックフレーム
///
/// 外部の巻き戻し機能が作るフレームのスナップショットです。
/// インデックス0が最も深いフレームです。
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub stack_id: StackId,
    /// フレームのコードアドレス（1以上のフレームでは戻りアドレス）
    pub pc: u64,
    /// インライン展開された活性化かどうか
    pub inlined: bool,
    /// デバッグ情報があるかどうか
    pub has_debug_info: bool,
    pub function: Option<Arc<FunctionInfo>>,
    /// インラインブロックのアドレス範囲（不連続なら複数）
    pub inline_ranges: Vec<AddressRange>,
}

impl Frame {
    pub fn new(index: usize, stack_id: StackId, pc: u64) -> Self {
        Self {
            index,
            stack_id,
            pc,
            inlined: false,
            has_debug_info: true,
            function: None,
            inline_ranges: Vec::new(),
        }
    }

    pub fn function_name(&self) -> Option<&str> {
        self.function.as_deref().map(|f| f.name.as_str())
    }
}
