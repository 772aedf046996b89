//! メモリ上で動く模擬ターゲット
//!
//! 呼び出し・リターン・1命令実行を手で進められるスレッドと、
//! ブレークポイントを書き込めるメモリを提供します。
//! テストとREPLからステップ実行エンジンを動かすために使います。

use crate::{
    AddressRange, BreakpointSites, Frame, FunctionInfo, MemoryAccess, Register, ResumeState, Result,
    StackId, StopInfo, StopReason, ThreadId, ThreadSettings, ThreadState, ValueType,
};
use std::collections::HashMap;
use std::sync::Arc;

/// 未書き込み領域の値（NOP）
const FILL_BYTE: u8 = 0x90;
/// 呼び出し命令の長さ
const CALL_INSN_LEN: u64 = 5;
/// 1命令の長さ
const INSN_LEN: u64 = 4;
/// 1フレームあたりのスタック使用量
const FRAME_SIZE: u64 = 0x40;

const STACK_TOP: u64 = 0x7fff_f000;
const TEXT_BASE: u64 = 0x40_0000;

/// 模擬メモリ
#[derive(Debug, Default)]
pub struct SimMemory {
    bytes: HashMap<u64, u8>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryAccess for SimMemory {
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        Ok((0..size as u64)
            .map(|offset| {
                self.bytes
                    .get(&(addr + offset))
                    .copied()
                    .unwrap_or(FILL_BYTE)
            })
            .collect())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        for (offset, byte) in data.iter().enumerate() {
            self.bytes.insert(addr + offset as u64, *byte);
        }
        Ok(())
    }
}

/// 呼び出す関数の属性
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// デバッグ情報がない関数
    pub no_debug: bool,
    pub return_type: Option<ValueType>,
}

#[derive(Debug, Clone)]
struct SimFrame {
    function: Arc<FunctionInfo>,
    cfa: u64,
    inline_depth: u32,
    pc: u64,
    has_debug_info: bool,
    inline_ranges: Vec<AddressRange>,
}

impl SimFrame {
    fn is_inlined(&self) -> bool {
        self.inline_depth > 0
    }
}

/// 模擬スレッド
pub struct SimThread {
    tid: ThreadId,
    /// 最後の要素が最も深いフレーム
    frames: Vec<SimFrame>,
    registers: HashMap<Register, u64>,
    stop_info: Option<StopInfo>,
    settings: ThreadSettings,
    entries: HashMap<String, u64>,
}

impl SimThread {
    /// `entry` 関数の先頭で止まっているスレッドを作成する
    pub fn new(tid: ThreadId, entry: &str) -> Self {
        let mut thread = Self {
            tid,
            frames: Vec::new(),
            registers: HashMap::new(),
            stop_info: None,
            settings: ThreadSettings::default(),
            entries: HashMap::new(),
        };
        let pc = thread.entry_address(entry);
        thread.frames.push(SimFrame {
            function: Arc::new(FunctionInfo {
                name: entry.to_string(),
                return_type: None,
            }),
            cfa: STACK_TOP,
            inline_depth: 0,
            pc,
            has_debug_info: true,
            inline_ranges: Vec::new(),
        });
        thread
    }

    pub fn with_settings(mut self, settings: ThreadSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings_mut(&mut self) -> &mut ThreadSettings {
        &mut self.settings
    }

    /// 関数の先頭アドレス（名前ごとに固定）
    pub fn entry_address(&mut self, name: &str) -> u64 {
        let next = TEXT_BASE + 0x1000 * (self.entries.len() as u64 + 1);
        *self.entries.entry(name.to_string()).or_insert(next)
    }

    /// フレームの数
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// 現在のプログラムカウンタ
    pub fn current_pc(&self) -> u64 {
        self.frames.last().map_or(0, |f| f.pc)
    }

    fn innermost(&self) -> Option<&SimFrame> {
        self.frames.last()
    }

    /// 最も深いフレームとCFAを共有するフレームのPCを一括で更新する
    pub fn set_pc(&mut self, pc: u64) {
        let Some(cfa) = self.innermost().map(|f| f.cfa) else {
            return;
        };
        for frame in self.frames.iter_mut().rev() {
            if frame.cfa != cfa {
                break;
            }
            frame.pc = pc;
        }
    }

    /// 関数を呼び出す（新しい具象フレームを積む）
    pub fn call(&mut self, name: &str, options: CallOptions) {
        let Some(caller) = self.innermost() else {
            return;
        };
        let cfa = caller.cfa - FRAME_SIZE;
        let return_address = caller.pc + CALL_INSN_LEN;
        self.set_pc(return_address);

        let pc = self.entry_address(name);
        self.frames.push(SimFrame {
            function: Arc::new(FunctionInfo {
                name: name.to_string(),
                return_type: options.return_type,
            }),
            cfa,
            inline_depth: 0,
            pc,
            has_debug_info: !options.no_debug,
            inline_ranges: Vec::new(),
        });
    }

    /// インライン展開された関数に入る
    ///
    /// `ranges` はインラインブロックのアドレス範囲で、現在のPCを含む必要があります。
    pub fn enter_inline(&mut self, name: &str, ranges: Vec<AddressRange>) {
        let Some(caller) = self.innermost() else {
            return;
        };
        let frame = SimFrame {
            function: Arc::new(FunctionInfo {
                name: name.to_string(),
                return_type: None,
            }),
            cfa: caller.cfa,
            inline_depth: caller.inline_depth + 1,
            pc: caller.pc,
            has_debug_info: true,
            inline_ranges: ranges,
        };
        self.frames.push(frame);
    }

    /// 現在の関数からリターンする
    ///
    /// インラインフレームが残っていれば、それを含む具象フレームごと取り除きます。
    pub fn ret(&mut self, value: Option<u64>) {
        while let Some(frame) = self.frames.pop() {
            if !frame.is_inlined() {
                break;
            }
        }
        if let Some(value) = value {
            self.registers.insert(Register::Rax, value);
        }
    }

    /// 1命令進める
    ///
    /// PCがインラインブロックの範囲を出たら、そのインラインフレームは終了します。
    pub fn step_instruction(&mut self) {
        let pc = self.current_pc() + INSN_LEN;
        self.set_pc(pc);
        while let Some(frame) = self.innermost() {
            if frame.is_inlined() && !frame.inline_ranges.iter().any(|r| r.contains(pc)) {
                self.frames.pop();
            } else {
                break;
            }
        }
    }

    /// レジスタ値を設定する
    pub fn set_register(&mut self, reg: Register, value: u64) {
        self.registers.insert(reg, value);
    }

    /// 停止理由を直接設定する
    pub fn set_stop(&mut self, reason: StopReason) {
        self.stop_info = Some(StopInfo::new(reason, self.current_pc()));
    }

    /// ターゲットが進んだ後の停止を決める
    ///
    /// ステップ中なら必ずトレース停止、実行中なら挿入済みのサイトに着いたときだけ停止します。
    /// 停止しない場合は `None` を返します。
    pub fn settle(&mut self, sites: &dyn BreakpointSites, state: ResumeState) -> Option<StopInfo> {
        let pc = self.current_pc();
        let reason = match state {
            ResumeState::Stepping => Some(StopReason::Trace),
            ResumeState::Running => sites
                .site_at(pc)
                .filter(|site| site.is_inserted())
                .map(|site| StopReason::Breakpoint(site.id())),
            ResumeState::Suspended | ResumeState::Stopped => None,
        };
        self.stop_info = reason.map(|reason| StopInfo::new(reason, pc));
        self.stop_info.clone()
    }

    /// バックトレースを文字列で取得する
    pub fn backtrace(&self) -> Vec<String> {
        (0..self.depth())
            .filter_map(|i| self.frame_at(i))
            .map(|frame| {
                let mut line = format!(
                    "#{} 0x{:x} {} ({})",
                    frame.index,
                    frame.pc,
                    frame.function_name().unwrap_or("??"),
                    frame.stack_id
                );
                if frame.inlined {
                    line.push_str(" [inlined]");
                }
                if !frame.has_debug_info {
                    line.push_str(" [no debug info]");
                }
                line
            })
            .collect()
    }
}

impl ThreadState for SimThread {
    fn tid(&self) -> ThreadId {
        self.tid
    }

    fn frame_at(&self, index: usize) -> Option<Frame> {
        let position = self.frames.len().checked_sub(index + 1)?;
        let sim = &self.frames[position];
        Some(Frame {
            index,
            stack_id: StackId::inlined(sim.cfa, sim.inline_depth),
            pc: sim.pc,
            inlined: sim.is_inlined(),
            has_debug_info: sim.has_debug_info,
            function: Some(Arc::clone(&sim.function)),
            inline_ranges: sim.inline_ranges.clone(),
        })
    }

    fn stop_info(&self) -> Option<StopInfo> {
        self.stop_info.clone()
    }

    fn read_register(&self, reg: Register) -> Result<u64> {
        let frame = self
            .innermost()
            .ok_or_else(|| anyhow::anyhow!("Thread {} has no frames", self.tid))?;
        Ok(match reg {
            Register::Rip => frame.pc,
            Register::Rsp => frame.cfa - 8,
            _ => self.registers.get(&reg).copied().unwrap_or(0),
        })
    }

    fn settings(&self) -> &ThreadSettings {
        &self.settings
    }
}
