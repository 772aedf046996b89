//! 停止理由と再開状態

use crate::SiteId;
use nix::sys::signal::Signal;
use std::fmt;

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// 停止理由なし（他スレッドの停止に巻き込まれた）
    None,
    /// ステップ実行完了
    Trace,
    /// ブレークポイントサイトのヒット
    Breakpoint(SiteId),
    /// ウォッチポイントのヒット
    Watchpoint(u32),
    /// シグナル受信
    Signal(i32),
    /// 例外
    Exception(String),
    /// execによるイメージの置き換え
    Exec,
    /// プランの完了
    PlanComplete,
    /// スレッドの終了
    ThreadExiting,
    /// サニタイザなどの計装による停止
    Instrumentation,
}

impl StopReason {
    /// 通常はステップ実行プランが説明しない停止理由かどうか
    pub fn is_usually_unexplained(&self) -> bool {
        matches!(
            self,
            StopReason::Breakpoint(_)
                | StopReason::Watchpoint(_)
                | StopReason::Signal(_)
                | StopReason::Exception(_)
                | StopReason::Exec
                | StopReason::ThreadExiting
                | StopReason::Instrumentation
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::None => write!(f, "none"),
            StopReason::Trace => write!(f, "trace"),
            StopReason::Breakpoint(site) => write!(f, "breakpoint site {}", site),
            StopReason::Watchpoint(id) => write!(f, "watchpoint {}", id),
            StopReason::Signal(signo) => match Signal::try_from(*signo) {
                Ok(signal) => write!(f, "signal {}", signal),
                Err(_) => write!(f, "signal {}", signo),
            },
            StopReason::Exception(desc) => write!(f, "exception: {}", desc),
            StopReason::Exec => write!(f, "exec"),
            StopReason::PlanComplete => write!(f, "plan complete"),
            StopReason::ThreadExiting => write!(f, "thread exiting"),
            StopReason::Instrumentation => write!(f, "instrumentation"),
        }
    }
}

/// 直近の停止に関する情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopInfo {
    pub reason: StopReason,
    /// 停止時のプログラムカウンタ
    pub pc: u64,
}

impl StopInfo {
    pub fn new(reason: StopReason, pc: u64) -> Self {
        Self { reason, pc }
    }
}

/// スレッドの再開状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeState {
    Running,
    Stepping,
    Suspended,
    Stopped,
}

impl ResumeState {
    /// 実際にターゲットを動かす状態かどうか
    pub fn is_running(&self) -> bool {
        matches!(self, ResumeState::Running | ResumeState::Stepping)
    }
}

impl fmt::Display for ResumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResumeState::Running => "running",
            ResumeState::Stepping => "stepping",
            ResumeState::Suspended => "suspended",
            ResumeState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
