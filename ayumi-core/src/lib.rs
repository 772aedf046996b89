//! Ayumi ステップ実行エンジン
//!
//! このクレートは、スレッドごとのプランスタックでステップ実行を制御します。
//! ステップアウト、範囲ステップ、1命令ステップの各プランと、停止の判定、
//! スレッド間の再開調整、戻り値の取り出しを提供します。

pub mod abi;
pub mod command;
pub mod controller;
pub mod errors;
pub mod parse;
pub mod plan;
pub mod process;

pub use abi::{Abi, ReturnValue, ScalarValue, SysVX86_64};
pub use command::Command;
pub use controller::ThreadController;
pub use errors::PlanError;
pub use plan::{
    CompletedPlan, DelegateKind, DescriptionLevel, LazyBool, Plan, PlanId, PlanKind, PlanStack,
    StepFlags, StepOutOptions, StepOutPlan, StepRangeOptions, StopDecision, StopHerePolicy,
    ThreadPlan, Vote,
};
pub use process::{resume_actions, resume_threads, should_report_stop, ResumeRequest};

// 他のクレートから使用するために再エクスポート
pub use ayumi_target::{StopReason, ThreadId};

/// エンジンの結果型
pub type Result<T> = anyhow::Result<T>;
