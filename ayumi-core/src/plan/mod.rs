//! スレッドプラン
//!
//! プランは「スレッドをどこまで進めるか」を表す小さな状態機械です。
//! スレッドごとのプランスタックに積まれ、停止のたびに上から順に
//! 「この停止は自分のものか」「止まるべきか」「完了したか」を問い合わせられます。
//!
//! プランの種類は閉じた列挙型 [`Plan`] で表し、共通の問い合わせは
//! [`ThreadPlan`] トレイトで定義します。

pub mod base;
pub mod stack;
pub mod step_instruction;
pub mod step_out;
pub mod step_range;

pub use base::BasePlan;
pub use stack::{CompletedPlan, PlanStack, ResumeDisposition, StopDecision};
pub use step_instruction::StepInstructionPlan;
pub use step_out::{DelegateKind, StepOutOptions, StepOutPlan};
pub use step_range::{StepRangeOptions, StepRangePlan};

use crate::abi::{Abi, ReturnValue};
use crate::errors::PlanError;
use ayumi_target::{
    Frame, FrameComparison, ResumeState, SharedSites, StopInfo, ThreadState,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_PLAN_ID: AtomicU64 = AtomicU64::new(1);

/// プランID（プロセス内で一意）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanId(pub u64);

impl PlanId {
    fn next() -> Self {
        Self(NEXT_PLAN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 停止を報告するか・再開を報告するかの投票
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Yes,
    No,
    NoOpinion,
}

/// 未決定を許す真偽値
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LazyBool {
    Yes,
    No,
    #[default]
    Calculate,
}

impl LazyBool {
    /// `Calculate` なら `default` を使う
    pub fn resolve(self, default: bool) -> bool {
        match self {
            LazyBool::Yes => true,
            LazyBool::No => false,
            LazyBool::Calculate => default,
        }
    }
}

/// 説明文の詳しさ
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DescriptionLevel {
    Brief,
    Full,
    Verbose,
}

/// プランの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Base,
    StepInstruction,
    StepRange,
    StepOut,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlanKind::Base => "base",
            PlanKind::StepInstruction => "step-instruction",
            PlanKind::StepRange => "step-range",
            PlanKind::StepOut => "step-out",
        };
        write!(f, "{}", name)
    }
}

/// ステップ動作のフラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepFlags {
    /// デバッグ情報のないフレームでは止まらない
    pub avoid_no_debug: bool,
}

/// 「ここで止まってよいか」の判定関数
pub type ShouldStopHereFn = Arc<dyn Fn(&Frame, FrameComparison, StepFlags) -> bool + Send + Sync>;

/// 到達したフレームで止まるかどうかの方針
#[derive(Clone, Default)]
pub enum StopHerePolicy {
    /// デバッグ情報の有無で判定する
    #[default]
    Default,
    /// 常に止まる（さらに外へ出るプランが使う）
    Always,
    /// 呼び出し側が指定した判定
    Custom(ShouldStopHereFn),
}

impl StopHerePolicy {
    /// 現在の最も深いフレームで止まるかどうか
    pub fn should_stop_here(
        &self,
        thread: &dyn ThreadState,
        comparison: FrameComparison,
        flags: StepFlags,
    ) -> bool {
        let Some(frame) = thread.frame_at(0) else {
            return true;
        };
        match self {
            StopHerePolicy::Always => true,
            StopHerePolicy::Default => default_should_stop_here(&frame, comparison, flags),
            StopHerePolicy::Custom(callback) => callback(&frame, comparison, flags),
        }
    }
}

impl fmt::Debug for StopHerePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopHerePolicy::Default => write!(f, "Default"),
            StopHerePolicy::Always => write!(f, "Always"),
            StopHerePolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// 既定の判定: デバッグ情報のないフレームは避ける設定なら止まらない
pub fn default_should_stop_here(frame: &Frame, _comparison: FrameComparison, flags: StepFlags) -> bool {
    !(flags.avoid_no_debug && !frame.has_debug_info)
}

/// 全プラン共通の状態
#[derive(Debug)]
pub struct PlanCore {
    id: PlanId,
    name: &'static str,
    private: bool,
    okay_to_discard: bool,
    stop_vote: Vote,
    run_vote: Vote,
    complete: bool,
    succeeded: bool,
    managed: bool,
}

impl PlanCore {
    pub fn new(name: &'static str, stop_vote: Vote, run_vote: Vote) -> Self {
        Self {
            id: PlanId::next(),
            name,
            private: false,
            okay_to_discard: false,
            stop_vote,
            run_vote,
            complete: false,
            succeeded: false,
            managed: false,
        }
    }

    pub fn id(&self) -> PlanId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 内部プラン（完了してもユーザーへの停止理由にならない）かどうか
    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn set_private(&mut self, private: bool) {
        self.private = private;
    }

    pub fn okay_to_discard(&self) -> bool {
        self.okay_to_discard
    }

    pub fn set_okay_to_discard(&mut self, okay: bool) {
        self.okay_to_discard = okay;
    }

    pub fn stop_vote(&self) -> Vote {
        self.stop_vote
    }

    pub fn run_vote(&self) -> Vote {
        self.run_vote
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// 完了を記録する
    pub fn set_complete(&mut self, success: bool) {
        self.complete = true;
        self.succeeded = success;
    }

    /// 完了済みなら一度だけ `true` を返す
    pub fn finish(&mut self) -> bool {
        if self.complete && !self.managed {
            self.managed = true;
            true
        } else {
            false
        }
    }
}

/// プランが参照する外部環境
#[derive(Clone, Copy)]
pub struct PlanEnv<'a> {
    pub thread: &'a dyn ThreadState,
    pub sites: &'a SharedSites,
    pub abi: Option<&'a dyn Abi>,
}

/// 問い合わせ中のプランに渡される文脈
///
/// 子プランは `queue()` で予約し、呼び出しが終わった後にスタックが積みます。
pub struct PlanContext<'a> {
    env: PlanEnv<'a>,
    finished: &'a HashSet<PlanId>,
    queued: Vec<Plan>,
}

impl<'a> PlanContext<'a> {
    pub fn new(env: PlanEnv<'a>, finished: &'a HashSet<PlanId>) -> Self {
        Self {
            env,
            finished,
            queued: Vec::new(),
        }
    }

    pub fn env(&self) -> PlanEnv<'a> {
        self.env
    }

    pub fn thread(&self) -> &'a dyn ThreadState {
        self.env.thread
    }

    pub fn sites(&self) -> &'a SharedSites {
        self.env.sites
    }

    pub fn abi(&self) -> Option<&'a dyn Abi> {
        self.env.abi
    }

    /// 子プランを予約する
    pub fn queue(&mut self, plan: Plan) -> PlanId {
        let id = plan.id();
        self.queued.push(plan);
        id
    }

    /// 指定したプランが完了してスタックから取り除かれたかどうか
    pub fn is_finished(&self, id: PlanId) -> bool {
        self.finished.contains(&id)
    }

    pub(crate) fn take_queued(&mut self) -> Vec<Plan> {
        std::mem::take(&mut self.queued)
    }
}

/// スレッドプランの共通インターフェース
pub trait ThreadPlan {
    fn core(&self) -> &PlanCore;

    fn core_mut(&mut self) -> &mut PlanCore;

    fn kind(&self) -> PlanKind;

    /// 構築に成功したかどうか
    fn validate(&self) -> Result<(), PlanError>;

    /// このプランが望む再開方法
    fn run_state(&self) -> ResumeState;

    /// 他のスレッドを止めておくかどうか
    fn stop_others(&self) -> bool;

    /// スタックに積まれた直後に呼ばれる
    fn did_push(&mut self, _ctx: &mut PlanContext<'_>) {}

    /// 再開直前に呼ばれる（`current` はスタックの一番上かどうか）
    fn will_resume(&mut self, _ctx: &mut PlanContext<'_>, _state: ResumeState, _current: bool) -> bool {
        true
    }

    /// 完了してスレッドが止まる直前に呼ばれる
    fn will_stop(&mut self, _ctx: &mut PlanContext<'_>) -> bool {
        true
    }

    /// この停止がこのプランによるものかどうか
    fn explains_stop(&mut self, ctx: &mut PlanContext<'_>, event: &StopInfo) -> bool;

    /// 停止を維持すべきかどうか
    fn should_stop(&mut self, ctx: &mut PlanContext<'_>, event: &StopInfo) -> bool;

    /// 完了済みならスタックから取り除けることを一度だけ報告する
    fn mischief_managed(&mut self, _ctx: &mut PlanContext<'_>) -> bool {
        self.core_mut().finish()
    }

    /// もう意味を持たないプランかどうか
    fn is_stale(&self, _ctx: &PlanContext<'_>) -> bool {
        false
    }

    fn description(&self, level: DescriptionLevel) -> String;

    /// 完了時に取り出した戻り値
    fn return_value(&self) -> Option<&ReturnValue> {
        None
    }

    /// 完了を待っている子プラン
    fn child_plan(&self) -> Option<PlanId> {
        None
    }
}

/// プランの種類ごとの実装
#[derive(Debug)]
pub enum Plan {
    Base(BasePlan),
    StepInstruction(StepInstructionPlan),
    StepRange(StepRangePlan),
    StepOut(StepOutPlan),
}

macro_rules! dispatch {
    ($plan:expr, $inner:ident => $body:expr) => {
        match $plan {
            Plan::Base($inner) => $body,
            Plan::StepInstruction($inner) => $body,
            Plan::StepRange($inner) => $body,
            Plan::StepOut($inner) => $body,
        }
    };
}

impl Plan {
    pub fn id(&self) -> PlanId {
        self.core().id()
    }

    pub fn is_private(&self) -> bool {
        self.core().is_private()
    }

    pub fn as_step_out(&self) -> Option<&StepOutPlan> {
        match self {
            Plan::StepOut(plan) => Some(plan),
            _ => None,
        }
    }
}

impl ThreadPlan for Plan {
    fn core(&self) -> &PlanCore {
        dispatch!(self, p => p.core())
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        dispatch!(self, p => p.core_mut())
    }

    fn kind(&self) -> PlanKind {
        dispatch!(self, p => p.kind())
    }

    fn validate(&self) -> Result<(), PlanError> {
        dispatch!(self, p => p.validate())
    }

    fn run_state(&self) -> ResumeState {
        dispatch!(self, p => p.run_state())
    }

    fn stop_others(&self) -> bool {
        dispatch!(self, p => p.stop_others())
    }

    fn did_push(&mut self, ctx: &mut PlanContext<'_>) {
        dispatch!(self, p => p.did_push(ctx))
    }

    fn will_resume(&mut self, ctx: &mut PlanContext<'_>, state: ResumeState, current: bool) -> bool {
        dispatch!(self, p => p.will_resume(ctx, state, current))
    }

    fn will_stop(&mut self, ctx: &mut PlanContext<'_>) -> bool {
        dispatch!(self, p => p.will_stop(ctx))
    }

    fn explains_stop(&mut self, ctx: &mut PlanContext<'_>, event: &StopInfo) -> bool {
        dispatch!(self, p => p.explains_stop(ctx, event))
    }

    fn should_stop(&mut self, ctx: &mut PlanContext<'_>, event: &StopInfo) -> bool {
        dispatch!(self, p => p.should_stop(ctx, event))
    }

    fn mischief_managed(&mut self, ctx: &mut PlanContext<'_>) -> bool {
        dispatch!(self, p => p.mischief_managed(ctx))
    }

    fn is_stale(&self, ctx: &PlanContext<'_>) -> bool {
        dispatch!(self, p => p.is_stale(ctx))
    }

    fn description(&self, level: DescriptionLevel) -> String {
        dispatch!(self, p => p.description(level))
    }

    fn return_value(&self) -> Option<&ReturnValue> {
        dispatch!(self, p => p.return_value())
    }

    fn child_plan(&self) -> Option<PlanId> {
        dispatch!(self, p => p.child_plan())
    }
}

impl From<BasePlan> for Plan {
    fn from(plan: BasePlan) -> Self {
        Plan::Base(plan)
    }
}

impl From<StepInstructionPlan> for Plan {
    fn from(plan: StepInstructionPlan) -> Self {
        Plan::StepInstruction(plan)
    }
}

impl From<StepRangePlan> for Plan {
    fn from(plan: StepRangePlan) -> Self {
        Plan::StepRange(plan)
    }
}

impl From<StepOutPlan> for Plan {
    fn from(plan: StepOutPlan) -> Self {
        Plan::StepOut(plan)
    }
}

/// 位置の表示（関数名があれば付ける）
pub(crate) fn format_location(function: Option<&str>, address: Option<u64>) -> String {
    match (function, address) {
        (Some(name), Some(addr)) => format!("{} at 0x{:x}", name, addr),
        (None, Some(addr)) => format!("address 0x{:x}", addr),
        (Some(name), None) => name.to_string(),
        (None, None) => "unknown address".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ayumi_target::{AddressRange, StackId};

    #[test]
    fn test_lazy_bool_resolves_against_default() {
        assert!(LazyBool::Yes.resolve(false));
        assert!(!LazyBool::No.resolve(true));
        assert!(LazyBool::Calculate.resolve(true));
        assert!(!LazyBool::Calculate.resolve(false));
    }

    #[test]
    fn test_finish_reports_once() {
        let mut core = PlanCore::new("test", Vote::NoOpinion, Vote::NoOpinion);
        assert!(!core.finish());
        core.set_complete(true);
        assert!(core.finish());
        assert!(!core.finish());
        assert!(core.succeeded());
    }

    #[test]
    fn test_plan_ids_are_unique() {
        let a = PlanCore::new("a", Vote::No, Vote::No);
        let b = PlanCore::new("b", Vote::No, Vote::No);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_default_policy_avoids_frames_without_debug_info() {
        let mut frame = Frame::new(0, StackId::new(0x1000), 0x40_1000);
        frame.has_debug_info = false;
        let avoid = StepFlags { avoid_no_debug: true };

        assert!(!default_should_stop_here(&frame, FrameComparison::Older, avoid));
        assert!(default_should_stop_here(&frame, FrameComparison::Older, StepFlags::default()));

        frame.has_debug_info = true;
        frame.inline_ranges.push(AddressRange::new(0x40_1000, 0x40_1010));
        assert!(default_should_stop_here(&frame, FrameComparison::Older, avoid));
    }

    #[test]
    fn test_format_location() {
        assert_eq!(format_location(Some("main"), Some(0x10)), "main at 0x10");
        assert_eq!(format_location(None, Some(0x10)), "address 0x10");
        assert_eq!(format_location(None, None), "unknown address");
    }
}
