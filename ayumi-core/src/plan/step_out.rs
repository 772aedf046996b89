//! ステップアウト
//!
//! 指定されたフレームから呼び出し元へ戻るまでスレッドを進めるプランです。
//!
//! 通常は戻りアドレスにこのスレッド専用の内部ブレークポイントを置き、
//! そこに着いてもスタックがまだ深ければ（再帰呼び出し）走らせ続けます。
//! インライン展開されたフレームには戻りアドレスがないため、
//! 次のどちらかの子プランに任せます。
//!
//! - 内側のフレームから出る: インラインフレームまで出るステップアウトを先に積む
//! - インラインフレーム自身から出る: インラインブロックの範囲を抜けるまで範囲ステップする
//!
//! 戻った先がデバッグ情報のないフレームで、それを避ける設定なら、
//! さらに外へ出る子プランを積みます。

use super::{
    format_location, DescriptionLevel, LazyBool, Plan, PlanContext, PlanCore, PlanEnv, PlanId,
    PlanKind, StepFlags, StepRangeOptions, StepRangePlan, StopHerePolicy, ThreadPlan, Vote,
};
use crate::abi::ReturnValue;
use crate::errors::PlanError;
use ayumi_target::{
    BreakpointHandle, BreakpointId, BreakpointSites, FrameComparison, FunctionInfo, ResumeState, StackId, StopInfo,
    StopReason, ThreadState,
};
use std::sync::Arc;

/// 戻りアドレスブレークポイントの用途名
const STEP_OUT_BREAKPOINT_KIND: &str = "step-out";

/// ステップアウトプランの作成オプション
#[derive(Debug, Clone)]
pub struct StepOutOptions {
    /// 最初の命令から実行を始めるかどうか
    pub first_insn: bool,
    pub stop_others: bool,
    pub stop_vote: Vote,
    pub run_vote: Vote,
    /// `Calculate` ならスレッド設定の `step_out_avoids_no_debug` を使う
    pub avoid_no_debug: LazyBool,
    pub stop_here: StopHerePolicy,
}

impl Default for StepOutOptions {
    fn default() -> Self {
        Self {
            first_insn: false,
            stop_others: true,
            stop_vote: Vote::Yes,
            run_vote: Vote::NoOpinion,
            avoid_no_debug: LazyBool::Calculate,
            stop_here: StopHerePolicy::Default,
        }
    }
}

/// 委譲中の子プランの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateKind {
    None,
    StepOutToInline,
    StepThroughInline,
    StepOutFurther,
}

/// スタックに積まれる前の子プランか、積まれた後のID
#[derive(Debug)]
enum ChildSlot {
    Pending(Box<Plan>),
    Queued(PlanId),
}

impl ChildSlot {
    fn id(&self) -> PlanId {
        match self {
            ChildSlot::Pending(plan) => plan.id(),
            ChildSlot::Queued(id) => *id,
        }
    }

    fn queue(&mut self, ctx: &mut PlanContext<'_>) {
        let id = self.id();
        if let ChildSlot::Pending(plan) = std::mem::replace(self, ChildSlot::Queued(id)) {
            ctx.queue(*plan);
        }
    }
}

#[derive(Debug)]
enum Delegate {
    None,
    StepOutToInline(ChildSlot),
    StepThroughInline(ChildSlot),
    StepOutFurther(PlanId),
}

#[derive(Debug)]
pub struct StepOutPlan {
    core: PlanCore,
    first_insn: bool,
    step_from_insn: Option<u64>,
    return_addr: Option<u64>,
    return_bp: Option<BreakpointHandle>,
    stop_others: bool,
    step_out_to_id: Option<StackId>,
    immediate_step_from_id: Option<StackId>,
    immediate_step_from_function: Option<Arc<FunctionInfo>>,
    return_function_name: Option<String>,
    delegate: Delegate,
    flags: StepFlags,
    stop_here: StopHerePolicy,
    return_value: Option<ReturnValue>,
    error: Option<PlanError>,
}

impl StepOutPlan {
    /// `frame_index` のフレームから出るプランを作成する
    ///
    /// 構築に失敗しても値は返り、`validate()` がエラーを報告します。
    pub fn new(env: PlanEnv<'_>, frame_index: usize, options: StepOutOptions) -> Self {
        let thread = env.thread;
        let mut plan = Self {
            core: PlanCore::new("Step out", options.stop_vote, options.run_vote),
            first_insn: options.first_insn,
            step_from_insn: thread.pc().ok(),
            return_addr: None,
            return_bp: None,
            stop_others: options.stop_others,
            step_out_to_id: None,
            immediate_step_from_id: None,
            immediate_step_from_function: None,
            return_function_name: None,
            delegate: Delegate::None,
            flags: StepFlags {
                avoid_no_debug: options
                    .avoid_no_debug
                    .resolve(thread.settings().step_out_avoids_no_debug),
            },
            stop_here: options.stop_here,
            return_value: None,
            error: None,
        };

        let Some(step_from) = thread.frame_at(frame_index) else {
            plan.error = Some(PlanError::FrameNotFound { index: frame_index });
            return plan;
        };
        let Some(return_frame) = thread.frame_at(frame_index + 1) else {
            plan.error = Some(PlanError::FrameNotFound {
                index: frame_index + 1,
            });
            return plan;
        };

        plan.step_out_to_id = Some(return_frame.stack_id);
        plan.immediate_step_from_id = Some(step_from.stack_id);
        plan.immediate_step_from_function = step_from.function.clone();
        plan.return_function_name = return_frame.function_name().map(str::to_string);

        if step_from.inlined {
            if frame_index > 0 {
                // まず内側のフレームからインラインフレームまで出る
                let child = StepOutPlan::new(
                    env,
                    frame_index - 1,
                    StepOutOptions {
                        first_insn: false,
                        stop_others: plan.stop_others,
                        stop_vote: Vote::NoOpinion,
                        run_vote: Vote::NoOpinion,
                        avoid_no_debug: LazyBool::No,
                        stop_here: StopHerePolicy::Always,
                    },
                );
                let mut child = Plan::from(child);
                child.core_mut().set_private(true);
                plan.delegate = Delegate::StepOutToInline(ChildSlot::Pending(Box::new(child)));
            } else {
                match plan.inlined_step_plan(env) {
                    Some(child) => {
                        plan.delegate =
                            Delegate::StepThroughInline(ChildSlot::Pending(Box::new(child)));
                    }
                    None => plan.error = Some(PlanError::NoInlineRange),
                }
            }
            return plan;
        }

        let return_addr = return_frame.pc;
        if return_addr == 0 || return_addr == u64::MAX {
            plan.error = Some(PlanError::InvalidReturnAddress);
            return plan;
        }
        plan.return_addr = Some(return_addr);

        match BreakpointHandle::create(
            env.sites,
            return_addr,
            STEP_OUT_BREAKPOINT_KIND,
            Some(thread.tid()),
        ) {
            Ok(bp) => {
                tracing::debug!(
                    "Step out breakpoint {} set at 0x{:x} for thread {}",
                    bp.id(),
                    return_addr,
                    thread.tid()
                );
                plan.return_bp = Some(bp);
            }
            Err(e) => {
                plan.error = Some(PlanError::BreakpointCreation {
                    address: return_addr,
                    reason: e.to_string(),
                });
            }
        }
        plan
    }

    /// 止まるかどうかの方針を差し替える
    pub fn set_should_stop_here(&mut self, policy: StopHerePolicy) {
        self.stop_here = policy;
    }

    pub fn return_address(&self) -> Option<u64> {
        self.return_addr
    }

    pub fn return_breakpoint(&self) -> Option<BreakpointId> {
        self.return_bp.as_ref().map(|bp| bp.id())
    }

    pub fn step_out_to_id(&self) -> Option<StackId> {
        self.step_out_to_id
    }

    pub fn first_insn(&self) -> bool {
        self.first_insn
    }

    pub fn delegate_kind(&self) -> DelegateKind {
        match self.delegate {
            Delegate::None => DelegateKind::None,
            Delegate::StepOutToInline(_) => DelegateKind::StepOutToInline,
            Delegate::StepThroughInline(_) => DelegateKind::StepThroughInline,
            Delegate::StepOutFurther(_) => DelegateKind::StepOutFurther,
        }
    }

    fn child_id(&self) -> Option<PlanId> {
        match &self.delegate {
            Delegate::None => None,
            Delegate::StepOutToInline(slot) | Delegate::StepThroughInline(slot) => Some(slot.id()),
            Delegate::StepOutFurther(id) => Some(*id),
        }
    }

    /// 最も深いインラインフレームの範囲を抜ける範囲ステップを作る
    fn inlined_step_plan(&self, env: PlanEnv<'_>) -> Option<Plan> {
        let frame = env.thread.frame_at(0)?;
        tracing::debug!(
            "Queuing inlined frame to step past: {}",
            frame.function_name().unwrap_or("??")
        );

        let (first, rest) = frame.inline_ranges.split_first()?;
        let mut plan = StepRangePlan::new(
            env,
            *first,
            StepRangeOptions {
                stop_others: self.stop_others,
                avoid_no_debug: LazyBool::No,
            },
        );
        plan.core_mut().set_private(true);
        plan.core_mut().set_okay_to_discard(true);
        if let Err(e) = plan.validate() {
            tracing::debug!("Could not step through the inlined block: {}", e);
            return None;
        }
        for range in rest {
            plan.add_range(*range);
        }
        Some(plan.into())
    }

    /// 止まれないフレームに戻った場合に、さらに外へ出るプランを予約する
    fn queue_step_out_from_here(&self, ctx: &mut PlanContext<'_>) -> Option<PlanId> {
        let mut plan = StepOutPlan::new(
            ctx.env(),
            0,
            StepOutOptions {
                first_insn: false,
                stop_others: self.stop_others,
                stop_vote: Vote::No,
                run_vote: Vote::NoOpinion,
                avoid_no_debug: LazyBool::No,
                stop_here: StopHerePolicy::Always,
            },
        );
        plan.core.set_private(true);
        if let Err(e) = plan.validate() {
            tracing::debug!("Could not step out any further: {}", e);
            return None;
        }
        Some(ctx.queue(plan.into()))
    }

    fn should_stop_here(&self, ctx: &PlanContext<'_>) -> bool {
        self.stop_here
            .should_stop_here(ctx.thread(), FrameComparison::Older, self.flags)
    }

    /// 戻り値を取り出す（一度だけ）
    fn calculate_return_value(&mut self, ctx: &PlanContext<'_>) {
        if self.return_value.is_some() {
            return;
        }
        let Some(abi) = ctx.abi() else {
            return;
        };
        let value = self
            .immediate_step_from_function
            .as_ref()
            .and_then(|function| function.return_type.as_ref())
            .filter(|ty| !ty.is_void())
            .and_then(|ty| abi.return_value(ctx.thread(), ty));
        self.return_value = value;
    }

    /// 目的のフレームに着いたので、止まるか外へ出続けるかを決める
    fn finish_or_step_further(&mut self, ctx: &mut PlanContext<'_>) -> bool {
        if self.should_stop_here(ctx) {
            self.calculate_return_value(ctx);
            self.core.set_complete(true);
            return true;
        }
        match self.queue_step_out_from_here(ctx) {
            Some(id) => {
                self.delegate = Delegate::StepOutFurther(id);
                false
            }
            None => {
                self.calculate_return_value(ctx);
                self.core.set_complete(true);
                true
            }
        }
    }
}

impl ThreadPlan for StepOutPlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn kind(&self) -> PlanKind {
        PlanKind::StepOut
    }

    fn validate(&self) -> Result<(), PlanError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        match &self.delegate {
            Delegate::StepOutToInline(ChildSlot::Pending(child))
            | Delegate::StepThroughInline(ChildSlot::Pending(child)) => child
                .validate()
                .map_err(|e| PlanError::DelegateInvalid(Box::new(e))),
            Delegate::None if self.return_bp.is_none() && !self.core.is_complete() => {
                Err(PlanError::InvalidReturnAddress)
            }
            _ => Ok(()),
        }
    }

    fn run_state(&self) -> ResumeState {
        ResumeState::Running
    }

    fn stop_others(&self) -> bool {
        self.stop_others
    }

    fn did_push(&mut self, ctx: &mut PlanContext<'_>) {
        match &mut self.delegate {
            Delegate::StepOutToInline(slot) | Delegate::StepThroughInline(slot) => slot.queue(ctx),
            Delegate::None | Delegate::StepOutFurther(_) => {}
        }
    }

    fn will_resume(&mut self, _ctx: &mut PlanContext<'_>, _state: ResumeState, current: bool) -> bool {
        if matches!(
            self.delegate,
            Delegate::StepOutToInline(_) | Delegate::StepThroughInline(_)
        ) {
            return true;
        }
        let Some(bp) = &self.return_bp else {
            return false;
        };
        if current {
            if let Err(e) = bp.set_enabled(true) {
                tracing::warn!("Failed to enable step out breakpoint {}: {}", bp.id(), e);
            }
        }
        true
    }

    fn will_stop(&mut self, _ctx: &mut PlanContext<'_>) -> bool {
        if let Some(bp) = &self.return_bp {
            if let Err(e) = bp.set_enabled(false) {
                tracing::warn!("Failed to disable step out breakpoint {}: {}", bp.id(), e);
            }
        }
        true
    }

    fn explains_stop(&mut self, ctx: &mut PlanContext<'_>, event: &StopInfo) -> bool {
        if let Some(child) = self.child_id() {
            // 子が完了していても、シグナルやユーザーブレークポイントは引き受けない
            if !ctx.is_finished(child) || event.reason.is_usually_unexplained() {
                return false;
            }
            if matches!(self.delegate, Delegate::StepThroughInline(_)) {
                self.calculate_return_value(ctx);
                self.core.set_complete(true);
            }
            return true;
        }

        match &event.reason {
            StopReason::Breakpoint(site_id) => {
                let Some(bp_id) = self.return_breakpoint() else {
                    return false;
                };
                let owner_count = {
                    let sites = ctx.sites().lock();
                    match sites.find_site_by_id(*site_id) {
                        Some(site) if site.is_owned_by(bp_id) => site.owner_count(),
                        _ => return false,
                    }
                };

                let Some(frame) = ctx.thread().frame_at(0) else {
                    return false;
                };
                let (Some(to_id), Some(from_id)) = (self.step_out_to_id, self.immediate_step_from_id)
                else {
                    return false;
                };

                // 再帰呼び出しの内側で同じ戻りアドレスに着いた場合はまだ終わっていない
                let done = if frame.stack_id == to_id || to_id < frame.stack_id {
                    true
                } else {
                    from_id < frame.stack_id
                };

                if done && self.should_stop_here(ctx) {
                    self.calculate_return_value(ctx);
                    self.core.set_complete(true);
                }

                // 他のオーナーもいるサイトなら、その停止理由を残す
                owner_count == 1
            }
            reason => !reason.is_usually_unexplained(),
        }
    }

    fn should_stop(&mut self, ctx: &mut PlanContext<'_>, _event: &StopInfo) -> bool {
        if self.core.is_complete() {
            return true;
        }

        if let Some(child) = self.child_id() {
            if !ctx.is_finished(child) {
                return false;
            }
            match self.delegate {
                Delegate::StepOutToInline(_) => {
                    match self.inlined_step_plan(ctx.env()) {
                        Some(plan) => {
                            let id = ctx.queue(plan);
                            self.delegate = Delegate::StepThroughInline(ChildSlot::Queued(id));
                            return false;
                        }
                        None => {
                            self.delegate = Delegate::None;
                            return self.finish_or_step_further(ctx);
                        }
                    }
                }
                Delegate::StepThroughInline(_) => return self.finish_or_step_further(ctx),
                Delegate::StepOutFurther(_) | Delegate::None => self.delegate = Delegate::None,
            }
        }

        let done = match (ctx.thread().frame_at(0), self.step_out_to_id) {
            (Some(frame), Some(to_id)) => !frame.stack_id.is_younger_than(&to_id),
            _ => true,
        };
        if !done {
            return false;
        }
        self.finish_or_step_further(ctx)
    }

    fn mischief_managed(&mut self, _ctx: &mut PlanContext<'_>) -> bool {
        if !self.core.finish() {
            return false;
        }
        tracing::debug!("Completed step out plan.");
        self.return_bp = None;
        true
    }

    fn is_stale(&self, ctx: &PlanContext<'_>) -> bool {
        match (ctx.thread().frame_at(0), self.step_out_to_id) {
            (Some(frame), Some(to_id)) => !frame.stack_id.is_younger_than(&to_id),
            _ => true,
        }
    }

    fn description(&self, level: DescriptionLevel) -> String {
        if level == DescriptionLevel::Brief {
            return "step out".to_string();
        }
        match self.delegate {
            Delegate::StepOutToInline(_) => {
                return "Stepping out to inlined frame so we can walk through it.".to_string()
            }
            Delegate::StepThroughInline(_) => {
                return "Stepping out by stepping through inlined function.".to_string()
            }
            Delegate::None | Delegate::StepOutFurther(_) => {}
        }

        let from = format_location(
            self.immediate_step_from_function
                .as_deref()
                .map(|f| f.name.as_str()),
            self.step_from_insn,
        );
        let to = format_location(self.return_function_name.as_deref(), self.return_addr);
        let mut s = format!("Stepping out from {} returning to frame at {}", from, to);
        if level == DescriptionLevel::Verbose {
            if let Some(bp) = &self.return_bp {
                s.push_str(&format!(" using breakpoint {}", bp.id()));
            }
        }
        s
    }

    fn return_value(&self) -> Option<&ReturnValue> {
        self.return_value.as_ref()
    }

    fn child_plan(&self) -> Option<PlanId> {
        self.child_id()
    }
}
