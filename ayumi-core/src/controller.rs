//! スレッドのステップ実行制御

use crate::abi::{Abi, ReturnValue};
use crate::errors::PlanError;
use crate::plan::{
    CompletedPlan, DescriptionLevel, Plan, PlanEnv, PlanId, PlanStack, StepInstructionPlan,
    StepOutOptions, StepOutPlan, StepRangeOptions, StepRangePlan, StopDecision, ThreadPlan,
};
use crate::process::ResumeRequest;
use ayumi_target::{
    AddressRange, SharedSites, StopInfo, StopReason, ThreadId, ThreadState,
};
use std::sync::Arc;

/// スレッドコントローラ
///
/// 1つのスレッドのプランスタックを持ち、ステップ要求の受け付け、
/// 再開方法の決定、停止の判定を行います。
/// スレッドの状態そのもの（フレームやレジスタ）は呼び出しのたびに渡されます。
pub struct ThreadController {
    tid: ThreadId,
    plans: PlanStack,
    /// ブレークポイント保持機能
    sites: SharedSites,
    /// 戻り値の取り出しに使う呼び出し規約
    abi: Option<Arc<dyn Abi>>,
}

impl ThreadController {
    /// 新しいコントローラを作成する
    pub fn new(tid: ThreadId, sites: SharedSites) -> Self {
        Self {
            tid,
            plans: PlanStack::new(),
            sites,
            abi: None,
        }
    }

    pub fn with_abi(mut self, abi: Arc<dyn Abi>) -> Self {
        self.abi = Some(abi);
        self
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn sites(&self) -> &SharedSites {
        &self.sites
    }

    pub fn plan_stack(&self) -> &PlanStack {
        &self.plans
    }

    fn env<'a>(
        sites: &'a SharedSites,
        abi: &'a Option<Arc<dyn Abi>>,
        thread: &'a dyn ThreadState,
    ) -> PlanEnv<'a> {
        PlanEnv {
            thread,
            sites,
            abi: abi.as_deref(),
        }
    }

    /// プランを検証してスタックに積む
    ///
    /// `abort_other_plans` が真なら、ベースプラン以外のプランを先に捨てます。
    /// 検証に失敗したプランは積まれずに破棄されます。
    pub fn queue_thread_plan(
        &mut self,
        thread: &dyn ThreadState,
        plan: Plan,
        abort_other_plans: bool,
    ) -> Result<PlanId, PlanError> {
        if let Err(e) = plan.validate() {
            tracing::debug!("Not queuing invalid {} plan: {}", plan.kind(), e);
            return Err(e);
        }
        if abort_other_plans {
            self.plans.discard_user_plans();
        }
        let env = Self::env(&self.sites, &self.abi, thread);
        Ok(self.plans.push(env, plan))
    }

    /// `frame_index` のフレームから呼び出し元へ戻る
    pub fn step_out(
        &mut self,
        thread: &dyn ThreadState,
        frame_index: usize,
        options: StepOutOptions,
    ) -> Result<PlanId, PlanError> {
        let plan = {
            let env = Self::env(&self.sites, &self.abi, thread);
            StepOutPlan::new(env, frame_index, options)
        };
        self.queue_thread_plan(thread, plan.into(), false)
    }

    /// 1命令進める
    pub fn step_instruction(
        &mut self,
        thread: &dyn ThreadState,
        step_over: bool,
        stop_others: bool,
    ) -> Result<PlanId, PlanError> {
        let plan = {
            let env = Self::env(&self.sites, &self.abi, thread);
            StepInstructionPlan::new(env, step_over, stop_others)
        };
        self.queue_thread_plan(thread, plan.into(), false)
    }

    /// PCが範囲を出るまで進める（呼び出しはまたぐ）
    pub fn step_over_range(
        &mut self,
        thread: &dyn ThreadState,
        ranges: &[AddressRange],
        options: StepRangeOptions,
    ) -> Result<PlanId, PlanError> {
        let Some((first, rest)) = ranges.split_first() else {
            return Err(PlanError::EmptyRange(AddressRange::new(0, 0)));
        };
        let plan = {
            let env = Self::env(&self.sites, &self.abi, thread);
            let mut plan = StepRangePlan::new(env, *first, options);
            for range in rest {
                plan.add_range(*range);
            }
            plan
        };
        self.queue_thread_plan(thread, plan.into(), false)
    }

    /// 再開方法を決める
    pub fn will_resume(&mut self, thread: &dyn ThreadState) -> ResumeRequest {
        let env = Self::env(&self.sites, &self.abi, thread);
        let disposition = self.plans.will_resume(env);
        tracing::trace!(
            "Thread {} resumes: {} (stop_others={})",
            self.tid,
            disposition.state,
            disposition.stop_others
        );
        ResumeRequest {
            tid: self.tid,
            state: disposition.state,
            stop_others: disposition.stop_others,
        }
    }

    /// スレッドの直近の停止を判定する
    pub fn should_stop(&mut self, thread: &dyn ThreadState) -> StopDecision {
        let event = thread.stop_info().unwrap_or_else(|| {
            StopInfo::new(StopReason::None, thread.pc().unwrap_or_default())
        });
        self.should_stop_for(thread, &event)
    }

    /// 指定された停止を判定する
    pub fn should_stop_for(&mut self, thread: &dyn ThreadState, event: &StopInfo) -> StopDecision {
        let env = Self::env(&self.sites, &self.abi, thread);
        self.plans.should_stop(env, event)
    }

    /// ベースプラン以外をすべて捨てる
    pub fn discard_plans(&mut self) -> usize {
        self.plans.discard_user_plans()
    }

    /// スレッドが消えたときに呼ぶ
    pub fn destroy(&mut self) {
        self.plans.discard_all();
    }

    /// 直近の停止で完了したプラン
    pub fn completed_plans(&self) -> &[CompletedPlan] {
        self.plans.completed_plans()
    }

    /// 直近の停止で取り出された戻り値
    pub fn return_value(&self) -> Option<&ReturnValue> {
        self.plans.return_value()
    }

    pub fn description(&self, level: DescriptionLevel) -> String {
        self.plans.description(level)
    }
}
