//! プランスタック
//!
//! スレッドごとのプランを積み、停止のたびに判定を行います。
//!
//! 判定の流れ:
//!
//! 1. 上から順に `explains_stop` を問い合わせ、最初に説明したプランを選ぶ
//! 2. そのプランの `should_stop` を聞き、子プランが予約されたら積んで再開する
//! 3. `mischief_managed` が真なら取り除き、内部プランだったら判定を親に渡す
//! 4. 止まると決まったら、完了済みのプランを片付け、古くなったプランを捨てる
//!    片付けた内部プランの完了は親に伝え、親が次の子プランを積めるようにする
//!
//! 古いプランの掃除は停止が決まったときだけ行います。
//! 戻りアドレスに着いた直後のステップアウトは古いと判定されますが、まだ完了処理が必要です。

use super::{
    BasePlan, DescriptionLevel, Plan, PlanContext, PlanEnv, PlanId, PlanKind, ThreadPlan, Vote,
};
use crate::abi::ReturnValue;
use ayumi_target::{ResumeState, StopInfo};
use std::collections::HashSet;

/// 停止判定の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopDecision {
    pub should_stop: bool,
    /// 判定したプランの報告投票
    pub report: Vote,
}

/// 再開時の動作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeDisposition {
    pub state: ResumeState,
    pub stop_others: bool,
}

/// 完了して取り除かれたプランの記録
#[derive(Debug, Clone)]
pub struct CompletedPlan {
    pub id: PlanId,
    pub kind: PlanKind,
    pub private: bool,
    pub succeeded: bool,
    pub description: String,
    pub return_value: Option<ReturnValue>,
}

impl CompletedPlan {
    fn record(plan: &Plan) -> Self {
        Self {
            id: plan.id(),
            kind: plan.kind(),
            private: plan.is_private(),
            succeeded: plan.core().succeeded(),
            description: plan.description(DescriptionLevel::Full),
            return_value: plan.return_value().cloned(),
        }
    }
}

#[derive(Debug)]
pub struct PlanStack {
    /// 先頭がベースプラン
    plans: Vec<Plan>,
    finished: HashSet<PlanId>,
    completed: Vec<CompletedPlan>,
}

impl Default for PlanStack {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanStack {
    pub fn new() -> Self {
        Self {
            plans: vec![Plan::Base(BasePlan::new())],
            finished: HashSet::new(),
            completed: Vec::new(),
        }
    }

    /// プランを積み、そのプランが予約した子プランも続けて積む
    pub fn push(&mut self, env: PlanEnv<'_>, plan: Plan) -> PlanId {
        Self::push_into(&mut self.plans, &self.finished, env, plan)
    }

    fn push_into(
        plans: &mut Vec<Plan>,
        finished: &HashSet<PlanId>,
        env: PlanEnv<'_>,
        plan: Plan,
    ) -> PlanId {
        let id = plan.id();
        tracing::debug!(
            "Pushing plan {} ({}): {}",
            id,
            plan.kind(),
            plan.description(DescriptionLevel::Full)
        );
        plans.push(plan);

        let queued = {
            let mut ctx = PlanContext::new(env, finished);
            if let Some(top) = plans.last_mut() {
                top.did_push(&mut ctx);
            }
            ctx.take_queued()
        };
        for child in queued {
            Self::push_into(plans, finished, env, child);
        }
        id
    }

    /// 一番上のプラン
    pub fn top(&self) -> Option<&Plan> {
        self.plans.last()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// スレッド破棄後は空になる
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// 下から上へ
    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.plans.iter()
    }

    /// 一番上のプランが完了していれば取り除く
    pub fn pop_if_top_complete(&mut self, env: PlanEnv<'_>) -> Option<PlanId> {
        if self.plans.len() <= 1 {
            return None;
        }
        let managed = {
            let mut ctx = PlanContext::new(env, &self.finished);
            self.plans.last_mut()?.mischief_managed(&mut ctx)
        };
        if !managed {
            return None;
        }
        let plan = self.plans.pop()?;
        Some(Self::retire(&mut self.finished, &mut self.completed, plan))
    }

    fn retire(
        finished: &mut HashSet<PlanId>,
        completed: &mut Vec<CompletedPlan>,
        plan: Plan,
    ) -> PlanId {
        let id = plan.id();
        tracing::debug!("Popping completed plan {} ({})", id, plan.kind());
        finished.insert(id);
        completed.push(CompletedPlan::record(&plan));
        id
    }

    /// 古くなったプランとその上のプランをすべて捨てる
    ///
    /// 捨てられたプランが持つ内部ブレークポイントはここで解放されます。
    pub fn prune_stale(&mut self, env: PlanEnv<'_>) -> usize {
        let cut = {
            let ctx = PlanContext::new(env, &self.finished);
            (1..self.plans.len()).find(|&i| self.plans[i].is_stale(&ctx))
        };
        let Some(cut) = cut else {
            return 0;
        };
        let discarded = self.plans.split_off(cut);
        for plan in &discarded {
            tracing::debug!("Discarding stale plan {} ({})", plan.id(), plan.kind());
        }
        discarded.len()
    }

    /// ベースプラン以外をすべて捨てる
    pub fn discard_user_plans(&mut self) -> usize {
        if self.plans.len() <= 1 {
            return 0;
        }
        let discarded = self.plans.split_off(1);
        tracing::debug!("Discarding {} plans", discarded.len());
        discarded.len()
    }

    /// スレッドの破棄に伴いすべてのプランを捨てる
    pub fn discard_all(&mut self) {
        let discarded = std::mem::take(&mut self.plans);
        tracing::debug!("Tearing down plan stack with {} plans", discarded.len());
    }

    /// 再開の準備をする
    ///
    /// 前回の停止で完了したプランの記録を消し、一番上のプランが望む再開方法を返します。
    pub fn will_resume(&mut self, env: PlanEnv<'_>) -> ResumeDisposition {
        self.completed.clear();

        // 親がまだ参照している子プランの完了記録だけを残す
        let held: HashSet<PlanId> = self.plans.iter().filter_map(|p| p.child_plan()).collect();
        self.finished.retain(|id| held.contains(id));

        let Some(top) = self.plans.last() else {
            return ResumeDisposition {
                state: ResumeState::Running,
                stop_others: false,
            };
        };
        let disposition = ResumeDisposition {
            state: top.run_state(),
            stop_others: top.stop_others(),
        };

        let mut ctx = PlanContext::new(env, &self.finished);
        let top_index = self.plans.len() - 1;
        for (i, plan) in self.plans.iter_mut().enumerate().rev() {
            plan.will_resume(&mut ctx, disposition.state, i == top_index);
        }
        disposition
    }

    /// 停止を判定する
    pub fn should_stop(&mut self, env: PlanEnv<'_>, event: &StopInfo) -> StopDecision {
        let explaining = {
            let mut ctx = PlanContext::new(env, &self.finished);
            let plans = &mut self.plans;
            (0..plans.len())
                .rev()
                .find(|&i| plans[i].explains_stop(&mut ctx, event))
        };
        let Some(index) = explaining else {
            tracing::debug!("No plan explains stop: {}", event.reason);
            return StopDecision {
                should_stop: true,
                report: Vote::Yes,
            };
        };
        tracing::trace!("Plan {} explains stop: {}", self.plans[index].id(), event.reason);

        let (mut should_stop, mut report) = self.decide_from(env, event, index);

        // 説明しなかったが完了しているプラン（共有サイトでの同時停止）はここで完了させる
        if !should_stop {
            if let Some(index) = self.completed_index() {
                (should_stop, report) = self.decide_from(env, event, index);
            }
        }

        if should_stop {
            self.sweep_after_stop(env, event);
        }

        tracing::debug!("Stop decision: should_stop={} report={:?}", should_stop, report);
        StopDecision {
            should_stop,
            report,
        }
    }

    /// `index` のプランから判定を始め、完了した内部プランの判定は親に渡す
    fn decide_from(&mut self, env: PlanEnv<'_>, event: &StopInfo, mut index: usize) -> (bool, Vote) {
        let Self {
            plans,
            finished,
            completed,
        } = self;

        loop {
            let mut ctx = PlanContext::new(env, finished);
            let should_stop = plans[index].should_stop(&mut ctx, event);
            let report = plans[index].core().stop_vote();

            let queued = ctx.take_queued();
            if !queued.is_empty() {
                drop(ctx);
                for child in queued {
                    Self::push_into(plans, finished, env, child);
                }
                return (false, report);
            }

            if !plans[index].mischief_managed(&mut ctx) {
                return (should_stop, report);
            }
            if should_stop {
                plans[index].will_stop(&mut ctx);
            }
            drop(ctx);

            // 完了したプランより上に残った子は不要
            let orphans = plans.split_off(index + 1);
            if !orphans.is_empty() {
                tracing::debug!("Discarding {} plans above a completed plan", orphans.len());
            }
            drop(orphans);

            let Some(plan) = plans.pop() else {
                return (should_stop, report);
            };
            let private = plan.is_private();
            Self::retire(finished, completed, plan);

            if !private || index == 0 {
                return (should_stop, report);
            }
            index -= 1;
        }
    }

    fn completed_index(&self) -> Option<usize> {
        self.plans
            .iter()
            .rposition(|p| p.kind() != PlanKind::Base && p.core().is_complete())
    }

    /// 停止が決まった後の後片付け
    fn sweep_after_stop(&mut self, env: PlanEnv<'_>, event: &StopInfo) {
        // 完了済みだがまだ取り除かれていないプラン（共有サイトでの同時停止など）
        while let Some(index) = self.completed_index() {
            let managed = {
                let mut ctx = PlanContext::new(env, &self.finished);
                self.plans[index].mischief_managed(&mut ctx)
            };
            self.plans.truncate(index + 1);
            let Some(plan) = self.plans.pop() else {
                break;
            };
            if !managed {
                continue;
            }
            let private = plan.is_private();
            let id = Self::retire(&mut self.finished, &mut self.completed, plan);
            if private && index > 1 && self.plans[index - 1].child_plan() == Some(id) {
                self.resume_parent(env, event, index - 1);
            }
        }

        self.prune_stale(env);

        let mut ctx = PlanContext::new(env, &self.finished);
        if let Some(top) = self.plans.last_mut() {
            top.will_stop(&mut ctx);
        }
    }

    /// 子の完了を親に伝え、親が予約した次の子プランを積む
    ///
    /// 停止するという判定はすでに決まっているので、親の判定結果は使いません。
    fn resume_parent(&mut self, env: PlanEnv<'_>, event: &StopInfo, index: usize) {
        let Self { plans, finished, .. } = self;
        let queued = {
            let mut ctx = PlanContext::new(env, finished);
            plans[index].should_stop(&mut ctx, event);
            ctx.take_queued()
        };
        for child in queued {
            Self::push_into(plans, finished, env, child);
        }
    }

    /// 直近の停止で完了したプラン（古い順）
    pub fn completed_plans(&self) -> &[CompletedPlan] {
        &self.completed
    }

    /// 直近の停止で取り出された戻り値
    pub fn return_value(&self) -> Option<&ReturnValue> {
        self.completed
            .iter()
            .rev()
            .find_map(|p| p.return_value.as_ref())
    }

    /// スタックの説明（上から順）
    pub fn description(&self, level: DescriptionLevel) -> String {
        if level == DescriptionLevel::Brief {
            return self
                .plans
                .iter()
                .rev()
                .find(|p| !p.is_private())
                .map(|p| p.description(level))
                .unwrap_or_default();
        }
        self.plans
            .iter()
            .enumerate()
            .rev()
            .map(|(i, plan)| {
                let private = if plan.is_private() { " (private)" } else { "" };
                format!("  #{} [{}]{}: {}", i, plan.id(), private, plan.description(level))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StepInstructionPlan;
    use ayumi_target::sim::{CallOptions, SimMemory, SimThread};
    use ayumi_target::{BreakpointSiteList, SharedSites};

    #[test]
    fn test_finished_ids_are_dropped_on_resume() {
        let mut thread = SimThread::new(1, "main");
        let list = BreakpointSiteList::new(SimMemory::new()).into_shared();
        let sites: SharedSites = list.clone();
        let mut stack = PlanStack::new();

        {
            let env = PlanEnv {
                thread: &thread,
                sites: &sites,
                abi: None,
            };
            stack.push(env, StepInstructionPlan::new(env, true, true).into());
            stack.will_resume(env);
        }

        // 呼び出し命令を実行すると、呼び出し先から出る子プランが積まれる
        thread.call("leaf", CallOptions::default());
        let stop = thread
            .settle(&*list.lock(), ResumeState::Stepping)
            .expect("Stepping always stops");
        let decision = stack.should_stop(
            PlanEnv {
                thread: &thread,
                sites: &sites,
                abi: None,
            },
            &stop,
        );
        assert!(!decision.should_stop);
        assert_eq!(stack.len(), 3);

        let state = stack
            .will_resume(PlanEnv {
                thread: &thread,
                sites: &sites,
                abi: None,
            })
            .state;
        thread.ret(None);
        let stop = thread
            .settle(&*list.lock(), state)
            .expect("Return breakpoint should be hit");
        let env = PlanEnv {
            thread: &thread,
            sites: &sites,
            abi: None,
        };
        assert!(stack.should_stop(env, &stop).should_stop);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.finished.len(), 2);

        // 参照する親がいないので、再開時に忘れる
        stack.will_resume(env);
        assert!(stack.finished.is_empty());
    }
}
