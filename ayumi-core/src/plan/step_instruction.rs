//! 1命令ステップ

use super::{
    format_location, DescriptionLevel, LazyBool, PlanContext, PlanCore, PlanEnv, PlanKind,
    StepOutOptions, StepOutPlan, StopHerePolicy, ThreadPlan, Vote,
};
use crate::errors::PlanError;
use ayumi_target::{FrameComparison, ResumeState, StackId, StopInfo, StopReason, ThreadState};

#[derive(Debug)]
pub struct StepInstructionPlan {
    core: PlanCore,
    step_over: bool,
    stop_others: bool,
    start_pc: Option<u64>,
    start_id: Option<StackId>,
}

impl StepInstructionPlan {
    /// `step_over` が真なら、呼び出し命令は呼び出し先から戻るまで進める
    pub fn new(env: PlanEnv<'_>, step_over: bool, stop_others: bool) -> Self {
        Self {
            core: PlanCore::new("Step instruction", Vote::Yes, Vote::NoOpinion),
            step_over,
            stop_others,
            start_pc: env.thread.pc().ok(),
            start_id: env.thread.frame_at(0).map(|f| f.stack_id),
        }
    }

    pub fn step_over(&self) -> bool {
        self.step_over
    }
}

impl ThreadPlan for StepInstructionPlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn kind(&self) -> PlanKind {
        PlanKind::StepInstruction
    }

    fn validate(&self) -> Result<(), PlanError> {
        if self.start_id.is_none() {
            return Err(PlanError::FrameNotFound { index: 0 });
        }
        Ok(())
    }

    fn run_state(&self) -> ResumeState {
        ResumeState::Stepping
    }

    fn stop_others(&self) -> bool {
        self.stop_others
    }

    fn explains_stop(&mut self, _ctx: &mut PlanContext<'_>, event: &StopInfo) -> bool {
        match &event.reason {
            StopReason::Trace => true,
            reason => !reason.is_usually_unexplained(),
        }
    }

    fn should_stop(&mut self, ctx: &mut PlanContext<'_>, _event: &StopInfo) -> bool {
        if self.core.is_complete() {
            return true;
        }

        let younger = match (ctx.thread().frame_at(0), self.start_id) {
            (Some(frame), Some(start_id)) => {
                frame.stack_id.compare_to(&start_id) == FrameComparison::Younger
            }
            _ => false,
        };

        if self.step_over && younger {
            let options = StepOutOptions {
                stop_others: self.stop_others,
                stop_vote: Vote::No,
                avoid_no_debug: LazyBool::No,
                stop_here: StopHerePolicy::Always,
                ..StepOutOptions::default()
            };
            let mut plan = StepOutPlan::new(ctx.env(), 0, options);
            plan.core_mut().set_private(true);
            match plan.validate() {
                Ok(()) => {
                    tracing::debug!("Stepped into a call, stepping back out");
                    ctx.queue(plan.into());
                    return false;
                }
                Err(e) => tracing::debug!("Could not step over the call: {}", e),
            }
        }

        self.core.set_complete(true);
        true
    }

    fn is_stale(&self, ctx: &PlanContext<'_>) -> bool {
        match (ctx.thread().frame_at(0), self.start_id) {
            (Some(frame), Some(start_id)) => {
                frame.stack_id.compare_to(&start_id) == FrameComparison::Older
            }
            _ => true,
        }
    }

    fn description(&self, level: DescriptionLevel) -> String {
        if level == DescriptionLevel::Brief {
            return if self.step_over {
                "instruction step over".to_string()
            } else {
                "instruction step into".to_string()
            };
        }
        let mut s = format!(
            "Stepping one instruction past {}",
            format_location(None, self.start_pc)
        );
        if self.step_over {
            s.push_str(" stepping over calls");
        } else {
            s.push_str(" stepping into calls");
        }
        s
    }
}
