//! アドレス範囲ステップ
//!
//! PCが指定された範囲を出るまで1命令ずつ進めます。
//! 範囲内で関数呼び出しに入ったら、その関数から出るプランに任せます。
//! インラインブロックを通り抜けるときにも使われます。

use super::{
    format_location, DescriptionLevel, LazyBool, PlanContext, PlanCore, PlanEnv, PlanKind,
    StepFlags, StepOutOptions, StepOutPlan, StopHerePolicy, ThreadPlan, Vote,
};
use crate::errors::PlanError;
use ayumi_target::{
    AddressRange, FrameComparison, ResumeState, StackId, StopInfo, StopReason, ThreadState,
};

/// 範囲ステッププランの作成オプション
#[derive(Debug, Clone, Copy)]
pub struct StepRangeOptions {
    pub stop_others: bool,
    pub avoid_no_debug: LazyBool,
}

impl Default for StepRangeOptions {
    fn default() -> Self {
        Self {
            stop_others: true,
            avoid_no_debug: LazyBool::Calculate,
        }
    }
}

#[derive(Debug)]
pub struct StepRangePlan {
    core: PlanCore,
    ranges: Vec<AddressRange>,
    start_id: Option<StackId>,
    start_function: Option<String>,
    stop_others: bool,
    flags: StepFlags,
    error: Option<PlanError>,
}

impl StepRangePlan {
    pub fn new(env: PlanEnv<'_>, range: AddressRange, options: StepRangeOptions) -> Self {
        let thread = env.thread;
        let frame = thread.frame_at(0);
        let error = if frame.is_none() {
            Some(PlanError::FrameNotFound { index: 0 })
        } else if range.start >= range.end {
            Some(PlanError::EmptyRange(range))
        } else {
            None
        };

        Self {
            core: PlanCore::new("Step range", Vote::NoOpinion, Vote::NoOpinion),
            ranges: vec![range],
            start_id: frame.as_ref().map(|f| f.stack_id),
            start_function: frame
                .as_ref()
                .and_then(|f| f.function_name())
                .map(str::to_string),
            stop_others: options.stop_others,
            flags: StepFlags {
                avoid_no_debug: options
                    .avoid_no_debug
                    .resolve(thread.settings().step_in_avoids_no_debug),
            },
            error,
        }
    }

    /// 範囲を追加する（不連続なインラインブロック用）
    pub fn add_range(&mut self, range: AddressRange) {
        self.ranges.push(range);
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    fn in_range(&self, pc: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(pc))
    }

    /// 呼び出された関数から戻るための子プランを予約する
    fn queue_step_out(&self, ctx: &mut PlanContext<'_>) -> bool {
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
                ctx.queue(plan.into());
                true
            }
            Err(e) => {
                tracing::debug!("Could not step out of the called function: {}", e);
                false
            }
        }
    }
}

impl ThreadPlan for StepRangePlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn kind(&self) -> PlanKind {
        PlanKind::StepRange
    }

    fn validate(&self) -> Result<(), PlanError> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
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

        let (Some(frame), Some(start_id)) = (ctx.thread().frame_at(0), self.start_id) else {
            self.core.set_complete(false);
            return true;
        };

        match frame.stack_id.compare_to(&start_id) {
            FrameComparison::Younger => {
                if self.queue_step_out(ctx) {
                    return false;
                }
                self.core.set_complete(false);
                true
            }
            FrameComparison::Older => {
                tracing::debug!("Stepped out of the range's frame");
                self.core.set_complete(true);
                true
            }
            FrameComparison::Same => {
                if self.in_range(frame.pc) {
                    return false;
                }
                if self.flags.avoid_no_debug && !frame.has_debug_info {
                    tracing::debug!("Left the range into code without debug info");
                }
                self.core.set_complete(true);
                true
            }
        }
    }

    fn is_stale(&self, ctx: &PlanContext<'_>) -> bool {
        let (Some(frame), Some(start_id)) = (ctx.thread().frame_at(0), self.start_id) else {
            return true;
        };
        frame.stack_id.compare_to(&start_id) == FrameComparison::Older
    }

    fn description(&self, level: DescriptionLevel) -> String {
        if level == DescriptionLevel::Brief {
            return "step through range".to_string();
        }
        let ranges = self
            .ranges
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Stepping through range {} in {}",
            ranges,
            format_location(self.start_function.as_deref(), None)
        )
    }
}
