//! ベースプラン
//!
//! スタックの一番下に常にいるプラン。
//! 上のプランが説明しなかった停止をすべて引き受け、ユーザーに見せるかどうかを決めます。

use super::{DescriptionLevel, PlanContext, PlanCore, PlanKind, ThreadPlan, Vote};
use crate::errors::PlanError;
use ayumi_target::{BreakpointSites, ResumeState, StopInfo, StopReason, ThreadState};

#[derive(Debug)]
pub struct BasePlan {
    core: PlanCore,
}

impl BasePlan {
    pub fn new() -> Self {
        Self {
            core: PlanCore::new("base plan", Vote::Yes, Vote::Yes),
        }
    }
}

impl Default for BasePlan {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPlan for BasePlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn kind(&self) -> PlanKind {
        PlanKind::Base
    }

    fn validate(&self) -> Result<(), PlanError> {
        Ok(())
    }

    fn run_state(&self) -> ResumeState {
        ResumeState::Running
    }

    fn stop_others(&self) -> bool {
        false
    }

    fn explains_stop(&mut self, _ctx: &mut PlanContext<'_>, _event: &StopInfo) -> bool {
        true
    }

    fn should_stop(&mut self, ctx: &mut PlanContext<'_>, event: &StopInfo) -> bool {
        match &event.reason {
            StopReason::None | StopReason::Trace | StopReason::PlanComplete => false,
            StopReason::Breakpoint(site_id) => {
                let tid = ctx.thread().tid();
                let sites = ctx.sites().lock();
                let Some(site) = sites.find_site_by_id(*site_id) else {
                    tracing::debug!("Stopped at unknown breakpoint site {}", site_id);
                    return true;
                };
                // 内部ブレークポイントだけのサイトなら黙って再開する
                let user_owner = site
                    .owners()
                    .iter()
                    .filter_map(|id| sites.breakpoint(*id))
                    .any(|bp| !bp.internal && bp.enabled && bp.applies_to(tid));
                if !user_owner {
                    tracing::trace!("Breakpoint site {} has only internal owners", site_id);
                }
                user_owner
            }
            _ => true,
        }
    }

    fn mischief_managed(&mut self, _ctx: &mut PlanContext<'_>) -> bool {
        false
    }

    fn description(&self, _level: DescriptionLevel) -> String {
        "base plan".to_string()
    }
}
