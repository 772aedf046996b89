//! プロセス全体での再開と停止報告の集約

use crate::plan::{StopDecision, Vote};
use ayumi_target::{RemoteThread, ResumeActions, ResumeState, ThreadId};

/// スレッドごとの再開要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeRequest {
    pub tid: ThreadId,
    pub state: ResumeState,
    /// 他のスレッドを止めておきたいかどうか
    pub stop_others: bool,
}

/// 各スレッドの再開方法を決める
///
/// 他のスレッドを止めておきたいスレッドがあれば、最初のそのスレッドだけを動かし、
/// 残りは `Suspended` にします。
pub fn resume_threads(requests: &[ResumeRequest]) -> Vec<(ThreadId, ResumeState)> {
    let exclusive = requests
        .iter()
        .find(|r| r.stop_others && r.state.is_running());

    requests
        .iter()
        .map(|r| match exclusive {
            Some(ex) if ex.tid != r.tid => (r.tid, ResumeState::Suspended),
            _ => (r.tid, r.state),
        })
        .collect()
}

/// リモートスレッドの再開アクションを組み立てる
pub fn resume_actions<'a, I>(threads: I) -> ResumeActions
where
    I: IntoIterator<Item = (&'a RemoteThread, ResumeState)>,
{
    let mut actions = ResumeActions::default();
    for (thread, state) in threads {
        thread.will_resume(state, &mut actions);
    }
    actions
}

/// 停止をユーザーに報告するかどうか
///
/// 止まると判断したスレッドの投票だけを数えます。
/// 1つでも `Yes` があれば報告し、`No` だけなら報告しません。
/// 意見なしの場合は報告します。
pub fn should_report_stop(decisions: &[StopDecision]) -> bool {
    let mut result = Vote::NoOpinion;
    for decision in decisions.iter().filter(|d| d.should_stop) {
        match decision.report {
            Vote::Yes => return true,
            Vote::No => result = Vote::No,
            Vote::NoOpinion => {}
        }
    }

    if decisions.iter().all(|d| !d.should_stop) {
        return false;
    }
    result != Vote::No
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tid: ThreadId, state: ResumeState, stop_others: bool) -> ResumeRequest {
        ResumeRequest {
            tid,
            state,
            stop_others,
        }
    }

    #[test]
    fn test_stop_others_suspends_siblings() {
        let requests = [
            request(1, ResumeState::Running, false),
            request(2, ResumeState::Stepping, true),
            request(3, ResumeState::Running, false),
        ];
        let states = resume_threads(&requests);
        assert_eq!(
            states,
            vec![
                (1, ResumeState::Suspended),
                (2, ResumeState::Stepping),
                (3, ResumeState::Suspended),
            ]
        );
    }

    #[test]
    fn test_all_threads_run_without_stop_others() {
        let requests = [
            request(1, ResumeState::Running, false),
            request(2, ResumeState::Stepping, false),
        ];
        let states = resume_threads(&requests);
        assert_eq!(states[0], (1, ResumeState::Running));
        assert_eq!(states[1], (2, ResumeState::Stepping));
    }

    #[test]
    fn test_report_votes() {
        let stop = |report| StopDecision {
            should_stop: true,
            report,
        };
        let run = StopDecision {
            should_stop: false,
            report: Vote::Yes,
        };

        assert!(should_report_stop(&[stop(Vote::No), stop(Vote::Yes)]));
        assert!(!should_report_stop(&[stop(Vote::No), run]));
        assert!(should_report_stop(&[stop(Vote::NoOpinion)]));
        assert!(!should_report_stop(&[run]));
    }
}
