//! ステップアウトのシナリオテスト

mod common;

use ayumi_core::{
    DelegateKind, LazyBool, PlanError, PlanKind, ScalarValue, StepFlags, StepOutOptions,
    StopHerePolicy, ThreadPlan, Vote,
};
use ayumi_target::sim::CallOptions;
use ayumi_target::{
    AddressRange, BreakpointSites, Frame, FrameComparison, ResumeState, StopReason, ThreadState,
};
use common::{no_debug, returns_i32, Session, TID};
use std::sync::Arc;

#[test]
fn test_step_out_returns_to_caller_with_value() {
    let mut s = Session::new();
    s.thread.call("compute", CallOptions::default());
    s.thread.call("leaf", returns_i32());
    let return_addr = s.caller_pc(1);

    s.controller
        .step_out(&s.thread, 0, StepOutOptions::default())
        .expect("Step out should be queued");

    // 戻りアドレスにこのスレッド専用の内部ブレークポイントが置かれる
    {
        let list = s.list.lock();
        let bp = list.all().next().expect("Return breakpoint should exist");
        assert_eq!(bp.address, return_addr);
        assert!(bp.internal);
        assert_eq!(bp.thread, Some(TID));
        assert_eq!(bp.kind.as_deref(), Some("step-out"));
    }

    let decision = s.resume(|t| t.ret(Some(42))).expect("Thread should stop");
    assert!(decision.should_stop);
    assert_eq!(decision.report, Vote::Yes);

    assert_eq!(s.thread.depth(), 2);
    assert_eq!(s.thread.current_pc(), return_addr);
    let value = s.controller.return_value().expect("Return value should be captured");
    assert_eq!(value.value, ScalarValue::Signed(42));

    // 完了したら内部ブレークポイントは解放される
    assert_eq!(s.breakpoint_count(), 0);
    assert!(s.list.lock().site_at(return_addr).is_none());

    let completed = s.controller.completed_plans();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].kind, PlanKind::StepOut);
    assert!(completed[0].succeeded);
    assert_eq!(s.controller.plan_stack().len(), 1);
}

#[test]
fn test_recursive_hit_of_return_address_keeps_running() {
    let mut s = Session::new();
    s.thread.call("fact", returns_i32());
    s.thread.call("fact", returns_i32());
    let return_addr = s.caller_pc(1);

    s.controller
        .step_out(&s.thread, 0, StepOutOptions::default())
        .expect("Step out should be queued");

    // 内側でさらに再帰し、同じ戻りアドレスに戻ってくる
    let decision = s
        .resume(|t| {
            t.call("fact", returns_i32());
            t.ret(Some(1));
        })
        .expect("Thread should hit the return breakpoint");
    assert_eq!(s.thread.current_pc(), return_addr);
    assert!(!decision.should_stop, "Deeper recursion must not complete the step out");
    assert_eq!(s.controller.plan_stack().len(), 2);
    assert_eq!(s.breakpoint_count(), 1);

    let decision = s.resume(|t| t.ret(Some(6))).expect("Thread should stop");
    assert!(decision.should_stop);
    assert_eq!(s.thread.depth(), 2);
    assert_eq!(
        s.controller.return_value().map(|v| v.value),
        Some(ScalarValue::Signed(6))
    );
    assert_eq!(s.breakpoint_count(), 0);
}

#[test]
fn test_step_out_into_no_debug_frame_steps_further() {
    let mut s = Session::new();
    s.thread.call("libfoo", no_debug());
    s.thread.call("callback", returns_i32());

    s.controller
        .step_out(&s.thread, 0, StepOutOptions::default())
        .expect("Step out should be queued");

    let decision = s.resume(|t| t.ret(Some(7))).expect("Thread should stop");
    assert!(!decision.should_stop, "Frames without debug info are avoided");

    let plans: Vec<_> = s.controller.plan_stack().plans().collect();
    assert_eq!(plans.len(), 3);
    let parent = plans[1].as_step_out().expect("User plan should be a step out");
    assert_eq!(parent.delegate_kind(), DelegateKind::StepOutFurther);
    assert!(plans[2].is_private());
    assert_eq!(plans[2].kind(), PlanKind::StepOut);

    let decision = s.resume(|t| t.ret(None)).expect("Thread should stop");
    assert!(decision.should_stop);
    assert_eq!(s.thread.depth(), 1);
    assert_eq!(
        s.controller.return_value().map(|v| v.value),
        Some(ScalarValue::Signed(7))
    );
    assert_eq!(s.controller.plan_stack().len(), 1);
    assert_eq!(s.breakpoint_count(), 0);
}

#[test]
fn test_step_out_can_stop_in_no_debug_frame_when_allowed() {
    let mut s = Session::new();
    s.thread.call("libfoo", no_debug());
    s.thread.call("callback", CallOptions::default());

    let options = StepOutOptions {
        avoid_no_debug: LazyBool::No,
        ..StepOutOptions::default()
    };
    s.controller
        .step_out(&s.thread, 0, options)
        .expect("Step out should be queued");

    let decision = s.resume(|t| t.ret(None)).expect("Thread should stop");
    assert!(decision.should_stop);
    assert_eq!(s.thread.depth(), 2);
}

#[test]
fn test_custom_stop_here_policy_vetoes_frame() {
    let mut s = Session::new();
    s.thread.call("compute", CallOptions::default());
    s.thread.call("leaf", CallOptions::default());

    let options = StepOutOptions {
        stop_here: StopHerePolicy::Custom(Arc::new(
            |frame: &Frame, _: FrameComparison, _: StepFlags| {
                frame.function_name() != Some("compute")
            },
        )),
        ..StepOutOptions::default()
    };
    s.controller
        .step_out(&s.thread, 0, options)
        .expect("Step out should be queued");

    let decision = s.resume(|t| t.ret(None)).expect("Thread should stop");
    assert!(!decision.should_stop);

    let decision = s.resume(|t| t.ret(None)).expect("Thread should stop");
    assert!(decision.should_stop);
    assert_eq!(
        s.thread.frame_at(0).and_then(|f| f.function_name().map(str::to_string)),
        Some("main".to_string())
    );
}

#[test]
fn test_shared_site_completes_plan_but_keeps_user_stop() {
    let mut s = Session::new();
    s.thread.call("compute", CallOptions::default());
    s.thread.call("leaf", returns_i32());
    let return_addr = s.caller_pc(1);
    let user_bp = s.user_breakpoint(return_addr);

    s.controller
        .step_out(&s.thread, 0, StepOutOptions::default())
        .expect("Step out should be queued");
    assert_eq!(
        s.list.lock().site_at(return_addr).map(|site| site.owner_count()),
        Some(2)
    );

    let decision = s.resume(|t| t.ret(Some(3))).expect("Thread should stop");
    assert!(decision.should_stop);

    // ステップアウトは完了扱いで片付けられる
    let completed = s.controller.completed_plans();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].kind, PlanKind::StepOut);
    assert_eq!(
        s.controller.return_value().map(|v| v.value),
        Some(ScalarValue::Signed(3))
    );
    assert_eq!(s.controller.plan_stack().len(), 1);

    // ユーザーブレークポイントだけが残る
    let list = s.list.lock();
    let site = list.site_at(return_addr).expect("User site should remain");
    assert_eq!(site.owner_count(), 1);
    assert!(site.is_owned_by(user_bp));
    assert!(site.is_inserted());
}

#[test]
fn test_user_breakpoint_interrupts_step_out() {
    let mut s = Session::new();
    s.thread.call("compute", CallOptions::default());
    s.thread.call("leaf", returns_i32());
    let return_addr = s.caller_pc(1);

    s.controller
        .step_out(&s.thread, 0, StepOutOptions::default())
        .expect("Step out should be queued");

    let helper = s.thread.entry_address("helper");
    s.user_breakpoint(helper);

    let decision = s
        .resume(|t| t.call("helper", CallOptions::default()))
        .expect("Thread should stop at the user breakpoint");
    assert!(decision.should_stop);
    assert!(s.controller.completed_plans().is_empty());

    // 止まっている間は戻りアドレスのブレークポイントは外されている
    assert_eq!(s.controller.plan_stack().len(), 2);
    assert!(!s
        .list
        .lock()
        .site_at(return_addr)
        .expect("Return site should remain")
        .is_inserted());

    let decision = s
        .resume(|t| {
            t.ret(None);
            t.ret(Some(5));
        })
        .expect("Thread should stop");
    assert!(decision.should_stop);
    assert_eq!(s.thread.current_pc(), return_addr);
    assert_eq!(
        s.controller.return_value().map(|v| v.value),
        Some(ScalarValue::Signed(5))
    );
}

#[test]
fn test_step_out_of_innermost_inline_frame_steps_through_range() {
    let mut s = Session::new();
    let pc = s.thread.current_pc();
    s.thread
        .enter_inline("helper", vec![AddressRange::new(pc, pc + 8)]);

    s.controller
        .step_out(&s.thread, 0, StepOutOptions::default())
        .expect("Step out should be queued");

    // インラインフレームには戻りアドレスがないのでブレークポイントは使わない
    assert_eq!(s.breakpoint_count(), 0);
    let plans: Vec<_> = s.controller.plan_stack().plans().collect();
    assert_eq!(plans.len(), 3);
    assert_eq!(
        plans[1].as_step_out().map(|p| p.delegate_kind()),
        Some(DelegateKind::StepThroughInline)
    );
    assert_eq!(plans[2].kind(), PlanKind::StepRange);
    assert!(plans[2].is_private());

    let decision = s.resume(|t| t.step_instruction()).expect("Thread should stop");
    assert!(!decision.should_stop);

    let decision = s.resume(|t| t.step_instruction()).expect("Thread should stop");
    assert!(decision.should_stop);
    assert_eq!(s.thread.depth(), 1);
    assert_eq!(s.controller.plan_stack().len(), 1);
}

#[test]
fn test_step_out_of_inline_frame_from_callee() {
    let mut s = Session::new();
    let pc = s.thread.current_pc();
    s.thread
        .enter_inline("helper", vec![AddressRange::new(pc, pc + 0x20)]);
    s.thread.call("leaf", CallOptions::default());

    s.controller
        .step_out(&s.thread, 1, StepOutOptions::default())
        .expect("Step out should be queued");
    assert_eq!(s.breakpoint_count(), 1);
    assert_eq!(
        s.controller
            .plan_stack()
            .plans()
            .nth(1)
            .and_then(|p| p.as_step_out())
            .map(|p| p.delegate_kind()),
        Some(DelegateKind::StepOutToInline)
    );

    // leafから戻るとインラインブロックを抜ける範囲ステップに切り替わる
    let decision = s.resume(|t| t.ret(None)).expect("Thread should stop");
    assert!(!decision.should_stop);
    assert_eq!(s.breakpoint_count(), 0);
    assert_eq!(
        s.controller.plan_stack().top().map(|p| p.kind()),
        Some(PlanKind::StepRange)
    );

    let mut stopped = false;
    for _ in 0..16 {
        let decision = s.resume(|t| t.step_instruction()).expect("Thread should stop");
        if decision.should_stop {
            stopped = true;
            break;
        }
    }
    assert!(stopped, "Stepping through the inlined block should finish");
    assert_eq!(s.thread.depth(), 1);
    assert!(!s.thread.frame_at(0).expect("Frame should exist").inlined);
}

#[test]
fn test_step_out_of_outermost_frame_is_rejected() {
    let mut s = Session::new();
    let result = s.controller.step_out(&s.thread, 0, StepOutOptions::default());
    assert_eq!(result, Err(PlanError::FrameNotFound { index: 1 }));
    assert_eq!(s.controller.plan_stack().len(), 1);
    assert_eq!(s.breakpoint_count(), 0);
}

#[test]
fn test_inline_step_out_continues_after_shared_site_stop() {
    let mut s = Session::new();
    let pc = s.thread.current_pc();
    s.thread
        .enter_inline("helper", vec![AddressRange::new(pc, pc + 0x20)]);
    s.thread.call("leaf", returns_i32());
    let return_addr = s.caller_pc(1);
    s.user_breakpoint(return_addr);

    s.controller
        .step_out(&s.thread, 1, StepOutOptions::default())
        .expect("Step out should be queued");

    // leafの戻り先はユーザーブレークポイントと共有なので、ユーザーの停止として止まる
    let decision = s.resume(|t| t.ret(Some(1))).expect("Thread should stop");
    assert!(decision.should_stop);
    let completed = s.controller.completed_plans();
    assert_eq!(completed.len(), 1);
    assert!(completed[0].private);

    // 内側のステップアウトが片付いたので、インラインブロックを抜ける範囲ステップに切り替わっている
    let plans: Vec<_> = s.controller.plan_stack().plans().collect();
    assert_eq!(plans.len(), 3);
    assert_eq!(
        plans[1].as_step_out().map(|p| p.delegate_kind()),
        Some(DelegateKind::StepThroughInline)
    );
    assert_eq!(plans[2].kind(), PlanKind::StepRange);
    assert!(plans[2].is_private());

    let request = s.controller.will_resume(&s.thread);
    assert_eq!(request.state, ResumeState::Stepping);

    // インラインブロック内の別のユーザーブレークポイントは引き受けない
    let user_addr = return_addr + 4;
    s.user_breakpoint(user_addr);
    let site = s
        .list
        .lock()
        .site_at(user_addr)
        .map(|site| site.id())
        .expect("User site should exist");
    s.thread.set_pc(user_addr);
    s.thread.set_stop(StopReason::Breakpoint(site));
    let decision = s.controller.should_stop(&s.thread);
    assert!(decision.should_stop, "User breakpoints must be reported");
    assert_eq!(s.controller.plan_stack().len(), 3);

    let mut stopped = false;
    for _ in 0..16 {
        let decision = s.resume(|t| t.step_instruction()).expect("Thread should stop");
        if decision.should_stop {
            stopped = true;
            break;
        }
    }
    assert!(stopped, "Stepping through the inlined block should finish");
    assert_eq!(s.thread.depth(), 1);
    assert!(!s.thread.frame_at(0).expect("Frame should exist").inlined);
    assert_eq!(s.controller.plan_stack().len(), 1);
}
