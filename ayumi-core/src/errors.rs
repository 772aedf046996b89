//! プランのエラー

use ayumi_target::AddressRange;

/// プランを構築できなかった理由
///
/// `validate()` から返され、このエラーを持つプランはスタックに積まれません。
/// どのエラーもターゲットにとっては致命的ではなく、停止は説明されないまま
/// ユーザーに報告されます。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Could not find frame {index}")]
    FrameNotFound { index: usize },

    #[error("Could not resolve the return address")]
    InvalidReturnAddress,

    #[error("Could not create return address breakpoint at 0x{address:x}: {reason}")]
    BreakpointCreation { address: u64, reason: String },

    #[error("Could not find the address ranges of the inlined block")]
    NoInlineRange,

    #[error("Empty address range {0}")]
    EmptyRange(AddressRange),

    #[error("Delegate plan is invalid: {0}")]
    DelegateInvalid(Box<PlanError>),
}
