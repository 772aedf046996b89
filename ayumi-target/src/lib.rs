//! Ayumi ターゲットモデル
//!
//! このクレートは、ステップ実行エンジンが問い合わせるターゲット側のモデルを提供します。
//! スタック識別子とフレーム、停止理由、レジスタ、ブレークポイントサイトの保持、
//! リモートスタブで記述されたスレッドのアダプタ（バインディングシム）などを扱います。

pub mod breakpoint;
pub mod cache;
pub mod memory;
pub mod registers;
pub mod remote;
pub mod sim;
pub mod site;
pub mod stack;
pub mod stop;
pub mod thread;

pub use breakpoint::SoftwareBreakpoint;
pub use cache::{StopId, VersionedCache};
pub use memory::MemoryAccess;
pub use registers::Register;
pub use remote::{QueueId, QueueInfo, QueueKind, RemoteStub, RemoteThread, ResumeActions, SystemRuntime};
pub use site::{
    Breakpoint, BreakpointError, BreakpointHandle, BreakpointId, BreakpointSite, BreakpointSiteList,
    BreakpointSites, SharedSites, SiteId,
};
pub use stack::{AddressRange, Frame, FrameComparison, FunctionInfo, StackId, TypeKind, ValueType};
pub use stop::{ResumeState, StopInfo, StopReason};
pub use thread::{ThreadId, ThreadSettings, ThreadState};

/// ターゲット操作の結果型
pub type Result<T> = anyhow::Result<T>;
