//! 模擬ターゲット上でコントローラを動かすテスト用の土台

#![allow(dead_code)]

use ayumi_core::{StopDecision, SysVX86_64, ThreadController};
use ayumi_target::sim::{CallOptions, SimMemory, SimThread};
use ayumi_target::{
    BreakpointId, BreakpointSiteList, BreakpointSites, SharedSites, TypeKind, ValueType,
};
use parking_lot::Mutex;
use std::sync::Arc;

pub const TID: u64 = 0x1001;

pub struct Session {
    pub thread: SimThread,
    pub list: Arc<Mutex<BreakpointSiteList<SimMemory>>>,
    pub controller: ThreadController,
}

impl Session {
    /// `main` で止まっているスレッドのセッションを作成する
    pub fn new() -> Self {
        let list = BreakpointSiteList::new(SimMemory::new()).into_shared();
        let sites: SharedSites = list.clone();
        let controller = ThreadController::new(TID, sites).with_abi(Arc::new(SysVX86_64));
        Self {
            thread: SimThread::new(TID, "main"),
            list,
            controller,
        }
    }

    pub fn sites(&self) -> SharedSites {
        self.list.clone()
    }

    /// 再開し、`advance` でターゲットを進め、停止すれば判定する
    ///
    /// ターゲットが止まらなかった場合は `None` を返します。
    pub fn resume(&mut self, advance: impl FnOnce(&mut SimThread)) -> Option<StopDecision> {
        let request = self.controller.will_resume(&self.thread);
        advance(&mut self.thread);
        let stop = {
            let list = self.list.lock();
            self.thread.settle(&*list, request.state)
        };
        stop.map(|_| self.controller.should_stop(&self.thread))
    }

    /// ユーザーブレークポイントを設定する
    pub fn user_breakpoint(&self, address: u64) -> BreakpointId {
        self.list
            .lock()
            .create_breakpoint(address, false)
            .expect("Failed to create user breakpoint")
    }

    /// 戻り先で止まっているはずのアドレス（呼び出し元フレームのPC）
    pub fn caller_pc(&self, index: usize) -> u64 {
        use ayumi_target::ThreadState;
        self.thread
            .frame_at(index)
            .expect("Frame should exist")
            .pc
    }

    pub fn breakpoint_count(&self) -> usize {
        self.list.lock().count()
    }
}

pub fn returns_i32() -> CallOptions {
    CallOptions {
        no_debug: false,
        return_type: Some(ValueType::new("i32", TypeKind::Integer { signed: true }, 4)),
    }
}

pub fn no_debug() -> CallOptions {
    CallOptions {
        no_debug: true,
        return_type: None,
    }
}
