//! リモートスタブで記述されたスレッドのバインディング
//!
//! gdb-remoteのスタブから得られる情報（停止応答、レジスタ、ディスパッチキュー）を
//! ステップ実行エンジンが問い合わせる [`ThreadState`] の形に変換します。
//! ステップ実行のロジックは持たず、状態の保持と委譲だけを行います。

use crate::{
    Frame, Register, ResumeState, Result, StopId, StopInfo, ThreadId, ThreadSettings, ThreadState,
    VersionedCache,
};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// ディスパッチキューのID
pub type QueueId = u64;

/// ディスパッチキューの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Unknown,
    Serial,
    Concurrent,
}

/// ディスパッチキューの情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: Option<String>,
    pub id: Option<QueueId>,
    pub kind: QueueKind,
}

/// リモートスタブとの通信機能
///
/// パケットの送受信自体は外部の実装が受け持ちます。
pub trait RemoteStub: Send + Sync {
    /// 単一レジスタの読み取り（`p`パケット）に対応しているかどうか
    fn supports_single_register_read(&self, tid: ThreadId) -> bool;

    /// 単一レジスタを読み取る
    fn read_register(&self, tid: ThreadId, reg: Register) -> Result<u64>;

    /// 全レジスタを読み取る（`g`パケット、レジスタ番号順）
    fn read_all_registers(&self, tid: ThreadId) -> Result<Vec<u64>>;

    /// スレッドの拡張情報（JSON文字列）を取得する
    fn thread_extended_info(&self, tid: ThreadId) -> Result<Option<String>>;
}

/// ランタイムのイントロスペクション機能
///
/// スレッドのディスパッチキューポインタからキューの情報を引きます。
pub trait SystemRuntime: Send + Sync {
    fn queue_name_for_thread(&self, dispatch_qaddr: u64) -> Option<String>;
    fn queue_id_for_thread(&self, dispatch_qaddr: u64) -> Option<QueueId>;
    fn dispatch_queue_address_for_thread(&self, dispatch_qaddr: u64) -> Option<u64>;
}

/// 再開パケットに積むスレッドのリスト
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeActions {
    /// `c`
    pub continue_tids: Vec<ThreadId>,
    /// `C`（シグナル付き継続）
    pub continue_with_signal: Vec<(ThreadId, i32)>,
    /// `s`
    pub step_tids: Vec<ThreadId>,
    /// `S`（シグナル付きステップ）
    pub step_with_signal: Vec<(ThreadId, i32)>,
}

impl ResumeActions {
    pub fn is_empty(&self) -> bool {
        self.continue_tids.is_empty()
            && self.continue_with_signal.is_empty()
            && self.step_tids.is_empty()
            && self.step_with_signal.is_empty()
    }
}

/// レジスタキャッシュ
struct RegisterCache {
    single_register_reads: bool,
    values: HashMap<Register, VersionedCache<u64>>,
}

impl RegisterCache {
    fn new(single_register_reads: bool) -> Self {
        Self {
            single_register_reads,
            values: HashMap::new(),
        }
    }
}

/// gdb-remoteスレッド
pub struct RemoteThread {
    tid: ThreadId,
    name: Option<String>,
    /// スレッドのディスパッチキューポインタ
    dispatch_qaddr: Option<u64>,
    /// 停止応答から得たキュー情報
    queue_name: Option<String>,
    queue_kind: QueueKind,
    queue_serial: QueueId,
    resume_signal: Option<i32>,
    stop_id: StopId,
    /// 最初のアクセスで作られるレジスタキャッシュ
    registers: Mutex<Option<RegisterCache>>,
    stop_info: Option<StopInfo>,
    frames: Vec<Frame>,
    settings: ThreadSettings,
    stub: Arc<dyn RemoteStub>,
    runtime: Option<Arc<dyn SystemRuntime>>,
}

impl RemoteThread {
    /// 新しいスレッドを作成する
    pub fn new(tid: ThreadId, stub: Arc<dyn RemoteStub>) -> Self {
        tracing::debug!("RemoteThread::new (tid = 0x{:04x})", tid);
        Self {
            tid,
            name: None,
            dispatch_qaddr: None,
            queue_name: None,
            queue_kind: QueueKind::Unknown,
            queue_serial: 0,
            resume_signal: None,
            stop_id: StopId::default(),
            registers: Mutex::new(None),
            stop_info: None,
            frames: Vec::new(),
            settings: ThreadSettings::default(),
            stub,
            runtime: None,
        }
    }

    /// ランタイムのイントロスペクション機能を設定する
    pub fn with_runtime(mut self, runtime: Arc<dyn SystemRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// スレッドの設定を変更する
    pub fn with_settings(mut self, settings: ThreadSettings) -> Self {
        self.settings = settings;
        self
    }

    /// スタブ上で有効なスレッドIDかどうか
    pub fn thread_id_is_valid(tid: ThreadId) -> bool {
        tid != 0
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<&str>) {
        self.name = name.filter(|n| !n.is_empty()).map(str::to_string);
    }

    pub fn dispatch_qaddr(&self) -> Option<u64> {
        self.dispatch_qaddr
    }

    /// ディスパッチキューポインタを設定する（0は「なし」として扱う）
    pub fn set_dispatch_qaddr(&mut self, qaddr: Option<u64>) {
        self.dispatch_qaddr = qaddr.filter(|addr| *addr != 0 && *addr != u64::MAX);
    }

    /// 停止応答から得たキュー情報を破棄する
    pub fn clear_queue_info(&mut self) {
        self.queue_name = None;
        self.queue_kind = QueueKind::Unknown;
        self.queue_serial = 0;
    }

    /// 停止応答から得たキュー情報を設定する
    pub fn set_queue_info(&mut self, name: String, kind: QueueKind, serial: QueueId) {
        self.queue_name = Some(name);
        self.queue_kind = kind;
        self.queue_serial = serial;
    }

    /// 停止応答のキュー情報が有効かどうか
    pub fn cached_queue_info_is_valid(&self) -> bool {
        self.queue_kind != QueueKind::Unknown
    }

    /// キュー名を取得する
    ///
    /// 停止応答の情報があればそれを信頼し、なければ毎回ランタイムから取り直します
    /// （キュー名は実行中に変わることがあるため）。
    pub fn queue_name(&mut self) -> Option<String> {
        if self.cached_queue_info_is_valid() {
            return self.queue_name.clone().filter(|n| !n.is_empty());
        }

        let (qaddr, runtime) = self.dispatch_qaddr.zip(self.runtime.as_ref())?;
        self.queue_name = runtime.queue_name_for_thread(qaddr);
        self.queue_name.clone().filter(|n| !n.is_empty())
    }

    /// キューIDを取得する
    pub fn queue_id(&self) -> Option<QueueId> {
        if self.cached_queue_info_is_valid() {
            return Some(self.queue_serial);
        }

        let (qaddr, runtime) = self.dispatch_qaddr.zip(self.runtime.as_ref())?;
        runtime.queue_id_for_thread(qaddr)
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.queue_kind
    }

    /// キュー情報をまとめて取得する
    pub fn queue_info(&mut self) -> QueueInfo {
        QueueInfo {
            name: self.queue_name(),
            id: self.queue_id(),
            kind: self.queue_kind,
        }
    }

    /// ディスパッチキュー本体のアドレスを取得する
    pub fn dispatch_queue_address(&self) -> Option<u64> {
        let (qaddr, runtime) = self.dispatch_qaddr.zip(self.runtime.as_ref())?;
        runtime.dispatch_queue_address_for_thread(qaddr)
    }

    /// スレッドの拡張情報を取得する
    pub fn fetch_extended_info(&self) -> Result<Option<serde_json::Value>> {
        tracing::debug!("Fetching extended information for thread {:04x}", self.tid);
        match self.stub.thread_extended_info(self.tid)? {
            Some(text) => {
                let value = serde_json::from_str(&text).map_err(|e| {
                    anyhow::anyhow!("Malformed extended info for thread {:04x}: {}", self.tid, e)
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 再開時に送るシグナルを設定する
    pub fn set_resume_signal(&mut self, signo: Option<i32>) {
        self.resume_signal = signo;
    }

    /// 再開直前に呼ばれ、再開パケットのリストにこのスレッドを積む
    pub fn will_resume(&self, state: ResumeState, actions: &mut ResumeActions) {
        tracing::debug!("Resuming thread: {:04x} with state: {}.", self.tid, state);

        let signal = self
            .resume_signal
            .filter(|signo| Signal::try_from(*signo).is_ok());

        match (state, signal) {
            (ResumeState::Suspended | ResumeState::Stopped, _) => {}
            (ResumeState::Running, Some(signo)) => {
                actions.continue_with_signal.push((self.tid, signo))
            }
            (ResumeState::Running, None) => actions.continue_tids.push(self.tid),
            (ResumeState::Stepping, Some(signo)) => actions.step_with_signal.push((self.tid, signo)),
            (ResumeState::Stepping, None) => actions.step_tids.push(self.tid),
        }
    }

    /// 停止後に呼ばれ、停止世代を進める
    ///
    /// 古い世代のレジスタ値はこれ以降読まれません。
    /// 停止応答で送られてきたレジスタは、この後 [`set_expedited_register`] で設定します。
    ///
    /// [`set_expedited_register`]: Self::set_expedited_register
    pub fn refresh_state_after_stop(&mut self, stop_id: StopId) {
        self.stop_id = stop_id;
    }

    pub fn stop_id(&self) -> StopId {
        self.stop_id
    }

    /// 停止応答に含まれていたレジスタ値を設定する
    pub fn set_expedited_register(&self, reg: Register, value: u64) {
        let mut guard = self.registers.lock();
        let cache = guard.get_or_insert_with(|| self.new_register_cache());
        cache
            .values
            .entry(reg)
            .or_default()
            .insert(value, self.stop_id);
    }

    /// レジスタキャッシュを世代に関係なく破棄する
    pub fn invalidate_registers(&self) {
        if let Some(cache) = self.registers.lock().as_mut() {
            cache.values.values_mut().for_each(VersionedCache::invalidate);
        }
    }

    /// 停止情報を設定する
    pub fn set_stop_info(&mut self, stop_info: Option<StopInfo>) {
        self.stop_info = stop_info;
    }

    /// 巻き戻し済みのフレームを設定する
    pub fn set_frames(&mut self, frames: Vec<Frame>) {
        self.frames = frames;
    }

    fn new_register_cache(&self) -> RegisterCache {
        RegisterCache::new(self.stub.supports_single_register_read(self.tid))
    }
}

impl ThreadState for RemoteThread {
    fn tid(&self) -> ThreadId {
        self.tid
    }

    fn frame_at(&self, index: usize) -> Option<Frame> {
        self.frames.get(index).cloned()
    }

    fn stop_info(&self) -> Option<StopInfo> {
        self.stop_info.clone()
    }

    fn read_register(&self, reg: Register) -> Result<u64> {
        let stop_id = self.stop_id;
        let mut guard = self.registers.lock();
        let cache = guard.get_or_insert_with(|| self.new_register_cache());

        if cache.single_register_reads {
            let value = cache
                .values
                .entry(reg)
                .or_default()
                .get_or_try_insert_with(stop_id, || self.stub.read_register(self.tid, reg))?;
            return Ok(*value);
        }

        if let Some(value) = cache.values.get(&reg).and_then(|c| c.get(stop_id)) {
            tracing::trace!("Register {} served from cache (stop {})", reg, stop_id);
            return Ok(*value);
        }

        let block = self.stub.read_all_registers(self.tid)?;
        for (regnum, value) in block.into_iter().enumerate() {
            if let Some(r) = Register::from_regnum(regnum) {
                cache.values.entry(r).or_default().insert(value, stop_id);
            }
        }

        cache
            .values
            .get(&reg)
            .and_then(|c| c.get(stop_id))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Register {} missing from register block", reg))
    }

    fn settings(&self) -> &ThreadSettings {
        &self.settings
    }
}

impl Drop for RemoteThread {
    fn drop(&mut self) {
        tracing::debug!("RemoteThread::drop (tid = 0x{:04x})", self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStub {
        single: bool,
        reads: AtomicUsize,
        extended: Option<String>,
    }

    impl RemoteStub for CountingStub {
        fn supports_single_register_read(&self, _tid: ThreadId) -> bool {
            self.single
        }

        fn read_register(&self, _tid: ThreadId, reg: Register) -> Result<u64> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) as u64;
            Ok(0x1000 * (reg.regnum() as u64 + 1) + n)
        }

        fn read_all_registers(&self, _tid: ThreadId) -> Result<Vec<u64>> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) as u64;
            Ok(Register::ALL
                .iter()
                .map(|r| 0x1000 * (r.regnum() as u64 + 1) + n)
                .collect())
        }

        fn thread_extended_info(&self, _tid: ThreadId) -> Result<Option<String>> {
            Ok(self.extended.clone())
        }
    }

    struct FixedRuntime;

    impl SystemRuntime for FixedRuntime {
        fn queue_name_for_thread(&self, dispatch_qaddr: u64) -> Option<String> {
            Some(format!("queue@{:x}", dispatch_qaddr))
        }

        fn queue_id_for_thread(&self, _dispatch_qaddr: u64) -> Option<QueueId> {
            Some(77)
        }

        fn dispatch_queue_address_for_thread(&self, dispatch_qaddr: u64) -> Option<u64> {
            Some(dispatch_qaddr + 0x10)
        }
    }

    fn thread_with(stub: CountingStub) -> (RemoteThread, Arc<CountingStub>) {
        let stub = Arc::new(stub);
        let thread = RemoteThread::new(0x11, stub.clone());
        (thread, stub)
    }

    #[test]
    fn test_registers_are_cached_per_stop() {
        let (mut thread, stub) = thread_with(CountingStub {
            single: true,
            ..Default::default()
        });
        thread.refresh_state_after_stop(StopId(1));

        let first = thread.read_register(Register::Rip).unwrap();
        let again = thread.read_register(Register::Rip).unwrap();
        assert_eq!(first, again);
        assert_eq!(stub.reads.load(Ordering::SeqCst), 1);

        // 次の停止では取り直す
        thread.refresh_state_after_stop(StopId(2));
        let next = thread.read_register(Register::Rip).unwrap();
        assert_ne!(first, next);
        assert_eq!(stub.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_expedited_register_is_trusted_for_current_stop() {
        let (mut thread, stub) = thread_with(CountingStub {
            single: true,
            ..Default::default()
        });
        thread.refresh_state_after_stop(StopId(3));
        thread.set_expedited_register(Register::Rip, 0x4010);

        assert_eq!(thread.pc().unwrap(), 0x4010);
        assert_eq!(stub.reads.load(Ordering::SeqCst), 0);

        thread.invalidate_registers();
        assert_ne!(thread.pc().unwrap(), 0x4010);
        assert_eq!(stub.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_all_registers_when_single_reads_unsupported() {
        let (mut thread, stub) = thread_with(CountingStub::default());
        thread.refresh_state_after_stop(StopId(1));

        let rip = thread.read_register(Register::Rip).unwrap();
        let rsp = thread.read_register(Register::Rsp).unwrap();
        assert_eq!(rip, 0x1000 * 17);
        assert_eq!(rsp, 0x1000 * 8);
        assert_eq!(stub.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queue_info_from_stop_reply_is_trusted() {
        let (thread, _) = thread_with(CountingStub::default());
        let mut thread = thread.with_runtime(Arc::new(FixedRuntime));
        thread.set_dispatch_qaddr(Some(0x5000));
        thread.set_queue_info("com.example.main".to_string(), QueueKind::Serial, 1);

        let info = thread.queue_info();
        assert_eq!(info.name.as_deref(), Some("com.example.main"));
        assert_eq!(info.id, Some(1));
        assert_eq!(info.kind, QueueKind::Serial);

        // 停止応答の情報がなければランタイムに問い合わせる
        thread.clear_queue_info();
        assert_eq!(thread.queue_name().as_deref(), Some("queue@5000"));
        assert_eq!(thread.queue_id(), Some(77));
        assert_eq!(thread.dispatch_queue_address(), Some(0x5010));
    }

    #[test]
    fn test_missing_queue_pointer_means_no_metadata() {
        let (thread, _) = thread_with(CountingStub::default());
        let mut thread = thread.with_runtime(Arc::new(FixedRuntime));
        thread.set_dispatch_qaddr(Some(0));

        assert_eq!(thread.queue_name(), None);
        assert_eq!(thread.queue_id(), None);
        assert_eq!(thread.dispatch_queue_address(), None);
    }

    #[test]
    fn test_will_resume_fills_packet_lists() {
        let (mut thread, _) = thread_with(CountingStub::default());
        let mut actions = ResumeActions::default();

        thread.will_resume(ResumeState::Running, &mut actions);
        thread.set_resume_signal(Some(2));
        thread.will_resume(ResumeState::Stepping, &mut actions);
        thread.set_resume_signal(Some(9999));
        thread.will_resume(ResumeState::Stepping, &mut actions);
        thread.will_resume(ResumeState::Suspended, &mut actions);

        assert_eq!(actions.continue_tids, vec![0x11]);
        assert_eq!(actions.step_with_signal, vec![(0x11, 2)]);
        assert_eq!(actions.step_tids, vec![0x11]);
        assert!(actions.continue_with_signal.is_empty());
    }

    #[test]
    fn test_extended_info_is_parsed() {
        let (thread, _) = thread_with(CountingStub {
            extended: Some(r#"{"activity":{"id":3}}"#.to_string()),
            ..Default::default()
        });
        let info = thread.fetch_extended_info().unwrap().unwrap();
        assert_eq!(info["activity"]["id"], 3);

        let (broken, _) = thread_with(CountingStub {
            extended: Some("{".to_string()),
            ..Default::default()
        });
        assert!(broken.fetch_extended_info().is_err());
    }

    #[test]
    fn test_thread_name() {
        let (mut thread, _) = thread_with(CountingStub::default());
        thread.set_name(Some("worker"));
        assert_eq!(thread.name(), Some("worker"));
        thread.set_name(Some(""));
        assert_eq!(thread.name(), None);
        assert!(!RemoteThread::thread_id_is_valid(0));
    }
}
