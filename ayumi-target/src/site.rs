//! ブレークポイントサイト管理
//!
//! 論理的なブレークポイント（ユーザー用・内部用）と、アドレスごとの物理的な
//! サイトを分けて管理します。同じアドレスに複数のブレークポイントがある場合、
//! サイトは1つだけ作られ、オーナーの数で参照カウントされます。
//! 最後のオーナーが外れたときにだけ、INT3がターゲットから取り除かれます。

use crate::{MemoryAccess, Result, SoftwareBreakpoint, ThreadId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// 論理ブレークポイントID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u32);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 物理サイトID（停止理由に載るID）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub u32);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ブレークポイント操作のエラー
#[derive(Debug, thiserror::Error)]
pub enum BreakpointError {
    #[error("Breakpoint {0} not found")]
    NotFound(BreakpointId),
    #[error("Invalid breakpoint address 0x{0:x}")]
    InvalidAddress(u64),
}

/// 論理ブレークポイント
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub address: u64,
    /// エンジン内部で作られたもの（ユーザーには見えない）
    pub internal: bool,
    pub enabled: bool,
    /// 用途の分類（例: "step-out"）
    pub kind: Option<String>,
    /// 特定のスレッドだけで有効な場合のスレッドID
    pub thread: Option<ThreadId>,
}

impl Breakpoint {
    /// 指定されたスレッドで停止対象になるかどうか
    pub fn applies_to(&self, tid: ThreadId) -> bool {
        self.thread.map_or(true, |t| t == tid)
    }
}

/// 物理ブレークポイントサイト
#[derive(Debug)]
pub struct BreakpointSite {
    id: SiteId,
    owners: Vec<BreakpointId>,
    software: SoftwareBreakpoint,
}

impl BreakpointSite {
    fn new(id: SiteId, address: u64) -> Self {
        Self {
            id,
            owners: Vec::new(),
            software: SoftwareBreakpoint::new(address),
        }
    }

    pub fn id(&self) -> SiteId {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.software.address()
    }

    /// このサイトを共有しているブレークポイントの数
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    /// 指定されたブレークポイントがこのサイトのオーナーかどうか
    pub fn is_owned_by(&self, id: BreakpointId) -> bool {
        self.owners.contains(&id)
    }

    pub fn owners(&self) -> &[BreakpointId] {
        &self.owners
    }

    /// INT3がターゲットに書き込まれているかどうか
    pub fn is_inserted(&self) -> bool {
        self.software.is_enabled()
    }
}

/// ブレークポイント保持機能
///
/// ステップ実行エンジンはこのトレイトを通してだけブレークポイントを操作します。
pub trait BreakpointSites: Send {
    /// ブレークポイントを作成し、サイトに登録する
    fn create_breakpoint(&mut self, address: u64, internal: bool) -> Result<BreakpointId>;

    /// ブレークポイントを削除する（最後のオーナーならサイトも除去する）
    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<()>;

    /// ブレークポイントの有効・無効を切り替える
    fn set_breakpoint_enabled(&mut self, id: BreakpointId, enabled: bool) -> Result<()>;

    /// 用途の分類を設定する
    fn set_breakpoint_kind(&mut self, id: BreakpointId, kind: &str) -> Result<()>;

    /// 停止対象のスレッドを限定する
    fn set_breakpoint_thread(&mut self, id: BreakpointId, thread: Option<ThreadId>) -> Result<()>;

    /// ブレークポイントを取得する
    fn breakpoint(&self, id: BreakpointId) -> Option<&Breakpoint>;

    /// サイトIDからサイトを検索する
    fn find_site_by_id(&self, id: SiteId) -> Option<&BreakpointSite>;

    /// アドレスからサイトを検索する
    fn site_at(&self, address: u64) -> Option<&BreakpointSite>;
}

/// スレッド間で共有されるブレークポイント保持機能
pub type SharedSites = Arc<Mutex<dyn BreakpointSites>>;

/// メモリパッチでサイトを実現するブレークポイントリスト
pub struct BreakpointSiteList<M> {
    memory: M,
    breakpoints: HashMap<BreakpointId, Breakpoint>,
    sites: BTreeMap<u64, BreakpointSite>,
    next_breakpoint_id: u32,
    next_site_id: u32,
}

impl<M: MemoryAccess> BreakpointSiteList<M> {
    /// 新しいブレークポイントリストを作成する
    pub fn new(memory: M) -> Self {
        Self {
            memory,
            breakpoints: HashMap::new(),
            sites: BTreeMap::new(),
            next_breakpoint_id: 1,
            next_site_id: 1,
        }
    }

    /// 共有可能な形に包む
    pub fn into_shared(self) -> Arc<Mutex<Self>>
    where
        M: 'static,
    {
        Arc::new(Mutex::new(self))
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// 全てのブレークポイントを取得する
    pub fn all(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    /// 全てのサイトを取得する
    pub fn sites(&self) -> impl Iterator<Item = &BreakpointSite> {
        self.sites.values()
    }

    /// ブレークポイントの数を取得する
    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }

    /// サイトの挿入状態をオーナーの状態に合わせる
    ///
    /// 有効なオーナーが1つでもあれば挿入し、なければ除去します。
    /// オーナーがいなくなったサイトは破棄されます。
    fn sync_site(&mut self, address: u64) -> Result<()> {
        let Self {
            memory,
            breakpoints,
            sites,
            ..
        } = self;

        let Some(site) = sites.get_mut(&address) else {
            return Ok(());
        };

        let wants_insert = site
            .owners
            .iter()
            .any(|id| breakpoints.get(id).is_some_and(|bp| bp.enabled));

        if wants_insert {
            site.software.enable(memory)?;
        } else {
            site.software.disable(memory)?;
        }

        if site.owners.is_empty() {
            tracing::debug!("Removing breakpoint site {} at 0x{:x}", site.id, address);
            sites.remove(&address);
        }
        Ok(())
    }

    fn get_mut(&mut self, id: BreakpointId) -> Result<&mut Breakpoint> {
        self.breakpoints
            .get_mut(&id)
            .ok_or_else(|| BreakpointError::NotFound(id).into())
    }
}

impl<M: MemoryAccess> BreakpointSites for BreakpointSiteList<M> {
    fn create_breakpoint(&mut self, address: u64, internal: bool) -> Result<BreakpointId> {
        if address == 0 || address == u64::MAX {
            return Err(BreakpointError::InvalidAddress(address).into());
        }

        let id = BreakpointId(self.next_breakpoint_id);
        self.next_breakpoint_id += 1;

        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                address,
                internal,
                enabled: true,
                kind: None,
                thread: None,
            },
        );

        let next_site_id = &mut self.next_site_id;
        let site = self.sites.entry(address).or_insert_with(|| {
            let site_id = SiteId(*next_site_id);
            *next_site_id += 1;
            BreakpointSite::new(site_id, address)
        });
        site.owners.push(id);

        if let Err(e) = self.sync_site(address) {
            // 挿入に失敗したら登録を巻き戻す
            self.breakpoints.remove(&id);
            if let Some(site) = self.sites.get_mut(&address) {
                site.owners.retain(|owner| *owner != id);
                if site.owners.is_empty() && !site.is_inserted() {
                    self.sites.remove(&address);
                }
            }
            return Err(e);
        }

        tracing::debug!(
            "Created breakpoint {} at 0x{:x} (internal: {})",
            id,
            address,
            internal
        );
        Ok(id)
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<()> {
        let bp = self
            .breakpoints
            .remove(&id)
            .ok_or(BreakpointError::NotFound(id))?;

        if let Some(site) = self.sites.get_mut(&bp.address) {
            site.owners.retain(|owner| *owner != id);
        }
        tracing::debug!("Removed breakpoint {} at 0x{:x}", id, bp.address);
        self.sync_site(bp.address)
    }

    fn set_breakpoint_enabled(&mut self, id: BreakpointId, enabled: bool) -> Result<()> {
        let bp = self.get_mut(id)?;
        if bp.enabled == enabled {
            return Ok(());
        }
        bp.enabled = enabled;
        let address = bp.address;
        self.sync_site(address)
    }

    fn set_breakpoint_kind(&mut self, id: BreakpointId, kind: &str) -> Result<()> {
        self.get_mut(id)?.kind = Some(kind.to_string());
        Ok(())
    }

    fn set_breakpoint_thread(&mut self, id: BreakpointId, thread: Option<ThreadId>) -> Result<()> {
        self.get_mut(id)?.thread = thread;
        Ok(())
    }

    fn breakpoint(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    fn find_site_by_id(&self, id: SiteId) -> Option<&BreakpointSite> {
        self.sites.values().find(|site| site.id == id)
    }

    fn site_at(&self, address: u64) -> Option<&BreakpointSite> {
        self.sites.get(&address)
    }
}

/// 内部ブレークポイントの所有ハンドル
///
/// 作成時にサイトのオーナーを1つ増やし、ドロップ時に必ず1つ減らします。
/// プランが完了しても途中で破棄されても、解放はこのハンドルのドロップだけで行われます。
pub struct BreakpointHandle {
    id: BreakpointId,
    address: u64,
    sites: SharedSites,
}

impl BreakpointHandle {
    /// 内部ブレークポイントを作成する
    pub fn create(
        sites: &SharedSites,
        address: u64,
        kind: &str,
        thread: Option<ThreadId>,
    ) -> Result<Self> {
        let id = sites.lock().create_breakpoint(address, true)?;
        let handle = Self {
            id,
            address,
            sites: Arc::clone(sites),
        };

        {
            let mut guard = handle.sites.lock();
            guard.set_breakpoint_kind(id, kind)?;
            guard.set_breakpoint_thread(id, thread)?;
        }
        Ok(handle)
    }

    pub fn id(&self) -> BreakpointId {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// ブレークポイントの有効・無効を切り替える
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.sites.lock().set_breakpoint_enabled(self.id, enabled)
    }
}

impl fmt::Debug for BreakpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakpointHandle")
            .field("id", &self.id)
            .field("address", &format_args!("0x{:x}", self.address))
            .finish()
    }
}

impl Drop for BreakpointHandle {
    fn drop(&mut self) {
        if let Err(e) = self.sites.lock().remove_breakpoint(self.id) {
            tracing::warn!("Failed to release breakpoint {}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::INT3_OPCODE;
    use crate::sim::SimMemory;

    fn shared_list() -> (Arc<Mutex<BreakpointSiteList<SimMemory>>>, SharedSites) {
        let list = BreakpointSiteList::new(SimMemory::new()).into_shared();
        let shared: SharedSites = list.clone();
        (list, shared)
    }

    #[test]
    fn test_shared_site_is_refcounted() {
        let (list, _) = shared_list();
        let mut guard = list.lock();

        let user = guard.create_breakpoint(0x2000, false).unwrap();
        let internal = guard.create_breakpoint(0x2000, true).unwrap();

        let site = guard.site_at(0x2000).unwrap();
        assert_eq!(site.owner_count(), 2);
        assert!(site.is_owned_by(user));
        assert!(site.is_owned_by(internal));

        guard.remove_breakpoint(internal).unwrap();
        assert_eq!(guard.site_at(0x2000).unwrap().owner_count(), 1);
        assert_eq!(guard.memory().read_u8(0x2000).unwrap(), INT3_OPCODE);

        guard.remove_breakpoint(user).unwrap();
        assert!(guard.site_at(0x2000).is_none());
        assert_ne!(guard.memory().read_u8(0x2000).unwrap(), INT3_OPCODE);
    }

    #[test]
    fn test_disabled_owner_keeps_site_for_enabled_owner() {
        let (list, _) = shared_list();
        let mut guard = list.lock();

        let a = guard.create_breakpoint(0x3000, false).unwrap();
        let b = guard.create_breakpoint(0x3000, true).unwrap();

        guard.set_breakpoint_enabled(b, false).unwrap();
        assert!(guard.site_at(0x3000).unwrap().is_inserted());

        guard.set_breakpoint_enabled(a, false).unwrap();
        let site = guard.site_at(0x3000).unwrap();
        assert!(!site.is_inserted());
        assert_eq!(site.owner_count(), 2);
    }

    #[test]
    fn test_handle_drop_releases_ownership() {
        let (list, shared) = shared_list();

        let handle = BreakpointHandle::create(&shared, 0x4000, "step-out", Some(7)).unwrap();
        {
            let guard = list.lock();
            let bp = guard.breakpoint(handle.id()).unwrap();
            assert!(bp.internal);
            assert_eq!(bp.kind.as_deref(), Some("step-out"));
            assert!(bp.applies_to(7));
            assert!(!bp.applies_to(8));
        }

        drop(handle);
        let guard = list.lock();
        assert_eq!(guard.count(), 0);
        assert!(guard.site_at(0x4000).is_none());
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let (list, _) = shared_list();
        assert!(list.lock().create_breakpoint(0, true).is_err());
        assert_eq!(list.lock().count(), 0);
    }

    #[test]
    fn test_remove_unknown_breakpoint() {
        let (list, _) = shared_list();
        assert!(list.lock().remove_breakpoint(BreakpointId(42)).is_err());
    }
}
