//! 停止世代によるバージョン付きキャッシュ

use std::fmt;

/// プロセスの停止世代
///
/// ターゲットが停止するたびに単調増加します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StopId(pub u32);

impl StopId {
    /// 次の停止世代
    pub fn next(self) -> Self {
        StopId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for StopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 停止世代で無効化されるキャッシュ
///
/// 値と、それを取得した停止世代を組で保持します。
/// 読み出し時に現在の世代と比較し、異なれば値を返しません。
#[derive(Debug, Clone)]
pub struct VersionedCache<T> {
    entry: Option<(T, StopId)>,
}

impl<T> VersionedCache<T> {
    pub fn new() -> Self {
        Self { entry: None }
    }

    /// 現在の世代で有効な値を取得する
    pub fn get(&self, current: StopId) -> Option<&T> {
        match &self.entry {
            Some((value, stamp)) if *stamp == current => Some(value),
            _ => None,
        }
    }

    /// 値を指定された世代で保存する
    pub fn insert(&mut self, value: T, stamp: StopId) {
        self.entry = Some((value, stamp));
    }

    /// 現在の世代で有効な値を取得し、なければ `fetch` で取得して保存する
    pub fn get_or_try_insert_with<E>(
        &mut self,
        current: StopId,
        fetch: impl FnOnce() -> Result<T, E>,
    ) -> Result<&T, E> {
        let entry = match self.entry.take() {
            Some((value, stamp)) if stamp == current => (value, stamp),
            _ => (fetch()?, current),
        };
        let (value, _) = self.entry.insert(entry);
        Ok(&*value)
    }

    /// 世代に関係なく値を破棄する
    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    /// 保存されている値の世代
    pub fn stamp(&self) -> Option<StopId> {
        self.entry.as_ref().map(|(_, stamp)| *stamp)
    }
}

impl<T> Default for VersionedCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
