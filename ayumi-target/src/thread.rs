//! スレッドの抽象化

use crate::{Frame, Register, Result, StopInfo};

/// スレッドID
pub type ThreadId = u64;

/// スレッドごとのステップ実行設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSettings {
    /// ステップアウト時にデバッグ情報のないフレームを飛ばすかどうか
    pub step_out_avoids_no_debug: bool,
    /// ステップイン時にデバッグ情報のないフレームを飛ばすかどうか
    pub step_in_avoids_no_debug: bool,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            step_out_avoids_no_debug: true,
            step_in_avoids_no_debug: true,
        }
    }
}

/// ステップ実行エンジンが問い合わせるスレッド
///
/// 値はすべて「直近の停止時点」のものです。
/// 最も深いフレーム以外のレジスタ値はフレーム側（巻き戻し機能）から取得し、
/// このトレイトでは扱いません。
pub trait ThreadState {
    /// スレッドIDを取得する
    fn tid(&self) -> ThreadId;

    /// 指定されたインデックスのフレームを取得する
    fn frame_at(&self, index: usize) -> Option<Frame>;

    /// 直近の停止情報を取得する
    fn stop_info(&self) -> Option<StopInfo>;

    /// 最も深いフレームのレジスタを読み取る
    fn read_register(&self, reg: Register) -> Result<u64>;

    /// スレッドの設定を取得する
    fn settings(&self) -> &ThreadSettings;

    /// プログラムカウンタを取得する
    fn pc(&self) -> Result<u64> {
        self.read_register(Register::PC)
    }
}
