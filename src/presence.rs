//! フィンガープリント在庫セット
//!
//! シャードごとにメモリ上へ保持するフィンガープリントの集合。
//! 「存在しない」判定のための高速フィルタとして使用します。
//!
//! 契約: 古い状態による偽陽性は許容されるが、永続インデックスへ
//! 追加済みのフィンガープリントに対して偽陰性を返してはならない。

use dashmap::DashSet;

/// 在庫セット
///
/// DashSetによりミューテーション中の並行`contains`が可能
#[derive(Default)]
pub struct PresenceSet {
    hashes: DashSet<String>,
}

impl PresenceSet {
    /// 空のセットを作成
    pub fn new() -> Self {
        Self {
            hashes: DashSet::new(),
        }
    }

    /// フィンガープリントを追加
    pub fn add(&self, hash: &str) {
        self.hashes.insert(hash.to_string());
    }

    /// フィンガープリントを削除
    pub fn delete(&self, hash: &str) {
        self.hashes.remove(hash);
    }

    /// フィンガープリントが含まれるか
    #[inline]
    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    /// 全件削除
    pub fn clear(&self) {
        self.hashes.clear();
    }

    /// 現在の件数
    #[inline]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// セットが空かどうか
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}
