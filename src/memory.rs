//! TTLメモリキャッシュ
//!
//! フィンガープリントから（値、絶対有効期限）へのプロセスローカルなマップを提供します。
//! 期限切れ判定は遅延評価で、`read`時に破棄されます。
//! 低頻度のスイーパースレッドが残骸を回収してメモリを解放します。
//!
//! 永続インデックスのホットパス短絡のほか、`increase_int`による
//! アトミックカウンタはSYNフラッド検知やCCチェックからも使用されます。

use crate::clock;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// メモリキャッシュエントリ
#[derive(Debug, Clone, Copy)]
struct MemoryEntry {
    /// 値（在庫マーカーまたはカウンタ）
    value: i64,
    /// 有効期限（Unix秒）
    expires_at: i64,
}

impl MemoryEntry {
    #[inline]
    fn is_valid(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// TTLメモリキャッシュ
///
/// スレッドセーフ。エントリは永続インデックスの非期限切れ集合の
/// 部分集合（レースを除く）であり、メモリエントリが永続アイテムの
/// 寿命を延ばすことはありません。
pub struct MemoryCache {
    /// エントリマップ（フィンガープリント → エントリ）
    entries: Arc<DashMap<String, MemoryEntry>>,
    /// スイーパー停止フラグ
    stop: Arc<AtomicBool>,
    /// スイーパースレッドのハンドル
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryCache {
    /// デフォルトのスイープ間隔（60秒）でキャッシュを作成
    pub fn new() -> Self {
        Self::with_sweep_interval(Duration::from_secs(60))
    }

    /// スイープ間隔を指定してキャッシュを作成
    pub fn with_sweep_interval(interval: Duration) -> Self {
        let entries: Arc<DashMap<String, MemoryEntry>> = Arc::new(DashMap::new());
        let stop = Arc::new(AtomicBool::new(false));

        let sweeper = {
            let entries = Arc::clone(&entries);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let slice = Duration::from_millis(500);
                let mut waited = Duration::ZERO;
                loop {
                    // 停止要求に即応できるよう小刻みに待つ
                    thread::sleep(slice);
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    waited += slice;
                    if waited < interval {
                        continue;
                    }
                    waited = Duration::ZERO;

                    let now = clock::unix_seconds();
                    entries.retain(|_, entry| entry.is_valid(now));
                }
            })
        };

        Self {
            entries,
            stop,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// エントリを読み込み
    ///
    /// 有効期限内のエントリのみ値を返します。
    /// 期限切れエントリは破棄されます。
    pub fn read(&self, hash: &str) -> Option<i64> {
        let now = clock::unix_seconds();

        let entry = self.entries.get(hash)?;
        if entry.is_valid(now) {
            return Some(entry.value);
        }
        drop(entry);

        self.entries.remove(hash);
        None
    }

    /// エントリを書き込み
    ///
    /// `expires_at`は絶対Unix秒。過去の時刻を渡すと即座に期限切れになります。
    pub fn write(&self, hash: &str, value: i64, expires_at: i64) {
        self.entries.insert(
            hash.to_string(),
            MemoryEntry { value, expires_at },
        );
    }

    /// エントリを削除
    pub fn delete(&self, hash: &str) {
        self.entries.remove(hash);
    }

    /// カウンタを加算して新しい値を返す
    ///
    /// エントリが存在しないか期限切れの場合は`delta`から数え直します。
    /// 有効期限は据え置き、新規作成時のみ`expires_at`を設定します。
    pub fn increase_int(&self, hash: &str, delta: i64, expires_at: i64) -> i64 {
        let now = clock::unix_seconds();

        let mut entry = self
            .entries
            .entry(hash.to_string())
            .or_insert(MemoryEntry { value: 0, expires_at });

        if !entry.is_valid(now) {
            entry.value = delta;
            entry.expires_at = expires_at;
        } else {
            entry.value += delta;
        }
        entry.value
    }

    /// 全エントリを削除
    pub fn clean(&self) {
        self.entries.clear();
    }

    /// 現在のエントリ数（期限切れ含む）
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// キャッシュが空かどうか
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// キャッシュを破棄
    ///
    /// スイーパーを停止して全エントリを解放します。以後の操作は
    /// 空のキャッシュとして振る舞います。
    pub fn destroy(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                let _ = handle.join();
            }
        }
        self.entries.clear();
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::unix_seconds;

    #[test]
    fn test_write_and_read() {
        let cache = MemoryCache::new();
        cache.write("a", 1, unix_seconds() + 60);

        assert_eq!(cache.read("a"), Some(1));
        assert_eq!(cache.read("b"), None);
        cache.destroy();
    }

    #[test]
    fn test_lazy_expiry() {
        let cache = MemoryCache::new();
        cache.write("a", 1, unix_seconds() - 10);

        assert_eq!(cache.read("a"), None);
        // 期限切れエントリはread時に破棄される
        assert!(cache.is_empty());
        cache.destroy();
    }

    #[test]
    fn test_delete() {
        let cache = MemoryCache::new();
        cache.write("a", 1, unix_seconds() + 60);
        cache.delete("a");
        assert_eq!(cache.read("a"), None);
        cache.destroy();
    }

    #[test]
    fn test_increase_int() {
        let cache = MemoryCache::new();
        let expires = unix_seconds() + 60;

        assert_eq!(cache.increase_int("counter", 1, expires), 1);
        assert_eq!(cache.increase_int("counter", 1, expires), 2);
        assert_eq!(cache.increase_int("counter", 5, expires), 7);
        cache.destroy();
    }

    #[test]
    fn test_increase_int_restarts_after_expiry() {
        let cache = MemoryCache::new();
        cache.write("counter", 100, unix_seconds() - 1);

        // 期限切れカウンタはdeltaから数え直す
        assert_eq!(cache.increase_int("counter", 1, unix_seconds() + 60), 1);
        cache.destroy();
    }

    #[test]
    fn test_clean() {
        let cache = MemoryCache::new();
        for i in 0..10 {
            cache.write(&format!("hash-{}", i), 1, unix_seconds() + 60);
        }
        assert_eq!(cache.len(), 10);

        cache.clean();
        assert!(cache.is_empty());
        cache.destroy();
    }

    #[test]
    fn test_sweeper_reclaims_expired() {
        let cache = MemoryCache::with_sweep_interval(Duration::from_millis(500));
        cache.write("stale", 1, unix_seconds() - 10);
        cache.write("fresh", 1, unix_seconds() + 60);

        // スイーパーの1周期を待つ
        thread::sleep(Duration::from_millis(1600));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.read("fresh"), Some(1));
        cache.destroy();
    }

    #[test]
    fn test_destroy_stops_sweeper() {
        let cache = MemoryCache::with_sweep_interval(Duration::from_millis(100));
        cache.write("a", 1, unix_seconds() + 60);
        cache.destroy();
        assert!(cache.is_empty());
    }
}
