//! ファイルキャッシュリスト
//!
//! 20個のインデックスシャードを束ねるファサードを提供します。
//! フィンガープリントのルーティング、総数の集計、メモリキャッシュの
//! ウォームと無効化、追加・削除オブザーバの呼び出しを担当します。
//!
//! 旧レイアウトのディレクトリが設定されている場合、初期化時に
//! バックグラウンドで移行ワーカーを起動します。

use crate::config::CacheConfig;
use crate::error::Result;
use crate::fingerprint::{shard_index, SHARD_COUNT};
use crate::item::{CacheItem, Stat};
use crate::memory::MemoryCache;
use crate::shard::ShardDb;
use crate::{clock, upgrade};
use ftlog::{error, info};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// アイテムオブザーバ
///
/// ブロックしてはならない
pub type ItemObserver = Box<dyn Fn(&CacheItem) + Send + Sync>;

/// ファイルキャッシュリスト
///
/// 配信パスから共有されるため、`Arc`で保持して使用します。
pub struct FileList {
    dir: PathBuf,
    /// 旧レイアウトのインデックスディレクトリ（initの前に設定する）
    old_dir: Mutex<Option<PathBuf>>,
    shards: OnceCell<Vec<ShardDb>>,
    memory_cache: MemoryCache,
    total: AtomicI64,
    on_add: RwLock<Option<ItemObserver>>,
    on_remove: RwLock<Option<ItemObserver>>,
}

impl FileList {
    /// 指定ディレクトリのリストを作成
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.into(),
            old_dir: Mutex::new(None),
            shards: OnceCell::new(),
            memory_cache: MemoryCache::new(),
            total: AtomicI64::new(0),
            on_add: RwLock::new(None),
            on_remove: RwLock::new(None),
        })
    }

    /// 設定からリストを作成
    pub fn with_config(config: &CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            dir: config.dir.clone(),
            old_dir: Mutex::new(config.old_dir.clone()),
            shards: OnceCell::new(),
            memory_cache: MemoryCache::with_sweep_interval(Duration::from_secs(
                config.memory_sweep_interval_secs.max(1),
            )),
            total: AtomicI64::new(0),
            on_add: RwLock::new(None),
            on_remove: RwLock::new(None),
        })
    }

    /// 旧レイアウトのディレクトリを設定
    ///
    /// `init`より前に呼ぶこと
    pub fn set_old_dir(&self, old_dir: impl Into<PathBuf>) {
        *self.old_dir.lock().unwrap() = Some(old_dir.into());
    }

    /// リストを初期化
    ///
    /// ディレクトリを用意して全シャードを開き、総数を集計します。
    /// 旧ディレクトリが設定されていればバックグラウンドで移行を開始します。
    pub fn init(self: &Arc<Self>) -> Result<()> {
        if self.shards.get().is_some() {
            return Ok(());
        }

        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o777));
            }
            info!("[Cache] create cache dir '{}'", self.dir.display());
        }

        info!("[Cache] loading database from '{}' ...", self.dir.display());
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for i in 0..SHARD_COUNT {
            let path = self.dir.join(format!("db-{}.db", i));
            // ディスクエラーはそのシャードだけを非Readyにし、残りは動かし続ける
            let shard = match ShardDb::open(&path, i) {
                Ok(shard) => {
                    if let Err(err) = shard.init() {
                        error!("[Cache] shard {} init failed: {}", i, err);
                    }
                    shard
                }
                Err(err) => {
                    error!("[Cache] open shard '{}' failed: {}", path.display(), err);
                    ShardDb::unavailable(&path, i)
                }
            };
            shards.push(shard);
        }

        let total: i64 = shards.iter().map(|shard| shard.total()).sum();
        self.total.store(total, Ordering::Relaxed);
        let _ = self.shards.set(shards);

        // 旧レイアウトからの移行
        let old_dir = self.old_dir.lock().unwrap().clone();
        if let Some(old_dir) = old_dir {
            let list = Arc::clone(self);
            thread::spawn(move || {
                if let Err(err) = upgrade::upgrade_legacy_index(&list, &old_dir, false) {
                    error!("[Upgrade] legacy index upgrade failed: {}", err);
                }
            });
        }

        Ok(())
    }

    /// アイテムを追加
    ///
    /// 挿入をエンキューして総数を加算し、メモリキャッシュをウォームします。
    /// ヒットカウンタはここでは触りません（書き込み回数の削減）。
    pub fn add(&self, hash: &str, item: CacheItem) -> Result<()> {
        let Some(shard) = self.shard_for(hash) else {
            return Ok(());
        };
        if !shard.is_ready() {
            return Ok(());
        }

        shard.add_async(hash, &item)?;
        self.total.fetch_add(1, Ordering::Relaxed);
        self.memory_cache.write(hash, 1, item.expires_at);

        if let Ok(observer) = self.on_add.read() {
            if let Some(observer) = observer.as_ref() {
                observer(&item);
            }
        }
        Ok(())
    }

    /// フィンガープリントが有効期限内に存在するか
    ///
    /// 在庫セットで不在を短絡し、メモリキャッシュ、永続インデックスの
    /// 順で確認します。永続側のヒットはメモリキャッシュへ書き戻します。
    pub fn exist(&self, hash: &str) -> Result<bool> {
        let Some(shard) = self.shard_for(hash) else {
            return Ok(false);
        };
        if !shard.is_ready() {
            return Ok(false);
        }

        // 在庫セットに無ければ必ず存在しない
        if !shard.presence().contains(hash) {
            return Ok(false);
        }

        if self.memory_cache.read(hash).is_some() {
            return Ok(true);
        }

        match shard.exists_by_hash(hash, clock::unix_seconds())? {
            Some(expires_at) => {
                self.memory_cache.write(hash, 1, expires_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// アイテムを削除
    pub fn remove(&self, hash: &str) -> Result<()> {
        self.remove_inner(hash)?;
        Ok(())
    }

    /// 期限切れアイテムを削除
    ///
    /// `count`は1回の走査で扱うアイテム数の上限で、シャードごとに等分されます。
    /// 発見した各フィンガープリントについて削除後に`callback`を呼び、
    /// 発見総数を返します。
    pub fn purge(&self, count: usize, mut callback: impl FnMut(&str) -> Result<()>) -> Result<usize> {
        let Some(shards) = self.shards.get() else {
            return Ok(0);
        };

        let mut quota = count / SHARD_COUNT;
        if quota == 0 {
            quota = 100;
        }

        let mut found = 0;
        for shard in shards {
            let hashes = shard.list_expired_items(quota)?;
            found += hashes.len();

            // 読み取りカーソルを保持したままの削除を避けるため、
            // 列挙を終えてから操作する
            for hash in &hashes {
                self.remove(hash)?;
                callback(hash)?;
            }
        }
        Ok(found)
    }

    /// LFUエビクションを実行
    ///
    /// ヒット数昇順・古い順に各シャードから候補を取り出して削除します。
    /// インデックスに無いアイテムは孤児ヒット行の整理だけを行います。
    pub fn purge_lfu(
        &self,
        count: usize,
        mut callback: impl FnMut(&str) -> Result<()>,
    ) -> Result<usize> {
        let Some(shards) = self.shards.get() else {
            return Ok(0);
        };

        let mut quota = count / SHARD_COUNT;
        if quota == 0 {
            quota = 100;
        }

        let mut found = 0;
        for shard in shards {
            let hashes = shard.list_lfu_items(quota)?;
            found += hashes.len();

            for hash in &hashes {
                let not_found = self.remove_inner(hash)?;
                if not_found {
                    shard.delete_hit_async(hash)?;
                }
                callback(hash)?;
            }
        }
        Ok(found)
    }

    /// 前綴一致でアイテムを削除
    ///
    /// 空の前綴はno-op
    pub fn clean_prefix(&self, prefix: &str) -> Result<()> {
        if prefix.is_empty() {
            return Ok(());
        }
        self.clean_with(|shard| shard.clean_prefix(prefix))
    }

    /// ワイルドカードキーに一致するアイテムを削除
    ///
    /// 空のキーはno-op
    pub fn clean_match_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        self.clean_with(|shard| shard.clean_match_key(key))
    }

    /// ワイルドカード前綴に一致するアイテムを削除
    ///
    /// 空の前綴はno-op
    pub fn clean_match_prefix(&self, prefix: &str) -> Result<()> {
        if prefix.is_empty() {
            return Ok(());
        }
        self.clean_with(|shard| shard.clean_match_prefix(prefix))
    }

    /// 全アイテムを削除
    pub fn clean_all(&self) -> Result<()> {
        let result = (|| {
            let Some(shards) = self.shards.get() else {
                return Ok(());
            };
            for shard in shards {
                shard.clean_all()?;
            }
            Ok(())
        })();

        self.total.store(0, Ordering::Relaxed);
        self.memory_cache.clean();
        result
    }

    /// 統計を集計
    ///
    /// `filter`はAPI互換のために受け取りますが適用しません。
    /// 全行へのフィルタ適用は集計クエリの速度を損なうためです。
    /// 未初期化のシャードがある場合は全体をゼロ統計として返します。
    pub fn stat(&self, filter: Option<&dyn Fn(&str) -> bool>) -> Result<Stat> {
        let _ = filter;

        let Some(shards) = self.shards.get() else {
            return Ok(Stat::default());
        };

        let mut result = Stat::default();
        for shard in shards {
            if !shard.is_ready() {
                return Ok(Stat::default());
            }
            let stat = shard.stat()?;
            result.count += stat.count;
            result.size += stat.size;
            result.value_size += stat.value_size;
        }
        Ok(result)
    }

    /// 総アイテム数
    ///
    /// 頻繁に呼ばれるためデータベースへは問い合わせない
    #[inline]
    pub fn count(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    /// ヒットカウンタを加算
    pub fn increase_hit(&self, hash: &str) -> Result<()> {
        let Some(shard) = self.shard_for(hash) else {
            return Ok(());
        };
        if !shard.is_ready() {
            return Ok(());
        }
        shard.increase_hit_async(hash)
    }

    /// 追加オブザーバを登録
    pub fn on_add(&self, observer: impl Fn(&CacheItem) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.on_add.write() {
            *slot = Some(Box::new(observer));
        }
    }

    /// 削除オブザーバを登録
    ///
    /// 削除直前にディスクから読み出したアイテムが渡されます
    pub fn on_remove(&self, observer: impl Fn(&CacheItem) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.on_remove.write() {
            *slot = Some(Box::new(observer));
        }
    }

    /// 共有メモリキャッシュ
    ///
    /// SYNフラッド検知などのカウンタ用途からも参照される
    #[inline]
    pub fn memory_cache(&self) -> &MemoryCache {
        &self.memory_cache
    }

    /// 全シャードの書き込みキューが空になるまで待つ
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let Some(shards) = self.shards.get() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        for shard in shards {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !shard.wait_idle(remaining) {
                return false;
            }
        }
        true
    }

    /// リストをクローズ
    ///
    /// メモリキャッシュを破棄し、各シャードを閉じます。
    /// シャード単位のクローズエラーは無視します。
    pub fn close(&self) -> Result<()> {
        self.memory_cache.destroy();

        if let Some(shards) = self.shards.get() {
            for shard in shards {
                let _ = shard.close();
            }
        }
        Ok(())
    }

    /// フィンガープリントの所属シャード
    fn shard_for(&self, hash: &str) -> Option<&ShardDb> {
        self.shards.get().map(|shards| &shards[shard_index(hash)])
    }

    /// 削除の実体
    ///
    /// 返値はインデックスに見つからなかったかどうか。
    /// 呼び出し元はこれを見て関連ヒット行の整理を判断できます。
    fn remove_inner(&self, hash: &str) -> Result<bool> {
        let Some(shard) = self.shard_for(hash) else {
            return Ok(false);
        };
        if !shard.is_ready() {
            return Ok(false);
        }

        // 在庫セットに無ければ確実に存在しない
        if !shard.presence().contains(hash) {
            return Ok(true);
        }
        shard.presence().delete(hash);

        // 削除を通知する前にメモリキャッシュから消す
        self.memory_cache.delete(hash);

        let item = match shard.select_by_hash(hash)? {
            Some(item) => item,
            None => return Ok(true),
        };

        shard.delete_async(hash)?;
        self.total.fetch_sub(1, Ordering::Relaxed);
        shard.delete_hit_async(hash)?;

        if let Ok(observer) = self.on_remove.read() {
            if let Some(observer) = observer.as_ref() {
                observer(&item);
            }
        }
        Ok(false)
    }

    fn clean_with(&self, f: impl Fn(&ShardDb) -> Result<()>) -> Result<()> {
        let result = (|| {
            let Some(shards) = self.shards.get() else {
                return Ok(());
            };
            for shard in shards {
                f(shard)?;
            }
            Ok(())
        })();

        // 部分的に失敗しても集計と無効化は行う
        self.recompute_total();
        self.memory_cache.clean();
        result
    }

    fn recompute_total(&self) {
        if let Some(shards) = self.shards.get() {
            let total: i64 = shards.iter().map(|shard| shard.total()).sum();
            self.total.store(total, Ordering::Relaxed);
        }
    }
}
