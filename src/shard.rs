//! インデックスシャード
//!
//! 1つのオンディスクインデックスファイル（SQLite）を所有し、
//! アイテムテーブルとヒットカウンタテーブルを管理します。
//!
//! ## 並行モデル
//!
//! - 読み込みは呼び出しスレッドで直接クエリを実行
//! - 書き込みは有界チャンネル経由で単一のライタースレッドへ集約し、
//!   トランザクションにまとめて適用（シャード内はFIFO）
//! - エンキュー成功後の書き込みは成功したものとして扱う
//!
//! ## 状態遷移
//!
//! 未初期化 → Opening → Ready → Closing → Closed。
//! Ready以外のシャードへのミューテーションはno-op、読み込みは空を返します。

use crate::clock;
use crate::error::{CacheError, Result};
use crate::item::{CacheItem, Stat};
use crate::presence::PresenceSet;
use ftlog::error;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 非同期書き込みチャンネルの容量
const WRITE_QUEUE_CAPACITY: usize = 2048;

/// 1トランザクションにまとめる書き込みの上限
const WRITE_BATCH_SIZE: usize = 128;

// ====================
// スキーマ定義
// ====================

const CREATE_ITEMS_TABLE: &str = "CREATE TABLE IF NOT EXISTS items (
  hash TEXT PRIMARY KEY,
  key TEXT,
  header_size INTEGER DEFAULT 0,
  body_size INTEGER DEFAULT 0,
  meta_size INTEGER DEFAULT 0,
  expires_at INTEGER DEFAULT 0,
  stale_at INTEGER DEFAULT 0,
  created_at INTEGER DEFAULT 0,
  host TEXT,
  server_id INTEGER DEFAULT 0
)";

const CREATE_ITEMS_EXPIRES_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_items_expires_at ON items (expires_at)";

const CREATE_HITS_TABLE: &str = "CREATE TABLE IF NOT EXISTS hits (
  hash TEXT PRIMARY KEY,
  week INTEGER DEFAULT 0,
  week1_hits INTEGER DEFAULT 0,
  week2_hits INTEGER DEFAULT 0
)";

// ====================
// プリペアドステートメント
// ====================

const STMT_EXISTS_BY_HASH: &str =
    "SELECT expires_at FROM items WHERE hash = ?1 AND expires_at > ?2 LIMIT 1";

const STMT_SELECT_BY_HASH: &str = "SELECT key, header_size, body_size, meta_size, expires_at, \
     stale_at, created_at, host, server_id FROM items WHERE hash = ?1 LIMIT 1";

const STMT_INSERT_ITEM: &str = "INSERT OR REPLACE INTO items (hash, key, header_size, body_size, \
     meta_size, expires_at, stale_at, created_at, host, server_id) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

const STMT_DELETE_ITEM: &str = "DELETE FROM items WHERE hash = ?1";

const STMT_DELETE_HIT: &str = "DELETE FROM hits WHERE hash = ?1";

/// ローリング2週間ウィンドウの更新
///
/// week2_hitsが今週、week1_hitsが前週のカウント。
/// 1週間を超える空白はウィンドウをゼロから数え直す
const STMT_INCREASE_HIT: &str = "INSERT INTO hits (hash, week, week1_hits, week2_hits) \
     VALUES (?1, ?2, 0, 1) \
     ON CONFLICT (hash) DO UPDATE SET \
       week1_hits = CASE WHEN week = ?2 THEN week1_hits \
                         WHEN week = ?2 - 1 THEN week2_hits \
                         ELSE 0 END, \
       week2_hits = CASE WHEN week = ?2 THEN week2_hits + 1 ELSE 1 END, \
       week = ?2";

const STMT_LIST_EXPIRED: &str = "SELECT hash FROM items WHERE expires_at <= ?1 LIMIT ?2";

const STMT_LIST_LFU: &str = "SELECT items.hash FROM items \
     LEFT JOIN hits ON items.hash = hits.hash \
     ORDER BY IFNULL(hits.week1_hits, 0) + IFNULL(hits.week2_hits, 0) ASC, \
              items.created_at ASC \
     LIMIT ?1";

const STMT_STAT: &str = "SELECT COUNT(*), IFNULL(SUM(header_size + body_size + meta_size), 0), \
     IFNULL(SUM(body_size), 0) FROM items";

const STMT_LIST_HASHES: &str = "SELECT hash FROM items";

/// 非同期書き込み操作
enum WriteOp {
    /// アイテムの挿入または置換
    Insert { hash: String, item: CacheItem },
    /// アイテムの削除
    Delete { hash: String },
    /// ヒット行の削除
    DeleteHit { hash: String },
    /// ヒットカウンタの加算
    IncreaseHit { hash: String },
}

/// インデックスシャード
pub struct ShardDb {
    path: PathBuf,
    index: usize,
    read_conn: Mutex<Option<Connection>>,
    /// open()からinit()までライター接続を預かる
    writer_conn: Mutex<Option<Connection>>,
    writer_tx: Mutex<Option<SyncSender<WriteOp>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    /// エンキュー済み・未適用の書き込み数
    pending_writes: Arc<AtomicI64>,
    presence: PresenceSet,
    total: AtomicI64,
    is_ready: AtomicBool,
}

impl ShardDb {
    /// シャードを開く
    ///
    /// 接続の確立のみを行います。スキーマ作成とライター起動は`init`で行います。
    pub fn open(path: impl Into<PathBuf>, index: usize) -> Result<Self> {
        let path = path.into();
        let read_conn = open_connection(&path)?;
        let writer_conn = open_connection(&path)?;

        Ok(Self {
            path,
            index,
            read_conn: Mutex::new(Some(read_conn)),
            writer_conn: Mutex::new(Some(writer_conn)),
            writer_tx: Mutex::new(None),
            writer_handle: Mutex::new(None),
            pending_writes: Arc::new(AtomicI64::new(0)),
            presence: PresenceSet::new(),
            total: AtomicI64::new(0),
            is_ready: AtomicBool::new(false),
        })
    }

    /// 接続を持たないシャードを作成
    ///
    /// ディスクエラーで開けなかったスロットの占位に使用します。
    /// 永続的に非Readyで、全操作がno-opまたは空として振る舞います。
    pub(crate) fn unavailable(path: impl Into<PathBuf>, index: usize) -> Self {
        Self {
            path: path.into(),
            index,
            read_conn: Mutex::new(None),
            writer_conn: Mutex::new(None),
            writer_tx: Mutex::new(None),
            writer_handle: Mutex::new(None),
            pending_writes: Arc::new(AtomicI64::new(0)),
            presence: PresenceSet::new(),
            total: AtomicI64::new(0),
            is_ready: AtomicBool::new(false),
        }
    }

    /// シャードを初期化
    ///
    /// テーブルを作成し、在庫セットと総数を読み込み、
    /// ライタースレッドを起動してReady状態へ遷移します。
    pub fn init(&self) -> Result<()> {
        {
            let conn = self.read_conn.lock().unwrap();
            let conn = conn.as_ref().ok_or(CacheError::Closed)?;

            conn.execute(CREATE_ITEMS_TABLE, [])?;
            conn.execute(CREATE_ITEMS_EXPIRES_INDEX, [])?;
            conn.execute(CREATE_HITS_TABLE, [])?;

            // 在庫セットと総数の復元
            let mut stmt = conn.prepare_cached(STMT_LIST_HASHES)?;
            let mut rows = stmt.query([])?;
            let mut total = 0i64;
            while let Some(row) = rows.next()? {
                let hash: String = row.get(0)?;
                self.presence.add(&hash);
                total += 1;
            }
            self.total.store(total, Ordering::Relaxed);
        }

        // ライタースレッド起動
        let writer_conn = self
            .writer_conn
            .lock()
            .unwrap()
            .take()
            .ok_or(CacheError::Closed)?;
        let (tx, rx) = sync_channel::<WriteOp>(WRITE_QUEUE_CAPACITY);
        let pending = Arc::clone(&self.pending_writes);
        let index = self.index;
        let handle = thread::spawn(move || run_writer(writer_conn, rx, pending, index));

        *self.writer_tx.lock().unwrap() = Some(tx);
        *self.writer_handle.lock().unwrap() = Some(handle);
        self.is_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// シャードがReadyかどうか
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Acquire)
    }

    /// データベースファイルのパス
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 初期化時に読み込んだ行数
    #[inline]
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    /// 在庫セット
    #[inline]
    pub fn presence(&self) -> &PresenceSet {
        &self.presence
    }

    // ====================
    // 非同期書き込み
    // ====================

    /// アイテムの挿入をエンキュー
    ///
    /// 在庫セットへは即時追加するため、エンキュー直後から
    /// `presence`は偽陰性を返しません。
    pub fn add_async(&self, hash: &str, item: &CacheItem) -> Result<()> {
        if !self.is_ready() {
            return Ok(());
        }
        self.presence.add(hash);
        self.enqueue(WriteOp::Insert {
            hash: hash.to_string(),
            item: item.clone(),
        })
    }

    /// アイテムの削除をエンキュー
    pub fn delete_async(&self, hash: &str) -> Result<()> {
        if !self.is_ready() {
            return Ok(());
        }
        self.enqueue(WriteOp::Delete {
            hash: hash.to_string(),
        })
    }

    /// ヒット行の削除をエンキュー
    pub fn delete_hit_async(&self, hash: &str) -> Result<()> {
        if !self.is_ready() {
            return Ok(());
        }
        self.enqueue(WriteOp::DeleteHit {
            hash: hash.to_string(),
        })
    }

    /// ヒットカウンタの加算をエンキュー
    pub fn increase_hit_async(&self, hash: &str) -> Result<()> {
        if !self.is_ready() {
            return Ok(());
        }
        self.enqueue(WriteOp::IncreaseHit {
            hash: hash.to_string(),
        })
    }

    fn enqueue(&self, op: WriteOp) -> Result<()> {
        let tx = self.writer_tx.lock().unwrap();
        let sender = tx.as_ref().ok_or(CacheError::Closed)?;
        self.pending_writes.fetch_add(1, Ordering::Release);
        match sender.try_send(op) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.pending_writes.fetch_sub(1, Ordering::Release);
                Err(CacheError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.pending_writes.fetch_sub(1, Ordering::Release);
                Err(CacheError::Closed)
            }
        }
    }

    /// 書き込みキューが空になるまで待つ
    ///
    /// 期限内に空になればtrue
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending_writes.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    // ====================
    // 読み込みクエリ
    // ====================

    /// フィンガープリントが有効期限内に存在するか
    ///
    /// 存在する場合はその`expires_at`を返します
    pub fn exists_by_hash(&self, hash: &str, now: i64) -> Result<Option<i64>> {
        self.with_read_conn(|conn| {
            let mut stmt = conn.prepare_cached(STMT_EXISTS_BY_HASH)?;
            let expires_at = stmt
                .query_row(params![hash, now], |row| row.get::<_, i64>(0))
                .optional()?;
            Ok(expires_at)
        })
    }

    /// フィンガープリントの行全体を取得
    pub fn select_by_hash(&self, hash: &str) -> Result<Option<CacheItem>> {
        self.with_read_conn(|conn| {
            let mut stmt = conn.prepare_cached(STMT_SELECT_BY_HASH)?;
            let item = stmt
                .query_row(params![hash], |row| {
                    Ok(CacheItem {
                        key: row.get(0)?,
                        header_size: row.get(1)?,
                        body_size: row.get(2)?,
                        meta_size: row.get(3)?,
                        expires_at: row.get(4)?,
                        stale_at: row.get(5)?,
                        created_at: row.get(6)?,
                        host: row.get(7)?,
                        server_id: row.get(8)?,
                        ..Default::default()
                    })
                })
                .optional()?;
            Ok(item)
        })
    }

    /// 期限切れアイテムのフィンガープリントを最大`limit`件列挙
    ///
    /// 結果はミューテーション前に全件収集します
    pub fn list_expired_items(&self, limit: usize) -> Result<Vec<String>> {
        let now = clock::unix_seconds();
        self.with_read_conn(|conn| {
            let mut stmt = conn.prepare_cached(STMT_LIST_EXPIRED)?;
            let rows = stmt.query_map(params![now, limit as i64], |row| row.get::<_, String>(0))?;
            let mut hashes = Vec::new();
            for row in rows {
                hashes.push(row?);
            }
            Ok(hashes)
        })
    }

    /// LFUスコア順（ヒット数昇順、古い順）にフィンガープリントを最大`limit`件列挙
    pub fn list_lfu_items(&self, limit: usize) -> Result<Vec<String>> {
        self.with_read_conn(|conn| {
            let mut stmt = conn.prepare_cached(STMT_LIST_LFU)?;
            let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
            let mut hashes = Vec::new();
            for row in rows {
                hashes.push(row?);
            }
            Ok(hashes)
        })
    }

    /// 集計統計を取得
    pub fn stat(&self) -> Result<Stat> {
        self.with_read_conn(|conn| {
            let mut stmt = conn.prepare_cached(STMT_STAT)?;
            let stat = stmt.query_row([], |row| {
                Ok(Stat {
                    count: row.get(0)?,
                    size: row.get(1)?,
                    value_size: row.get(2)?,
                })
            })?;
            Ok(stat)
        })
    }

    // ====================
    // 一括削除
    // ====================

    /// キーが前綴`prefix`で始まるアイテムを削除
    pub fn clean_prefix(&self, prefix: &str) -> Result<()> {
        let pattern = format!("{}%", escape_like(prefix));
        self.delete_by_key_pattern(&pattern)
    }

    /// ワイルドカードキーに完全一致するアイテムを削除
    ///
    /// `*`は任意の文字列にマッチします（例: `https://*.example.com/hello`）
    pub fn clean_match_key(&self, key: &str) -> Result<()> {
        let pattern = wildcard_to_like(key);
        self.delete_by_key_pattern(&pattern)
    }

    /// ワイルドカード前綴にマッチするアイテムを削除
    ///
    /// `clean_match_key`と同じ構文で、保存キーの前綴のみを比較します
    pub fn clean_match_prefix(&self, prefix: &str) -> Result<()> {
        let pattern = format!("{}%", wildcard_to_like(prefix));
        self.delete_by_key_pattern(&pattern)
    }

    fn delete_by_key_pattern(&self, pattern: &str) -> Result<()> {
        if !self.is_ready() || pattern.is_empty() || pattern == "%" {
            return Ok(());
        }
        self.with_read_conn(|conn| {
            conn.execute(
                "DELETE FROM items WHERE key LIKE ?1 ESCAPE '\\'",
                params![pattern],
            )?;
            Ok(())
        })?;
        self.reload()
    }

    /// 全アイテムと全ヒット行を削除
    pub fn clean_all(&self) -> Result<()> {
        if !self.is_ready() {
            return Ok(());
        }
        self.with_read_conn(|conn| {
            conn.execute("DELETE FROM items", [])?;
            conn.execute("DELETE FROM hits", [])?;
            Ok(())
        })?;
        self.presence.clear();
        self.total.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// 在庫セットと総数をデータベースから再構築
    pub fn reload(&self) -> Result<()> {
        self.with_read_conn(|conn| {
            let mut stmt = conn.prepare_cached(STMT_LIST_HASHES)?;
            let mut rows = stmt.query([])?;

            self.presence.clear();
            let mut total = 0i64;
            while let Some(row) = rows.next()? {
                let hash: String = row.get(0)?;
                self.presence.add(&hash);
                total += 1;
            }
            self.total.store(total, Ordering::Relaxed);
            Ok(())
        })
    }

    /// シャードをクローズ
    ///
    /// Closing状態へ遷移して書き込みキューをドレインし、接続を閉じます
    pub fn close(&self) -> Result<()> {
        self.is_ready.store(false, Ordering::Release);

        // チャンネルを切断するとライターは残件を処理して終了する
        self.writer_tx.lock().unwrap().take();
        if let Some(handle) = self.writer_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.read_conn.lock().unwrap().take();
        self.writer_conn.lock().unwrap().take();
        Ok(())
    }

    fn with_read_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.read_conn.lock().unwrap();
        match conn.as_ref() {
            Some(conn) => f(conn),
            None => Err(CacheError::Closed),
        }
    }

    #[cfg(test)]
    fn count_rows(&self) -> i64 {
        self.with_read_conn(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
            Ok(count)
        })
        .unwrap_or(0)
    }
}

/// 接続を開いてプラグマを適用
fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )?;
    conn.set_prepared_statement_cache_capacity(32);

    // WAL + 非同期書き込み。ロック競合はビジータイムアウトで吸収
    conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
    conn.pragma_update(None, "synchronous", "OFF")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// ライタースレッド本体
///
/// チャンネルが切断されるまで操作を受け取り、
/// バッチ単位のトランザクションで適用する
fn run_writer(
    mut conn: Connection,
    rx: Receiver<WriteOp>,
    pending: Arc<AtomicI64>,
    index: usize,
) {
    let mut batch = Vec::with_capacity(WRITE_BATCH_SIZE);

    while let Ok(op) = rx.recv() {
        batch.push(op);
        while batch.len() < WRITE_BATCH_SIZE {
            match rx.try_recv() {
                Ok(op) => batch.push(op),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let applied = batch.len() as i64;
        if let Err(err) = apply_batch(&mut conn, &batch) {
            error!("[Cache] shard {}: write batch failed: {}", index, err);
        }
        pending.fetch_sub(applied, Ordering::Release);
        batch.clear();
    }
}

fn apply_batch(conn: &mut Connection, batch: &[WriteOp]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for op in batch {
        match op {
            WriteOp::Insert { hash, item } => {
                tx.prepare_cached(STMT_INSERT_ITEM)?.execute(params![
                    hash,
                    item.key,
                    item.header_size,
                    item.body_size,
                    item.meta_size,
                    item.expires_at,
                    item.stale_at,
                    item.created_at,
                    item.host,
                    item.server_id,
                ])?;
            }
            WriteOp::Delete { hash } => {
                tx.prepare_cached(STMT_DELETE_ITEM)?.execute(params![hash])?;
            }
            WriteOp::DeleteHit { hash } => {
                tx.prepare_cached(STMT_DELETE_HIT)?.execute(params![hash])?;
            }
            WriteOp::IncreaseHit { hash } => {
                let week = clock::unix_week();
                tx.prepare_cached(STMT_INCREASE_HIT)?
                    .execute(params![hash, week])?;
            }
        }
    }
    tx.commit()
}

/// LIKE用メタ文字のエスケープ
fn escape_like(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// シェル形式のワイルドカードをLIKEパターンへ変換
///
/// `*`のみをメタ文字として解釈し、他は全てリテラル
fn wildcard_to_like(s: &str) -> String {
    let mut pattern = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '*' => pattern.push('%'),
            '\\' | '%' | '_' => {
                pattern.push('\\');
                pattern.push(ch);
            }
            _ => pattern.push(ch),
        }
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::unix_seconds;
    use tempfile::tempdir;

    fn create_test_shard(dir: &Path) -> ShardDb {
        let shard = ShardDb::open(dir.join("db-0.db"), 0).unwrap();
        shard.init().unwrap();
        shard
    }

    fn create_test_item(key: &str, expires_at: i64) -> CacheItem {
        CacheItem {
            key: key.to_string(),
            header_size: 128,
            body_size: 4096,
            meta_size: 32,
            expires_at,
            stale_at: expires_at + 600,
            created_at: unix_seconds(),
            host: "example.com".to_string(),
            server_id: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_like_escaping() {
        assert_eq!(escape_like("https://a/b"), "https://a/b");
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
        assert_eq!(wildcard_to_like("https://*.example.com/x"), "https://%.example.com/x");
        assert_eq!(wildcard_to_like("a_b*c%"), "a\\_b%c\\%");
    }

    #[test]
    fn test_open_and_init() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());
        assert!(shard.is_ready());
        assert_eq!(shard.total(), 0);
        shard.close().unwrap();
    }

    #[test]
    fn test_add_and_exists() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        let item = create_test_item("https://example.com/index.html", unix_seconds() + 60);
        shard.add_async("hash-1", &item).unwrap();
        assert!(shard.presence().contains("hash-1"));

        assert!(shard.wait_idle(Duration::from_secs(5)));
        let expires = shard.exists_by_hash("hash-1", unix_seconds()).unwrap();
        assert_eq!(expires, Some(item.expires_at));
        shard.close().unwrap();
    }

    #[test]
    fn test_exists_filters_expired() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        let item = create_test_item("https://example.com/old", unix_seconds() - 10);
        shard.add_async("hash-old", &item).unwrap();
        assert!(shard.wait_idle(Duration::from_secs(5)));

        assert!(shard
            .exists_by_hash("hash-old", unix_seconds())
            .unwrap()
            .is_none());
        shard.close().unwrap();
    }

    #[test]
    fn test_select_by_hash() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        let item = create_test_item("https://example.com/page", unix_seconds() + 60);
        shard.add_async("hash-2", &item).unwrap();
        assert!(shard.wait_idle(Duration::from_secs(5)));

        let row = shard.select_by_hash("hash-2").unwrap().unwrap();
        assert_eq!(row.key, "https://example.com/page");
        assert_eq!(row.body_size, 4096);
        assert_eq!(row.host, "example.com");

        assert!(shard.select_by_hash("missing").unwrap().is_none());
        shard.close().unwrap();
    }

    #[test]
    fn test_delete_async() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        let item = create_test_item("https://example.com/x", unix_seconds() + 60);
        shard.add_async("hash-3", &item).unwrap();
        shard.delete_async("hash-3").unwrap();
        assert!(shard.wait_idle(Duration::from_secs(5)));

        assert_eq!(shard.count_rows(), 0);
        shard.close().unwrap();
    }

    #[test]
    fn test_writes_are_applied_in_order() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        // 同一ハッシュへの挿入→削除→挿入はFIFOで適用される
        let item = create_test_item("https://example.com/y", unix_seconds() + 60);
        shard.add_async("hash-4", &item).unwrap();
        shard.delete_async("hash-4").unwrap();
        shard.add_async("hash-4", &item).unwrap();
        assert!(shard.wait_idle(Duration::from_secs(5)));

        assert_eq!(shard.count_rows(), 1);
        shard.close().unwrap();
    }

    #[test]
    fn test_not_ready_is_noop() {
        let dir = tempdir().unwrap();
        let shard = ShardDb::open(dir.path().join("db-0.db"), 0).unwrap();
        assert!(!shard.is_ready());

        let item = create_test_item("https://example.com/z", unix_seconds() + 60);
        assert!(shard.add_async("hash-5", &item).is_ok());
        assert!(shard.delete_async("hash-5").is_ok());
        assert!(shard.increase_hit_async("hash-5").is_ok());
        assert!(!shard.presence().contains("hash-5"));
    }

    #[test]
    fn test_list_expired_items() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        for i in 0..5 {
            let item = create_test_item(&format!("https://example.com/e{}", i), unix_seconds() - 10);
            shard.add_async(&format!("expired-{}", i), &item).unwrap();
        }
        let fresh = create_test_item("https://example.com/fresh", unix_seconds() + 3600);
        shard.add_async("fresh", &fresh).unwrap();
        assert!(shard.wait_idle(Duration::from_secs(5)));

        let expired = shard.list_expired_items(10).unwrap();
        assert_eq!(expired.len(), 5);
        assert!(!expired.contains(&"fresh".to_string()));

        // limitが効く
        assert_eq!(shard.list_expired_items(2).unwrap().len(), 2);
        shard.close().unwrap();
    }

    #[test]
    fn test_list_lfu_items_orders_by_hits() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        let mut cold = create_test_item("https://example.com/cold", unix_seconds() + 3600);
        cold.created_at = unix_seconds() - 100;
        shard.add_async("cold", &cold).unwrap();

        let hot = create_test_item("https://example.com/hot", unix_seconds() + 3600);
        shard.add_async("hot", &hot).unwrap();
        for _ in 0..5 {
            shard.increase_hit_async("hot").unwrap();
        }
        assert!(shard.wait_idle(Duration::from_secs(5)));

        let order = shard.list_lfu_items(10).unwrap();
        assert_eq!(order, vec!["cold".to_string(), "hot".to_string()]);
        shard.close().unwrap();
    }

    #[test]
    fn test_stat() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        for i in 0..3 {
            let item = create_test_item(&format!("https://example.com/{}", i), unix_seconds() + 60);
            shard.add_async(&format!("hash-{}", i), &item).unwrap();
        }
        assert!(shard.wait_idle(Duration::from_secs(5)));

        let stat = shard.stat().unwrap();
        assert_eq!(stat.count, 3);
        assert_eq!(stat.size, 3 * (128 + 4096 + 32));
        assert_eq!(stat.value_size, 3 * 4096);
        shard.close().unwrap();
    }

    #[test]
    fn test_clean_prefix() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        shard
            .add_async("a", &create_test_item("https://example.com/api/1", unix_seconds() + 60))
            .unwrap();
        shard
            .add_async("b", &create_test_item("https://example.com/static/1", unix_seconds() + 60))
            .unwrap();
        assert!(shard.wait_idle(Duration::from_secs(5)));

        shard.clean_prefix("https://example.com/api/").unwrap();
        assert_eq!(shard.count_rows(), 1);
        assert_eq!(shard.total(), 1);
        // 在庫セットも再構築される
        assert!(!shard.presence().contains("a"));
        assert!(shard.presence().contains("b"));
        shard.close().unwrap();
    }

    #[test]
    fn test_clean_match_key() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        shard
            .add_async("a", &create_test_item("https://www.example.com/hello", unix_seconds() + 60))
            .unwrap();
        shard
            .add_async("b", &create_test_item("https://cdn.example.com/hello", unix_seconds() + 60))
            .unwrap();
        shard
            .add_async("c", &create_test_item("https://cdn.example.com/other", unix_seconds() + 60))
            .unwrap();
        assert!(shard.wait_idle(Duration::from_secs(5)));

        shard.clean_match_key("https://*.example.com/hello").unwrap();
        assert_eq!(shard.count_rows(), 1);
        assert!(shard.presence().contains("c"));
        shard.close().unwrap();
    }

    #[test]
    fn test_clean_match_prefix() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        shard
            .add_async("a", &create_test_item("https://www.example.com/assets/app.js", unix_seconds() + 60))
            .unwrap();
        shard
            .add_async("b", &create_test_item("https://www.example.com/index.html", unix_seconds() + 60))
            .unwrap();
        assert!(shard.wait_idle(Duration::from_secs(5)));

        shard.clean_match_prefix("https://*.example.com/assets/").unwrap();
        assert_eq!(shard.count_rows(), 1);
        shard.close().unwrap();
    }

    #[test]
    fn test_clean_all() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        for i in 0..4 {
            let item = create_test_item(&format!("https://example.com/{}", i), unix_seconds() + 60);
            shard.add_async(&format!("hash-{}", i), &item).unwrap();
            shard.increase_hit_async(&format!("hash-{}", i)).unwrap();
        }
        assert!(shard.wait_idle(Duration::from_secs(5)));

        shard.clean_all().unwrap();
        assert_eq!(shard.count_rows(), 0);
        assert_eq!(shard.total(), 0);
        assert!(shard.presence().is_empty());
        shard.close().unwrap();
    }

    #[test]
    fn test_close_drains_queue() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());

        for i in 0..50 {
            let item = create_test_item(&format!("https://example.com/{}", i), unix_seconds() + 60);
            shard.add_async(&format!("hash-{}", i), &item).unwrap();
        }
        shard.close().unwrap();

        // クローズ後に開き直すと全件が永続化されている
        let reopened = create_test_shard(dir.path());
        assert_eq!(reopened.total(), 50);
        reopened.close().unwrap();
    }

    #[test]
    fn test_reopen_restores_presence() {
        let dir = tempdir().unwrap();
        let shard = create_test_shard(dir.path());
        let item = create_test_item("https://example.com/persist", unix_seconds() + 60);
        shard.add_async("persist-hash", &item).unwrap();
        shard.close().unwrap();

        let reopened = create_test_shard(dir.path());
        assert!(reopened.presence().contains("persist-hash"));
        assert_eq!(reopened.total(), 1);
        reopened.close().unwrap();
    }
}
