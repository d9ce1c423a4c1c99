//! 旧レイアウトからの移行
//!
//! 旧バージョンは単一ファイル`index.db`の`cacheItems_v3`テーブルへ
//! 全アイテムを保存していました。プロセス起動時にバックグラウンドで
//! 一度だけ、シャード化されたレイアウトへ移行します。
//!
//! 定常トラフィックを妨げないよう、主キー順に10,000行ずつ読み出し、
//! バッチ間で1秒スリープします。全行の移行後に旧ファイルを削除します。

use crate::error::Result;
use crate::item::CacheItem;
use crate::list::FileList;
use ftlog::{info, warn};
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use std::thread;
use std::time::Duration;

/// 1バッチで読み出す行数
const BATCH_SIZE: usize = 10_000;

/// バッチ間のスリープ
const BATCH_INTERVAL: Duration = Duration::from_secs(1);

const STMT_SELECT_LEGACY: &str = "SELECT hash, key, headerSize, bodySize, metaSize, expiredAt, \
     staleAt, createdAt, host, serverId FROM cacheItems_v3 \
     ORDER BY id ASC LIMIT ?1 OFFSET ?2";

/// 旧インデックスを移行
///
/// `old_dir/index.db`が無ければ何もしません。
/// `strict`がfalse（バックグラウンド実行のデフォルト）の場合、
/// 行単位のエラーはログに残してスキップします。
pub fn upgrade_legacy_index(list: &FileList, old_dir: &Path, strict: bool) -> Result<()> {
    let index_path = old_dir.join("index.db");
    if !index_path.exists() {
        return Ok(());
    }
    info!(
        "[Upgrade] upgrading local database from '{}' ...",
        old_dir.display()
    );

    {
        let conn = open_legacy(&index_path)?;
        let mut offset = 0usize;

        loop {
            let migrated = migrate_batch(list, &conn, offset, strict)?;
            if migrated == 0 {
                break;
            }
            offset += BATCH_SIZE;
            thread::sleep(BATCH_INTERVAL);
        }
    }

    std::fs::remove_file(&index_path)?;
    info!("[Upgrade] upgrading local database finished");
    Ok(())
}

/// 旧インデックスを開く
///
/// 進行中の処理を妨げないようWAL + 非同期書き込みで開く
fn open_legacy(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
    conn.pragma_update(None, "synchronous", "OFF")?;
    Ok(conn)
}

/// 1バッチ分を移行して読み出した行数を返す
fn migrate_batch(list: &FileList, conn: &Connection, offset: usize, strict: bool) -> Result<usize> {
    let mut stmt = conn.prepare_cached(STMT_SELECT_LEGACY)?;
    let rows = stmt.query_map(params![BATCH_SIZE as i64, offset as i64], |row| {
        let hash: String = row.get(0)?;
        let item = CacheItem {
            key: row.get(1)?,
            header_size: row.get(2)?,
            body_size: row.get(3)?,
            meta_size: row.get(4)?,
            expires_at: row.get(5)?,
            stale_at: row.get(6)?,
            created_at: row.get(7)?,
            host: row.get(8)?,
            server_id: row.get(9)?,
            ..Default::default()
        };
        Ok((hash, item))
    })?;

    let mut count = 0usize;
    for row in rows {
        count += 1;
        let (hash, item) = match row {
            Ok(pair) => pair,
            Err(err) => {
                if strict {
                    return Err(err.into());
                }
                warn!("[Upgrade] skipping broken row: {}", err);
                continue;
            }
        };

        if let Err(err) = list.add(&hash, item) {
            if strict {
                return Err(err);
            }
            warn!("[Upgrade] skipping item '{}': {}", hash, err);
        }
    }
    Ok(count)
}
