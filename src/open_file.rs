//! オープンファイルプール
//!
//! 配信パスが同じキャッシュファイルを繰り返し読むときの
//! open/closeシステムコールを削減するため、使用済みファイルハンドルを
//! ファイル名ごとのプールへ返却して再利用します。
//!
//! プール作成時に刻印される`version`は単調増加で、ローテーション後の
//! 古いハンドルが`put`で戻されても受け付けずにクローズします。
//! これにより、キャッシュエビクションと進行中のリーダーが競合しません。

use crate::clock;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// プールが保持できるハンドル数の上限
const POOL_CAPACITY: usize = 1024;

/// プールバージョンの採番元
///
/// Unixミリ秒をベースに、同一ミリ秒内の連続作成でも
/// 重複しないよう単調増加を保証する
static LAST_POOL_VERSION: AtomicI64 = AtomicI64::new(0);

fn next_pool_version() -> i64 {
    let now = clock::unix_millis();
    let mut last = LAST_POOL_VERSION.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_POOL_VERSION.compare_exchange_weak(
            last,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// 再利用可能なオープンファイルハンドル
#[derive(Debug)]
pub struct OpenFile {
    file: File,
    version: i64,
}

impl OpenFile {
    /// ファイルハンドルをラップ
    ///
    /// バージョン0は未刻印を意味し、どのプールにも返却できます
    pub fn new(file: File) -> Self {
        Self { file, version: 0 }
    }

    /// 読み取り位置を先頭へ戻す
    pub fn seek_start(&mut self) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// 刻印されたプールバージョン
    #[inline]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// 内部のファイルハンドルへの参照
    #[inline]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// 内部のファイルハンドルへの可変参照
    #[inline]
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

/// オープンファイルプール
///
/// 1つのキャッシュファイル名に対して1プール。
/// `get`/`put`はノンブロッキングで、満杯や不一致のハンドルは
/// その場でクローズされます。
pub struct OpenFilePool {
    filename: String,
    version: i64,
    files: Mutex<VecDeque<OpenFile>>,
    is_closed: AtomicBool,
}

impl OpenFilePool {
    /// 指定ファイル名のプールを作成
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            version: next_pool_version(),
            files: Mutex::new(VecDeque::new()),
            is_closed: AtomicBool::new(false),
        }
    }

    /// プール対象のファイル名
    #[inline]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// プールのバージョン
    #[inline]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// ハンドルを取り出す
    ///
    /// 返値は(ハンドル, プール内にエントリがあったか)。
    /// 取り出したハンドルは先頭へシークし、現在のバージョンを刻印して返します。
    /// シークに失敗したハンドルはクローズし、(None, true)を返します。
    pub fn get(&self) -> (Option<OpenFile>, bool) {
        if self.is_closed.load(Ordering::Acquire) {
            return (None, false);
        }

        let mut file = {
            let mut files = match self.files.lock() {
                Ok(f) => f,
                Err(_) => return (None, false),
            };
            match files.pop_front() {
                Some(file) => file,
                None => return (None, false),
            }
        };

        if file.seek_start().is_err() {
            // ハンドルは壊れている。クローズして「在庫はあった」ことだけ伝える
            return (None, true);
        }
        file.version = self.version;
        (Some(file), true)
    }

    /// ハンドルを返却する
    ///
    /// クローズ済み、バージョン不一致、満杯の場合はハンドルをクローズして
    /// falseを返します。
    pub fn put(&self, file: OpenFile) -> bool {
        if self.is_closed.load(Ordering::Acquire) {
            return false;
        }

        // 別世代のプールで刻印されたハンドルは受け付けない
        if self.version > 0 && file.version > 0 && file.version != self.version {
            return false;
        }

        let mut files = match self.files.lock() {
            Ok(f) => f,
            Err(_) => return false,
        };
        if files.len() >= POOL_CAPACITY {
            return false;
        }
        files.push_back(file);
        true
    }

    /// 現在プールされているハンドル数
    pub fn len(&self) -> usize {
        self.files.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// プールが空かどうか
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// クローズ予約
    ///
    /// 以後の`get`/`put`を拒否します。プール内のハンドルは`close`まで残ります。
    pub fn set_closing(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    /// プールをクローズ
    ///
    /// 保持している全ハンドルをクローズします
    pub fn close(&self) {
        self.is_closed.store(true, Ordering::Release);
        if let Ok(mut files) = self.files.lock() {
            files.clear();
        }
    }
}

/// プールエントリ
struct PoolEntry {
    pool: Arc<OpenFilePool>,
    last_used: Instant,
}

/// オープンファイルキャッシュ
///
/// ファイル名からプールへのプロセス全体のマップ。
/// 配信パスはここからハンドルを借り、読み終えたら返却します。
pub struct OpenFileCache {
    pools: DashMap<String, PoolEntry>,
    max_pools: usize,
}

impl OpenFileCache {
    /// 最大プール数を指定してキャッシュを作成
    pub fn new(max_pools: usize) -> Self {
        Self {
            pools: DashMap::new(),
            max_pools: max_pools.max(1),
        }
    }

    /// ファイル名に対応するプールからハンドルを取得
    pub fn get(&self, filename: &str) -> Option<OpenFile> {
        let mut entry = self.pools.get_mut(filename)?;
        entry.last_used = Instant::now();
        let (file, _) = entry.pool.get();
        file
    }

    /// ハンドルを返却
    ///
    /// プールが無ければ作成します。返値は受け付けられたかどうか。
    pub fn put(&self, filename: &str, file: OpenFile) -> bool {
        if self.pools.len() >= self.max_pools && !self.pools.contains_key(filename) {
            self.evict_oldest();
        }

        let entry = self
            .pools
            .entry(filename.to_string())
            .or_insert_with(|| PoolEntry {
                pool: Arc::new(OpenFilePool::new(filename)),
                last_used: Instant::now(),
            });
        entry.pool.put(file)
    }

    /// ファイル名のプールを無効化
    ///
    /// キャッシュファイルのエビクション時に呼びます。
    /// 進行中のリーダーが後から返却する古いハンドルは
    /// クローズ済みプールまたはバージョン不一致として拒否されます。
    pub fn invalidate(&self, filename: &str) {
        if let Some((_, entry)) = self.pools.remove(filename) {
            entry.pool.close();
        }
    }

    /// 現在のプール数
    #[inline]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// キャッシュが空かどうか
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// 全プールをクローズ
    pub fn close(&self) {
        for entry in self.pools.iter() {
            entry.value().pool.close();
        }
        self.pools.clear();
    }

    /// 最も使われていないプールを1つ削除
    fn evict_oldest(&self) {
        let mut oldest: Option<(String, Instant)> = None;
        for entry in self.pools.iter() {
            let last_used = entry.value().last_used;
            match &oldest {
                Some((_, time)) if *time <= last_used => {}
                _ => oldest = Some((entry.key().clone(), last_used)),
            }
        }
        if let Some((filename, _)) = oldest {
            self.invalidate(&filename);
        }
    }
}
