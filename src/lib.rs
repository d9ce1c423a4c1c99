//! # veilコンテンツキャッシュコア
//!
//! エッジリバースプロキシノードのコンテンツキャッシュサブシステムを提供します。
//! キャッシュ済みHTTPレスポンスのインデックスをディスク上の20シャードへ分割して
//! 永続化し、メモリ上のホットパスと組み合わせて配信パスから参照されます。
//!
//! ## 特徴
//!
//! - **シャード化インデックス**: フィンガープリントの安定ハッシュで20分割
//! - **在庫セット**: 不在判定を確定できるメモリ上のフィルタ
//! - **TTLメモリキャッシュ**: 存在確認のホットパス短絡と汎用カウンタ
//! - **非同期書き込み**: シャードごとの有界キュー + 単一ライタースレッド
//! - **パージ**: 期限切れスイープとLFUエビクション、前綴・ワイルドカード削除
//! - **ハンドルプール**: バージョン付きオープンファイルの再利用
//! - **オンライン移行**: 旧単一ファイルインデックスからの起動時アップグレード
//!
//! ## アーキテクチャ
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  FileList                                   │
//! │  ├─ MemoryCache (TTL)                       │← 存在確認の短絡
//! │  ├─ ShardDb × 20                            │← 永続インデックス
//! │  │   ├─ PresenceSet                         │← 不在フィルタ
//! │  │   └─ writer thread (batched)             │← 書き込み集約
//! │  └─ UpgradeWorker (background)              │← 旧DB移行
//! ├─────────────────────────────────────────────┤
//! │  PurgeScheduler                             │← 定期スイープ
//! │  OpenFileCache → OpenFilePool               │← 配信パスのハンドル再利用
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## 使用例
//!
//! ```rust,no_run
//! use veil_cache::{CacheItem, FileList};
//!
//! let list = FileList::new("/var/cache/veil/index");
//! list.init().unwrap();
//!
//! let item = CacheItem {
//!     key: "https://example.com/index.html".to_string(),
//!     body_size: 4096,
//!     expires_at: 1_900_000_000,
//!     ..Default::default()
//! };
//! list.add("fingerprint", item).unwrap();
//! assert!(list.exist("fingerprint").unwrap());
//! ```

mod clock;
mod config;
mod error;
mod fingerprint;
mod item;
mod list;
mod memory;
mod open_file;
mod presence;
mod shard;
mod sweeper;
mod upgrade;

pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use fingerprint::{hash_fingerprint, shard_index, SHARD_COUNT};
pub use item::{CacheItem, ItemType, Stat};
pub use list::{FileList, ItemObserver};
pub use memory::MemoryCache;
pub use open_file::{OpenFile, OpenFileCache, OpenFilePool};
pub use presence::PresenceSet;
pub use shard::ShardDb;
pub use sweeper::PurgeScheduler;
pub use upgrade::upgrade_legacy_index;
