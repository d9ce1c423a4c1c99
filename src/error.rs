//! # キャッシュエラー定義
//!
//! キャッシュコアのエラー型と、各コンポーネント共通の`Result`型を提供します。

use std::fmt;
use std::io;

/// キャッシュ操作の結果型
pub type Result<T> = std::result::Result<T, CacheError>;

/// キャッシュエラー
#[derive(Debug)]
pub enum CacheError {
    /// シャードが未初期化
    ///
    /// 書き込みはno-op、読み込みは空として扱われるソフトエラー
    NotReady,
    /// エントリが見つからない
    ///
    /// 削除経路でヒット行の整理判断に使用する情報的エラー
    NotFound,
    /// 非同期書き込みキューが満杯
    ///
    /// 一時的エラーとして呼び出し元へ返す。内部でのリトライは行わない
    QueueFull,
    /// コンポーネントがクローズ済み
    Closed,
    /// データベースエラー
    Database(rusqlite::Error),
    /// I/Oエラー
    Io(io::Error),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "shard is not ready"),
            Self::NotFound => write!(f, "item not found"),
            Self::QueueFull => write!(f, "write queue is full"),
            Self::Closed => write!(f, "component is closed"),
            Self::Database(err) => write!(f, "database error: {}", err),
            Self::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Database(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl CacheError {
    /// ソフトエラー（no-opとして扱える）かどうか
    #[inline]
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::NotReady | Self::NotFound)
    }
}
