//! キャッシュアイテム
//!
//! フィンガープリントに紐づく永続インデックスの値と、
//! 集計統計の行を定義します。

/// アイテム種別
///
/// 永続インデックスに保存されるのはFileのみ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemType {
    /// ファイルキャッシュ
    #[default]
    File,
}

/// キャッシュアイテム
///
/// インデックスシャードの1行に対応するメタデータ。
/// ボディ本体はキャッシュファイルとして別管理されます。
#[derive(Debug, Clone, Default)]
pub struct CacheItem {
    /// アイテム種別
    pub item_type: ItemType,
    /// 元のリクエストキー（URL形式、ワイルドカードマッチに使用）
    pub key: String,
    /// ヘッダーサイズ（バイト）
    pub header_size: i64,
    /// ボディサイズ（バイト）
    pub body_size: i64,
    /// メタデータサイズ（バイト）
    pub meta_size: i64,
    /// 有効期限（Unix秒）
    pub expires_at: i64,
    /// stale提供期限（Unix秒、expires_at以上）
    pub stale_at: i64,
    /// 作成時刻（Unix秒）
    pub created_at: i64,
    /// 所属ホスト
    pub host: String,
    /// 所属サーバーID
    pub server_id: i64,
    /// ヒットカウンタの週番号
    pub week: i64,
    /// 前週のヒット数
    pub week1_hits: i64,
    /// 今週のヒット数
    pub week2_hits: i64,
}

impl CacheItem {
    /// 合計サイズ（ヘッダー + ボディ + メタデータ）
    #[inline]
    pub fn total_size(&self) -> i64 {
        self.header_size + self.body_size + self.meta_size
    }

    /// 指定時刻で期限切れかどうか
    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// キャッシュ統計
///
/// シャード横断の集計結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// アイテム数
    pub count: i64,
    /// 合計サイズ（ヘッダー + ボディ + メタデータ）
    pub size: i64,
    /// ボディ合計サイズ
    pub value_size: i64,
}
