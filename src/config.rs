//! キャッシュ設定

use serde::Deserialize;
use std::path::PathBuf;

/// デフォルト値関数
fn default_purge_interval() -> u64 { 30 }
fn default_purge_batch() -> usize { 1000 }
fn default_memory_sweep_interval() -> u64 { 60 }

/// キャッシュ設定
#[derive(Deserialize, Clone, Debug)]
pub struct CacheConfig {
    /// キャッシュルートディレクトリ
    ///
    /// インデックスシャード（db-0.db〜db-19.db）の保存先
    pub dir: PathBuf,

    /// 旧レイアウトのインデックスディレクトリ
    ///
    /// 設定されている場合、初期化時にバックグラウンドで
    /// 旧index.dbからの移行を実行
    #[serde(default)]
    pub old_dir: Option<PathBuf>,

    /// アイテム数の上限
    ///
    /// 超過分はLFUエビクションの対象。0で無制限
    ///
    /// デフォルト: 0
    #[serde(default)]
    pub max_items: u64,

    /// 期限切れスイープの実行間隔（秒）
    ///
    /// デフォルト: 30秒
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// 1回のスイープで走査するアイテム数
    ///
    /// デフォルト: 1000
    #[serde(default = "default_purge_batch")]
    pub purge_batch: usize,

    /// メモリキャッシュの回収スイープ間隔（秒）
    ///
    /// デフォルト: 60秒
    #[serde(default = "default_memory_sweep_interval")]
    pub memory_sweep_interval_secs: u64,
}

impl CacheConfig {
    /// 指定ディレクトリのデフォルト設定を作成
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            old_dir: None,
            max_items: 0,
            purge_interval_secs: default_purge_interval(),
            purge_batch: default_purge_batch(),
            memory_sweep_interval_secs: default_memory_sweep_interval(),
        }
    }
}
