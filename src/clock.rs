//! 時刻ユーティリティ

use std::time::{SystemTime, UNIX_EPOCH};

/// 現在のUnix時刻（秒）
#[inline]
pub(crate) fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// 現在のUnix時刻（ミリ秒）
#[inline]
pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// 現在の週番号（Unixエポック起点）
///
/// ヒットカウンタのローリングウィンドウに使用
#[inline]
pub(crate) fn unix_week() -> i64 {
    unix_seconds() / (86400 * 7)
}
