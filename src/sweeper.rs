//! パージスケジューラ
//!
//! バックグラウンドスレッドで期限切れスイープを定期実行し、
//! アイテム数が上限を超えたときにLFUエビクションを行います。

use crate::config::CacheConfig;
use crate::list::FileList;
use ftlog::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// パージスケジューラ
pub struct PurgeScheduler {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PurgeScheduler {
    /// スケジューラを起動
    pub fn start(list: Arc<FileList>, config: &CacheConfig) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let interval = Duration::from_secs(config.purge_interval_secs.max(1));
        let batch = config.purge_batch.max(1);
        let max_items = config.max_items;

        let handle = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                info!("[Sweeper] started");
                let slice = Duration::from_millis(500);
                let mut waited = Duration::ZERO;
                loop {
                    thread::sleep(slice);
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    waited += slice;
                    if waited < interval {
                        continue;
                    }
                    waited = Duration::ZERO;

                    run_once(&list, batch, max_items);
                }
                info!("[Sweeper] stopped");
            })
        };

        Self {
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// スケジューラを停止して合流
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PurgeScheduler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// 1周期分のスイープ
fn run_once(list: &FileList, batch: usize, max_items: u64) {
    match list.purge(batch, |_hash| Ok(())) {
        Ok(found) if found > 0 => {
            info!("[Sweeper] purged {} expired items", found);
        }
        Ok(_) => {}
        Err(err) => {
            error!("[Sweeper] purge failed: {}", err);
            return;
        }
    }

    // アイテム数の超過分をLFUで回収
    if max_items > 0 {
        let over = list.count() - max_items as i64;
        if over > 0 {
            match list.purge_lfu(over as usize, |_hash| Ok(())) {
                Ok(evicted) => {
                    info!("[Sweeper] evicted {} items over capacity", evicted);
                }
                Err(err) => {
                    error!("[Sweeper] lfu eviction failed: {}", err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::unix_seconds;
    use crate::item::CacheItem;
    use tempfile::tempdir;

    fn create_test_item(key: &str, expires_at: i64) -> CacheItem {
        CacheItem {
            key: key.to_string(),
            body_size: 512,
            expires_at,
            stale_at: expires_at + 600,
            created_at: unix_seconds(),
            host: "example.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_scheduler_purges_expired() {
        let dir = tempdir().unwrap();
        let list = FileList::new(dir.path().join("index"));
        list.init().unwrap();

        for i in 0..5 {
            let item = create_test_item(&format!("https://example.com/{}", i), unix_seconds() - 10);
            list.add(&format!("hash-{}", i), item).unwrap();
        }
        assert!(list.wait_idle(Duration::from_secs(5)));
        assert_eq!(list.count(), 5);

        let mut config = CacheConfig::new(dir.path().join("index"));
        config.purge_interval_secs = 1;
        let scheduler = PurgeScheduler::start(Arc::clone(&list), &config);

        // 1周期を待って全件回収されていること
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while list.count() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(100));
        }
        assert_eq!(list.count(), 0);

        scheduler.stop();
        list.close().unwrap();
    }

    #[test]
    fn test_stop_joins_thread() {
        let dir = tempdir().unwrap();
        let list = FileList::new(dir.path().join("index"));
        list.init().unwrap();

        let config = CacheConfig::new(dir.path().join("index"));
        let scheduler = PurgeScheduler::start(Arc::clone(&list), &config);
        scheduler.stop();
        list.close().unwrap();
    }
}
