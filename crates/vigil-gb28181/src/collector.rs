// 目录收集器
// 设备的目录以若干条 MESSAGE 分片上报；每个分片延长静默计时，
// 静默窗口内无新分片即认为完整，合并去重后一次性吐出

use crate::manscdp::CatalogItem;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// 静默窗口：最后一个分片之后等待这么久再发射
pub const DEFAULT_QUIESCENCE: Duration = Duration::from_secs(1);

struct Bucket {
    items: Vec<CatalogItem>,
    seen: HashSet<String>,
    sum_num: u32,
    last_append: Instant,
}

/// 按设备聚合目录分片的收集器
pub struct CatalogCollector {
    buckets: DashMap<String, Bucket>,
    window: Duration,
}

impl Default for CatalogCollector {
    fn default() -> Self {
        Self::new(DEFAULT_QUIESCENCE)
    }
}

impl CatalogCollector {
    pub fn new(window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            window,
        }
    }

    /// 追加一个分片：去重键为通道外部 ID，保留首次出现顺序
    pub fn push(&self, device_id: &str, sum_num: u32, chunk: Vec<CatalogItem>) {
        let mut bucket = self.buckets.entry(device_id.to_string()).or_insert_with(|| Bucket {
            items: Vec::new(),
            seen: HashSet::new(),
            sum_num,
            last_append: Instant::now(),
        });
        if sum_num > 0 {
            bucket.sum_num = sum_num;
        }
        for item in chunk {
            if bucket.seen.insert(item.device_id.clone()) {
                bucket.items.push(item);
            }
        }
        bucket.last_append = Instant::now();
        debug!(
            device_id,
            collected = bucket.items.len(),
            sum_num = bucket.sum_num,
            "catalog chunk appended"
        );
    }

    /// 取走所有已静默的桶，每个桶恰好发射一次
    pub fn drain_quiescent(&self) -> Vec<(String, Vec<CatalogItem>)> {
        let ready: Vec<String> = self
            .buckets
            .iter()
            .filter(|e| e.value().last_append.elapsed() >= self.window)
            .map(|e| e.key().clone())
            .collect();

        ready
            .into_iter()
            .filter_map(|key| self.buckets.remove(&key).map(|(k, b)| (k, b.items)))
            .collect()
    }

    /// 启动后台扫描任务，静默的桶交给 emit 回调
    pub fn spawn<F, Fut>(self: Arc<Self>, emit: F)
    where
        F: Fn(String, Vec<CatalogItem>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(200));
            loop {
                interval.tick().await;
                for (device_id, items) in self.drain_quiescent() {
                    emit(device_id, items).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> CatalogItem {
        CatalogItem {
            device_id: id.to_string(),
            name: format!("ch-{id}"),
            status: "ON".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_chunks_merge_and_dedup() {
        let c = CatalogCollector::new(Duration::from_millis(0));
        c.push("dev", 3, vec![item("a"), item("b")]);
        c.push("dev", 3, vec![item("b"), item("c")]);

        let out = c.drain_quiescent();
        assert_eq!(out.len(), 1);
        let (device_id, items) = &out[0];
        assert_eq!(device_id, "dev");
        let ids: Vec<&str> = items.iter().map(|i| i.device_id.as_str()).collect();
        // 去重且保持首次出现顺序
        assert_eq!(ids, vec!["a", "b", "c"]);
        // 只发射一次
        assert!(c.drain_quiescent().is_empty());
    }

    #[test]
    fn test_not_quiescent_yet() {
        let c = CatalogCollector::new(Duration::from_secs(60));
        c.push("dev", 1, vec![item("a")]);
        assert!(c.drain_quiescent().is_empty());
        // 桶仍然保留，后续分片继续累积
        c.push("dev", 1, vec![item("b")]);
    }

    #[test]
    fn test_independent_devices() {
        let c = CatalogCollector::new(Duration::from_millis(0));
        c.push("dev1", 1, vec![item("a")]);
        c.push("dev2", 1, vec![item("b")]);
        let mut out = c.drain_quiescent();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, "dev1");
        assert_eq!(out[1].0, "dev2");
    }
}
