use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_failed: AtomicU64,
    pub rate_limited: AtomicU64,
    pub timeouts: AtomicU64,
    pub retries: AtomicU64,
    pub content_policy: AtomicU64,
    pub items_failed: AtomicU64,
    pub stages_completed: AtomicU64,
    pub stage_duration_sum_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts every 429, whether or not a retry follows.
    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_content_policy(&self) {
        self.content_policy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item_failed(&self) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_stage(&self, duration_ms: u64) {
        self.stages_completed.fetch_add(1, Ordering::Relaxed);
        self.stage_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let requests_failed = self.requests_failed.load(Ordering::Relaxed);
        let rate_limited = self.rate_limited.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);
        let retries = self.retries.load(Ordering::Relaxed);
        let content_policy = self.content_policy.load(Ordering::Relaxed);
        let items_failed = self.items_failed.load(Ordering::Relaxed);
        let stages_completed = self.stages_completed.load(Ordering::Relaxed);
        let dur_sum = self.stage_duration_sum_ms.load(Ordering::Relaxed);

        format!(
            "# HELP polyeval_requests_total Chat completion calls issued.\n\
             # TYPE polyeval_requests_total counter\n\
             polyeval_requests_total {}\n\
             # HELP polyeval_requests_failed Chat completion calls that returned an error.\n\
             # TYPE polyeval_requests_failed counter\n\
             polyeval_requests_failed {}\n\
             # HELP polyeval_rate_limited Rate-limit responses received.\n\
             # TYPE polyeval_rate_limited counter\n\
             polyeval_rate_limited {}\n\
             # HELP polyeval_timeouts Request timeouts.\n\
             # TYPE polyeval_timeouts counter\n\
             polyeval_timeouts {}\n\
             # HELP polyeval_retries Retries of any kind.\n\
             # TYPE polyeval_retries counter\n\
             polyeval_retries {}\n\
             # HELP polyeval_content_policy Content-policy refusals replaced by the sentinel.\n\
             # TYPE polyeval_content_policy counter\n\
             polyeval_content_policy {}\n\
             # HELP polyeval_items_failed Jobs whose result slot stayed empty.\n\
             # TYPE polyeval_items_failed counter\n\
             polyeval_items_failed {}\n\
             # HELP polyeval_stages_completed Dispatcher stages finished.\n\
             # TYPE polyeval_stages_completed counter\n\
             polyeval_stages_completed {}\n\
             # HELP polyeval_stage_duration_ms_sum Sum of stage durations in ms.\n\
             # TYPE polyeval_stage_duration_ms_sum counter\n\
             polyeval_stage_duration_ms_sum {}\n",
            requests_total,
            requests_failed,
            rate_limited,
            timeouts,
            retries,
            content_policy,
            items_failed,
            stages_completed,
            dur_sum
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let m = Metrics::new();
        m.record_request();
        m.record_request();
        m.record_rate_limited();
        m.record_retry();
        m.record_timeout();
        assert_eq!(m.requests_total.load(Ordering::Relaxed), 2);
        assert_eq!(m.rate_limited.load(Ordering::Relaxed), 1);
        assert_eq!(m.retries.load(Ordering::Relaxed), 2);

        m.finish_stage(1500);
        assert_eq!(m.stages_completed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_output() {
        let m = Metrics::new();
        m.record_request();
        m.record_item_failed();
        m.finish_stage(1234);
        let out = m.render_prometheus();
        assert!(out.contains("polyeval_requests_total 1"));
        assert!(out.contains("polyeval_items_failed 1"));
        assert!(out.contains("polyeval_stage_duration_ms_sum 1234"));
    }
}
