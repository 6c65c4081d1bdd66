use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    plans: CounterVec,
    optimize_seconds: HistogramVec,
    errors: CounterVec,
    snapshot_rejections: CounterVec,
    gc_toggles: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record one successful planning call on `path`
    /// (`fast`, `rule_pipeline`, `cascades`, `execute`, `non_logical`).
    pub fn record_plan(&self, path: &str, secs: f64) {
        self.inner.plans.with_label_values(&[path]).inc();
        self.inner
            .optimize_seconds
            .with_label_values(&[path])
            .observe(secs.max(0.0));
    }

    pub fn record_error(&self, kind: &str) {
        self.inner.errors.with_label_values(&[kind]).inc();
    }

    pub fn inc_snapshot_rejections(&self) {
        self.inner
            .snapshot_rejections
            .with_label_values(&["gc_safe_point"])
            .inc();
    }

    pub fn inc_gc_toggles(&self, enabled: bool) {
        let state = if enabled { "enable" } else { "disable" };
        self.inner.gc_toggles.with_label_values(&[state]).inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let plans = counter_vec(
            &registry,
            "keel_planner_plans_total",
            "Planning calls completed per selected path",
            &["path"],
        );
        let optimize_seconds = histogram_vec(
            &registry,
            "keel_planner_optimize_seconds",
            "Time spent selecting a plan",
            &["path"],
        );
        let errors = counter_vec(
            &registry,
            "keel_planner_errors_total",
            "Planning calls failed per error kind",
            &["kind"],
        );
        let snapshot_rejections = counter_vec(
            &registry,
            "keel_gc_snapshot_rejections_total",
            "Snapshot reads rejected by the GC consistency guard",
            &["reason"],
        );
        let gc_toggles = counter_vec(
            &registry,
            "keel_gc_toggles_total",
            "GC enable/disable requests",
            &["state"],
        );

        Self {
            registry,
            plans,
            optimize_seconds,
            errors,
            snapshot_rejections,
            gc_toggles,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_plan("fast", 0.001);
        m.record_plan("cascades", 0.02);
        m.record_error("privilege_denied");
        m.inc_snapshot_rejections();
        m.inc_gc_toggles(false);
        let text = m.render_prometheus();

        assert!(text.contains("keel_planner_plans_total"));
        assert!(text.contains("keel_planner_optimize_seconds"));
        assert!(text.contains("keel_planner_errors_total"));
        assert!(text.contains("privilege_denied"));
        assert!(text.contains("keel_gc_snapshot_rejections_total"));
        assert!(text.contains("keel_gc_toggles_total"));
    }
}
