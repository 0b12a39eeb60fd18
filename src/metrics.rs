use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::warn;

pub struct Metrics {
    // Builds
    pub builds_total: AtomicU64,
    pub validation_failures_total: AtomicU64,

    // Queries
    pub root_queries_total: AtomicU64,
    pub eager_queries_total: AtomicU64,
    pub count_queries_total: AtomicU64,
    pub slow_queries_total: AtomicU64,
    pub query_micros_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            builds_total: AtomicU64::new(0),
            validation_failures_total: AtomicU64::new(0),
            root_queries_total: AtomicU64::new(0),
            eager_queries_total: AtomicU64::new(0),
            count_queries_total: AtomicU64::new(0),
            slow_queries_total: AtomicU64::new(0),
            query_micros_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    Root,
    Eager,
    Count,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::Root => "root",
            QueryKind::Eager => "eager",
            QueryKind::Count => "count",
        }
    }
}

/// Records one executed query and warns when it ran past `threshold`.
pub(crate) fn observe_query(kind: QueryKind, sql: &str, elapsed: Duration, threshold: Duration) {
    let m = metrics();
    let counter = match kind {
        QueryKind::Root => &m.root_queries_total,
        QueryKind::Eager => &m.eager_queries_total,
        QueryKind::Count => &m.count_queries_total,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    m.query_micros_total.fetch_add(
        u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        Ordering::Relaxed,
    );
    if elapsed >= threshold {
        m.slow_queries_total.fetch_add(1, Ordering::Relaxed);
        warn!(
            target: "rillfilter::slow_query",
            kind = kind.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            sql,
            "slow filter query"
        );
    }
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    // builds
    let _ = writeln!(
        s,
        "# TYPE filter_builds_total counter\nfilter_builds_total {}",
        m.builds_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE filter_validation_failures_total counter\nfilter_validation_failures_total {}",
        m.validation_failures_total.load(Ordering::Relaxed)
    );
    // queries
    let _ = writeln!(
        s,
        "# TYPE filter_queries_total counter\nfilter_queries_total{{kind=\"root\"}} {}\nfilter_queries_total{{kind=\"eager\"}} {}\nfilter_queries_total{{kind=\"count\"}} {}",
        m.root_queries_total.load(Ordering::Relaxed),
        m.eager_queries_total.load(Ordering::Relaxed),
        m.count_queries_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE filter_slow_queries_total counter\nfilter_slow_queries_total {}",
        m.slow_queries_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE filter_query_micros_total counter\nfilter_query_micros_total {}",
        m.query_micros_total.load(Ordering::Relaxed)
    );
    s
}
