//! Metrics definitions for the remote configuration client.

use shared::metrics_defs::{MetricDef, MetricType};

pub const POLL_DURATION: MetricDef = MetricDef {
    name: "poll.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a poll cycle in seconds",
};

pub const POLL_FAILED: MetricDef = MetricDef {
    name: "poll.failed",
    metric_type: MetricType::Counter,
    description: "Number of poll cycles skipped because of a transport or decoding failure",
};

pub const POLL_NO_CHANGE: MetricDef = MetricDef {
    name: "poll.no_change",
    metric_type: MetricType::Counter,
    description: "Number of poll cycles where the agent reported no change",
};

pub const CONFIGS_APPLIED: MetricDef = MetricDef {
    name: "configs.applied",
    metric_type: MetricType::Counter,
    description: "Number of configuration keys handed to a listener",
};

pub const CONFIGS_REMOVED: MetricDef = MetricDef {
    name: "configs.removed",
    metric_type: MetricType::Counter,
    description: "Number of configuration keys removed",
};

pub const CONFIGS_REJECTED: MetricDef = MetricDef {
    name: "configs.rejected",
    metric_type: MetricType::Counter,
    description: "Number of configuration keys rejected before reaching a listener",
};

pub const INTEGRITY_FAILED: MetricDef = MetricDef {
    name: "integrity.failed",
    metric_type: MetricType::Counter,
    description: "Number of configuration files whose content did not match the advertised digest",
};

pub const EXTRA_SERVICES_SIZE: MetricDef = MetricDef {
    name: "extra_services.size",
    metric_type: MetricType::Gauge,
    description: "Number of extra services reported to the agent",
};

pub const ALL_METRICS: &[MetricDef] = &[
    POLL_DURATION,
    POLL_FAILED,
    POLL_NO_CHANGE,
    CONFIGS_APPLIED,
    CONFIGS_REMOVED,
    CONFIGS_REJECTED,
    INTEGRITY_FAILED,
    EXTRA_SERVICES_SIZE,
];
