//! Logs and metrics.
//!
//! `logging` installs the tracing subscriber for the binary; embedders bring
//! their own. `metrics` records through the `metrics` facade, so events are
//! dropped unless a recorder is installed, e.g. the Prometheus exporter from
//! [`metrics::init_metrics`].
//!
//! Log events carry `connection_id` and `request_id` fields where known.

pub mod logging;
pub mod metrics;
