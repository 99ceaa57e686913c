//! Ambient observability shared by the four engines. Not a spec feature —
//! the spec's Non-goals exclude quota accounting and notification
//! delivery, but structured metrics are carried regardless (SPEC_FULL.md
//! §B), the same way the teacher's `control`/`agent` crates expose a
//! Prometheus endpoint alongside their actual feature work.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the global Prometheus recorder and returns a handle whose
/// `render()` produces the exposition-format text body for a `/metrics`
/// route.
pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

pub mod names {
    pub const DCL_ENTRIES_PUSHED: &str = "gateway_dcl_entries_pushed_total";
    pub const DCL_COALESCED: &str = "gateway_dcl_coalesced_total";
    pub const SYNC_OBJECTS_APPLIED: &str = "gateway_sync_objects_applied_total";
    pub const SYNC_ERRORS: &str = "gateway_sync_errors_total";
    pub const RESHARD_ENTRIES_COPIED: &str = "gateway_reshard_entries_copied_total";
    pub const LIFECYCLE_OBJECTS_EXPIRED: &str = "gateway_lifecycle_objects_expired_total";
}
