use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static! {
    pub static ref ADMISSION_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "greenhouse_admission_requests_total",
        "Number of admission reviews handled, by resource, operation and verdict",
        &["resource", "operation", "allowed"],
    )
    .unwrap();
}

pub fn record(resource: &str, operation: &str, allowed: bool) {
    ADMISSION_REQUESTS
        .with_label_values(&[resource, operation, if allowed { "true" } else { "false" }])
        .inc();
}
