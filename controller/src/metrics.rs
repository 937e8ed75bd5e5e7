use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

lazy_static! {
    pub static ref RECONCILE_COUNTER: IntCounterVec = register_int_counter_vec!(
        "greenhouse_reconcile_total",
        "Number of reconciles per controller and result",
        &["controller", "result"],
    )
    .unwrap();
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "greenhouse_reconcile_duration_seconds",
        "Duration of reconciles per controller",
        &["controller"],
    )
    .unwrap();
    pub static ref TOKEN_RENEWALS: IntCounterVec = register_int_counter_vec!(
        "greenhouse_cluster_token_renewals_total",
        "Remote credential renewals per result",
        &["result"],
    )
    .unwrap();
    pub static ref HELM_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "greenhouse_helm_operations_total",
        "Helm operations per kind and result",
        &["operation", "result"],
    )
    .unwrap();
}

pub fn result_label<T, E>(result: &Result<T, E>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(_) => "error",
    }
}
