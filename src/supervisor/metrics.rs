use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};

use super::state::ProcessStatus;

// Every successful spawn, first start included
static STARTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stackgate_process_starts_total",
        "Processes spawned by the stackgate supervisor",
        &["process"]
    )
    .expect("Failed to register prometheus metric: stackgate_process_starts_total")
});

// Restarts charged against the retry budget
static RESTARTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stackgate_process_restarts_total",
        "Automatic restarts after a failed start or a crash",
        &["process"]
    )
    .expect("Failed to register prometheus metric: stackgate_process_restarts_total")
});

static FATAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stackgate_process_fatal_total",
        "Transitions into the fatal_stopped state",
        &["process"]
    )
    .expect("Failed to register prometheus metric: stackgate_process_fatal_total")
});

// 1 for the current state of each process, 0 for the others
static STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "stackgate_process_state",
        "Current lifecycle state of each supervised process",
        &["process", "state"]
    )
    .expect("Failed to register prometheus metric: stackgate_process_state")
});

pub fn record_start(process: &str) {
    STARTS.with_label_values(&[process]).inc();
}

pub fn record_restart(process: &str) {
    RESTARTS.with_label_values(&[process]).inc();
}

pub fn record_fatal(process: &str) {
    FATAL.with_label_values(&[process]).inc();
}

pub fn record_state(process: &str, current: ProcessStatus) {
    for status in ProcessStatus::ALL {
        STATE
            .with_label_values(&[process, status.as_str()])
            .set(i64::from(status == current));
    }
}
