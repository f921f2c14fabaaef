// Copyright 2016 TiKV Project Authors. Licensed under Apache-2.0.

use lazy_static::lazy_static;
use prometheus::*;

lazy_static! {
    pub static ref PD_CMD_HISTOGRAM_VEC: HistogramVec = register_histogram_vec!(
        "pd_client_cmd_duration_seconds",
        "Bucketed histogram of PD command duration",
        &["type"]
    )
    .unwrap();
    pub static ref PD_CMD_FAILED_HISTOGRAM_VEC: HistogramVec = register_histogram_vec!(
        "pd_client_cmd_failed_duration_seconds",
        "Bucketed histogram of failed PD command duration",
        &["type"]
    )
    .unwrap();
    pub static ref PD_REQUEST_HISTOGRAM_VEC: HistogramVec = register_histogram_vec!(
        "pd_client_request_duration_seconds",
        "Bucketed histogram of PD wire request duration",
        &["type"]
    )
    .unwrap();
    pub static ref PD_PENDING_TSO_REQUEST_GAUGE: IntGauge = register_int_gauge!(
        "pd_client_pending_tso_requests",
        "The number of TSO requests waiting in the submission queue"
    )
    .unwrap();
}
