use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    messages_appended_total: AtomicU64,
    duplicate_submissions_total: AtomicU64,
    storage_errors_total: AtomicU64,
    replayed_messages_total: AtomicU64,
    recovery_failures_total: AtomicU64,
    transport_resumes_total: AtomicU64,
    active_sessions: AtomicI64,
    latest_message_id: AtomicI64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_request(frame: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(frame, is_error, latency_ms);
    }
}

pub fn record_message_appended(id: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_message_appended(id);
    }
}

pub fn increment_duplicate_submissions() {
    if let Some(metrics) = global_metrics() {
        metrics.duplicate_submissions_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_storage_errors() {
    if let Some(metrics) = global_metrics() {
        metrics.storage_errors_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn add_replayed_messages(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.replayed_messages_total.fetch_add(count, Ordering::SeqCst);
    }
}

pub fn increment_recovery_failures() {
    if let Some(metrics) = global_metrics() {
        metrics.recovery_failures_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_transport_resumes() {
    if let Some(metrics) = global_metrics() {
        metrics.transport_resumes_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn set_active_sessions(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.active_sessions.store(count as i64, Ordering::SeqCst);
    }
}

pub fn set_latest_message_id(id: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.latest_message_id.fetch_max(id, Ordering::SeqCst);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_request(&self, frame: &str, is_error: bool, latency_ms: u64) {
        let normalized_frame = normalize_ws_frame(frame);
        increment_label_counter(&self.ws_rate_total, &normalized_frame, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &normalized_frame, latency_ms);
        increment_label_counter(&self.ws_duration_count, &normalized_frame, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &normalized_frame, 1);
        }
    }

    pub fn record_message_appended(&self, id: i64) {
        self.messages_appended_total.fetch_add(1, Ordering::SeqCst);
        self.latest_message_id.fetch_max(id, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_rate_total Total inbound websocket frames by type.\n");
        output.push_str("# TYPE relay_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_rate_total", &self.ws_rate_total);

        output.push_str("# HELP relay_ws_errors_total Total websocket frame errors by type.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_errors_total", &self.ws_errors_total);

        output.push_str("# HELP relay_ws_duration_ms_sum Sum of websocket frame handling latency in milliseconds by type.\n");
        output.push_str("# TYPE relay_ws_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_sum",
            &self.ws_duration_sum_ms,
        );

        output.push_str(
            "# HELP relay_ws_duration_ms_count Count of websocket latency samples by type.\n",
        );
        output.push_str("# TYPE relay_ws_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_count",
            &self.ws_duration_count,
        );

        append_scalar(
            &mut output,
            "chat_messages_appended_total",
            "counter",
            "Messages durably appended to the message log.",
            self.messages_appended_total.load(Ordering::SeqCst) as i64,
        );
        append_scalar(
            &mut output,
            "chat_duplicate_submissions_total",
            "counter",
            "Submissions suppressed by client offset deduplication.",
            self.duplicate_submissions_total.load(Ordering::SeqCst) as i64,
        );
        append_scalar(
            &mut output,
            "chat_storage_errors_total",
            "counter",
            "Message log reads or writes that failed.",
            self.storage_errors_total.load(Ordering::SeqCst) as i64,
        );
        append_scalar(
            &mut output,
            "chat_replayed_messages_total",
            "counter",
            "Messages replayed to reconnecting sessions.",
            self.replayed_messages_total.load(Ordering::SeqCst) as i64,
        );
        append_scalar(
            &mut output,
            "chat_recovery_failures_total",
            "counter",
            "Offset replays aborted by a message log error.",
            self.recovery_failures_total.load(Ordering::SeqCst) as i64,
        );
        append_scalar(
            &mut output,
            "chat_transport_resumes_total",
            "counter",
            "Connections restored from a resume token.",
            self.transport_resumes_total.load(Ordering::SeqCst) as i64,
        );
        append_scalar(
            &mut output,
            "chat_active_sessions",
            "gauge",
            "Currently connected chat sessions.",
            self.active_sessions.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "chat_latest_message_id",
            "gauge",
            "Highest message id known to this process.",
            self.latest_message_id.load(Ordering::SeqCst),
        );

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    let segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if segment.chars().all(|character| character.is_ascii_digit()) {
                "{number}".to_string()
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>();

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn normalize_ws_frame(frame: &str) -> String {
    let normalized = frame.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_scalar(output: &mut String, name: &str, kind: &str, help: &str, value: i64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
    output.push_str(&format!("{name} {value}\n"));
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{frame=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
