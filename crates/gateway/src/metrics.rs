use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

static GLOBAL_METRICS: OnceLock<Arc<GatewayMetrics>> = OnceLock::new();

pub struct GatewayMetrics {
    frames_total: Mutex<HashMap<String, u64>>,
    frame_errors_total: Mutex<HashMap<String, u64>>,
    frame_duration_sum_ms: Mutex<HashMap<String, u64>>,
    frame_duration_count: Mutex<HashMap<String, u64>>,
    connections_open: AtomicI64,
    messages_published_total: Mutex<HashMap<String, u64>>,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self {
            frames_total: Mutex::new(HashMap::new()),
            frame_errors_total: Mutex::new(HashMap::new()),
            frame_duration_sum_ms: Mutex::new(HashMap::new()),
            frame_duration_count: Mutex::new(HashMap::new()),
            connections_open: AtomicI64::new(0),
            messages_published_total: Mutex::new(HashMap::new()),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<GatewayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<GatewayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_frame(route: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_frame(route, is_error, latency_ms);
    }
}

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_opened();
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_closed();
    }
}

pub fn record_message_published(backend: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_message_published(backend);
    }
}

impl GatewayMetrics {
    pub fn record_frame(&self, route: &str, is_error: bool, latency_ms: u64) {
        let label = normalize_route(route);
        increment_label_counter(&self.frames_total, &label, 1);
        increment_label_counter(&self.frame_duration_sum_ms, &label, latency_ms);
        increment_label_counter(&self.frame_duration_count, &label, 1);
        if is_error {
            increment_label_counter(&self.frame_errors_total, &label, 1);
        }
    }

    pub fn connection_opened(&self) {
        self.connections_open.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.connections_open.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_message_published(&self, backend: &str) {
        increment_label_counter(&self.messages_published_total, backend, 1);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP gateway_frames_total Total inbound frames by route.\n");
        output.push_str("# TYPE gateway_frames_total counter\n");
        append_label_counter_lines(&mut output, "gateway_frames_total", "route", &self.frames_total);

        output.push_str("# HELP gateway_frame_errors_total Total rejected frames by route.\n");
        output.push_str("# TYPE gateway_frame_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_frame_errors_total",
            "route",
            &self.frame_errors_total,
        );

        output.push_str(
            "# HELP gateway_frame_duration_ms_sum Sum of frame handling latency in milliseconds by route.\n",
        );
        output.push_str("# TYPE gateway_frame_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_frame_duration_ms_sum",
            "route",
            &self.frame_duration_sum_ms,
        );

        output.push_str(
            "# HELP gateway_frame_duration_ms_count Count of frame latency samples by route.\n",
        );
        output.push_str("# TYPE gateway_frame_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_frame_duration_ms_count",
            "route",
            &self.frame_duration_count,
        );

        output.push_str("# HELP gateway_connections_open Currently open WebSocket connections.\n");
        output.push_str("# TYPE gateway_connections_open gauge\n");
        output.push_str(&format!(
            "gateway_connections_open {}\n",
            self.connections_open.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP gateway_messages_published_total Total chat messages fanned out by backend.\n",
        );
        output.push_str("# TYPE gateway_messages_published_total counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_messages_published_total",
            "backend",
            &self.messages_published_total,
        );

        output
    }
}

fn normalize_route(route: &str) -> String {
    let normalized = route.trim().to_owned();
    if normalized.is_empty() {
        "unknown".to_owned()
    } else {
        normalized
    }
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    if guard.is_empty() {
        return;
    }

    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::GatewayMetrics;

    #[test]
    fn render_prometheus_includes_frame_and_connection_metrics() {
        let metrics = GatewayMetrics::default();
        metrics.record_frame("chat/sendMessage", false, 4);
        metrics.record_frame("chat/sendMessage", true, 9);
        metrics.record_frame("auth/authenticate", false, 1);
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.record_message_published("memory");

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("gateway_frames_total{route=\"chat/sendMessage\"} 2"));
        assert!(rendered.contains("gateway_frame_errors_total{route=\"chat/sendMessage\"} 1"));
        assert!(rendered.contains("gateway_frames_total{route=\"auth/authenticate\"} 1"));
        assert!(rendered.contains("gateway_frame_duration_ms_sum{route=\"chat/sendMessage\"} 13"));
        assert!(rendered.contains("gateway_frame_duration_ms_count{route=\"chat/sendMessage\"} 2"));
        assert!(rendered.contains("gateway_connections_open 1"));
        assert!(rendered.contains("gateway_messages_published_total{backend=\"memory\"} 1"));
    }

    #[test]
    fn blank_routes_are_labeled_unknown() {
        let metrics = GatewayMetrics::default();
        metrics.record_frame("  ", false, 1);
        assert!(metrics.render_prometheus().contains("gateway_frames_total{route=\"unknown\"} 1"));
    }
}
