//! Prometheus counters for sessions and books

use prometheus::{register_int_counter_vec, IntCounterVec};
use std::sync::LazyLock;

pub static INBOUND_FRAMES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "market_stream_inbound_frames_total",
        "Frames received per feed",
        &["feed"]
    )
    .expect("inbound frame counter registers once")
});

pub static FAULTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "market_stream_faults_total",
        "Faults reported per feed and kind",
        &["feed", "kind"]
    )
    .expect("fault counter registers once")
});

pub static RESTARTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "market_stream_restarts_total",
        "Session restarts per feed",
        &["feed"]
    )
    .expect("restart counter registers once")
});

pub static BOOK_UPDATES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "market_stream_book_updates_total",
        "Book events applied per feed and kind",
        &["feed", "kind"]
    )
    .expect("book update counter registers once")
});

/// Render the default registry in the Prometheus text format
pub fn render() -> String {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        RESTARTS.with_label_values(&["test"]).inc();
        let text = render();
        assert!(text.contains("market_stream_restarts_total"));
    }
}
