//! Request metrics.
//!
//! Every observation goes two places: the `metrics` facade, which the
//! Prometheus recorder renders at `/metrics`, and an in-process aggregate that
//! health output and tests can snapshot. Both are purely additive.

use axum::http::StatusCode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Counter key for one request outcome
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: String,
    pub route: String,
    pub status_class: &'static str,
}

/// Histogram key for request durations
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub method: String,
    pub route: String,
}

/// Aggregated durations for one route
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DurationStats {
    pub count: u64,
    pub total_seconds: f64,
    pub max_seconds: f64,
}

impl DurationStats {
    fn observe(&mut self, seconds: f64) {
        self.count += 1;
        self.total_seconds += seconds;
        self.max_seconds = self.max_seconds.max(seconds);
    }

    pub fn mean_seconds(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_seconds / self.count as f64
        }
    }
}

/// Copy of every aggregate at one instant
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub requests: HashMap<RequestKey, u64>,
    pub durations: HashMap<RouteKey, DurationStats>,
    pub streams: HashMap<i64, u64>,
}

impl MetricsSnapshot {
    pub fn total_requests(&self) -> u64 {
        self.requests.values().sum()
    }

    pub fn total_observations(&self) -> u64 {
        self.durations.values().map(|stats| stats.count).sum()
    }

    pub fn total_streams(&self) -> u64 {
        self.streams.values().sum()
    }

    /// Requests for one route and status class, across methods
    pub fn requests_for(&self, route: &str, status_class: &str) -> u64 {
        self.requests
            .iter()
            .filter(|(key, _)| key.route == route && key.status_class == status_class)
            .map(|(_, count)| count)
            .sum()
    }
}

/// Process-wide request and domain-event metrics
#[derive(Debug, Default)]
pub struct RequestMetrics {
    requests: Mutex<HashMap<RequestKey, u64>>,
    durations: Mutex<HashMap<RouteKey, DurationStats>>,
    streams: Mutex<HashMap<i64, u64>>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished request: a counter increment and a duration
    /// observation, always together.
    pub fn record_request(
        &self,
        method: &str,
        route: &str,
        status: StatusCode,
        elapsed: Duration,
    ) {
        let status_class = status_class(status);
        let seconds = elapsed.as_secs_f64();

        *self
            .requests
            .lock()
            .entry(RequestKey {
                method: method.to_string(),
                route: route.to_string(),
                status_class,
            })
            .or_insert(0) += 1;

        self.durations
            .lock()
            .entry(RouteKey {
                method: method.to_string(),
                route: route.to_string(),
            })
            .or_default()
            .observe(seconds);

        metrics::counter!(
            "clips_http_requests_total",
            "method" => method.to_string(),
            "route" => route.to_string(),
            "status_class" => status_class
        )
        .increment(1);
        metrics::histogram!(
            "clips_http_request_duration_seconds",
            "method" => method.to_string(),
            "route" => route.to_string()
        )
        .record(seconds);
    }

    /// Record a clip being streamed
    pub fn record_stream(&self, clip_id: i64) {
        *self.streams.lock().entry(clip_id).or_insert(0) += 1;
        metrics::counter!("clips_streams_total", "clip_id" => clip_id.to_string()).increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.lock().clone(),
            durations: self.durations.lock().clone(),
            streams: self.streams.lock().clone(),
        }
    }
}

/// Hundreds digit of a status code, e.g. `4xx`
pub fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(StatusCode::OK), "2xx");
        assert_eq!(status_class(StatusCode::FOUND), "3xx");
        assert_eq!(status_class(StatusCode::TOO_MANY_REQUESTS), "4xx");
        assert_eq!(status_class(StatusCode::SERVICE_UNAVAILABLE), "5xx");
    }

    #[test]
    fn test_request_recorded_once() {
        let metrics = RequestMetrics::new();
        metrics.record_request("GET", "/clips", StatusCode::OK, Duration::from_millis(20));
        metrics.record_request(
            "GET",
            "/clips",
            StatusCode::TOO_MANY_REQUESTS,
            Duration::from_millis(1),
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests(), 2);
        assert_eq!(snapshot.total_observations(), 2);
        assert_eq!(snapshot.requests_for("/clips", "2xx"), 1);
        assert_eq!(snapshot.requests_for("/clips", "4xx"), 1);

        let durations = snapshot.durations[&RouteKey {
            method: "GET".to_string(),
            route: "/clips".to_string(),
        }];
        assert_eq!(durations.count, 2);
        assert!((durations.max_seconds - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_stream_events_keyed_by_clip() {
        let metrics = RequestMetrics::new();
        metrics.record_stream(1);
        metrics.record_stream(1);
        metrics.record_stream(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.streams[&1], 2);
        assert_eq!(snapshot.streams[&4], 1);
        assert_eq!(snapshot.total_streams(), 3);
    }

    #[test]
    fn test_concurrent_recording_loses_nothing() {
        let metrics = Arc::new(RequestMetrics::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        let status = if i % 2 == 0 {
                            StatusCode::OK
                        } else {
                            StatusCode::SERVICE_UNAVAILABLE
                        };
                        metrics.record_request(
                            "GET",
                            "/clips/:clip_id/stats",
                            status,
                            Duration::ZERO,
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests(), 2000);
        assert_eq!(snapshot.total_observations(), 2000);
        assert_eq!(snapshot.requests_for("/clips/:clip_id/stats", "5xx"), 1000);
    }
}
