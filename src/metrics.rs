//! Prometheus-compatible metrics endpoint
//!
//! Exposes replication scheduler metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::replication::stats::TickStats;

/// Rolling window for tick-time percentiles
const TICK_HISTORY_SAMPLES: usize = 1000;

/// Minimum samples before percentiles are published
const TICK_HISTORY_MIN_SAMPLES: usize = 10;

/// Metrics registry for the replication server
#[derive(Debug)]
pub struct Metrics {
    // World
    pub entities: AtomicU64,
    pub players: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Connections
    pub connections_active: AtomicU64,
    pub connections_skipped: AtomicU64,
    pub saturated_passes: AtomicU64,

    // Replication work
    pub entities_considered: AtomicU64,
    pub clean_skipped: AtomicU64,
    pub relevancy_queries: AtomicU64,
    pub replications: AtomicU64,
    pub bytes_replicated: AtomicU64,
    pub channels_opened: AtomicU64,
    pub channels_closed: AtomicU64,
    pub truncated: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation (VecDeque for O(1) pop_front)
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            entities: AtomicU64::new(0),
            players: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_skipped: AtomicU64::new(0),
            saturated_passes: AtomicU64::new(0),
            entities_considered: AtomicU64::new(0),
            clean_skipped: AtomicU64::new(0),
            relevancy_queries: AtomicU64::new(0),
            replications: AtomicU64::new(0),
            bytes_replicated: AtomicU64::new(0),
            channels_opened: AtomicU64::new(0),
            channels_closed: AtomicU64::new(0),
            truncated: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY_SAMPLES)),
        }
    }

    /// Fold one scheduling tick's counters in
    pub fn record_tick(&self, stats: &TickStats) {
        self.connections_skipped
            .fetch_add(stats.connections_skipped as u64, Ordering::Relaxed);
        self.saturated_passes
            .fetch_add(stats.saturated_connections as u64, Ordering::Relaxed);
        self.entities_considered
            .fetch_add(stats.considered as u64, Ordering::Relaxed);
        self.clean_skipped
            .fetch_add(stats.clean_skipped as u64, Ordering::Relaxed);
        self.relevancy_queries
            .fetch_add(stats.relevancy_queries as u64, Ordering::Relaxed);
        self.replications
            .fetch_add(stats.replicated as u64, Ordering::Relaxed);
        self.bytes_replicated.fetch_add(stats.bytes, Ordering::Relaxed);
        self.channels_opened
            .fetch_add(stats.channels_opened as u64, Ordering::Relaxed);
        self.channels_closed
            .fetch_add(stats.channels_closed as u64, Ordering::Relaxed);
        self.truncated
            .fetch_add(stats.truncated as u64, Ordering::Relaxed);
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY_SAMPLES {
            history.pop_front();
        }

        if history.len() >= TICK_HISTORY_MIN_SAMPLES {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("relevance_server_entities", "Live entities in the world", "gauge",
            self.entities.load(Ordering::Relaxed));
        metric!("relevance_server_players", "Player controllers in the world", "gauge",
            self.players.load(Ordering::Relaxed));

        metric!("relevance_server_tick_time_microseconds", "Current scheduling tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("relevance_server_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("relevance_server_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("relevance_server_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("relevance_server_tick_count", "Total scheduling ticks", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("relevance_server_connections_active", "Connections registered with the scheduler", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("relevance_server_connections_skipped_total", "Connection passes skipped for lack of a viewer", "counter",
            self.connections_skipped.load(Ordering::Relaxed));
        metric!("relevance_server_saturated_passes_total", "Passes cut short by transport saturation", "counter",
            self.saturated_passes.load(Ordering::Relaxed));

        metric!("relevance_server_entities_considered_total", "Candidates scored and sorted", "counter",
            self.entities_considered.load(Ordering::Relaxed));
        metric!("relevance_server_replications_total", "Entity replications sent", "counter",
            self.replications.load(Ordering::Relaxed));
        metric!("relevance_server_bytes_replicated_total", "Bytes queued by replications", "counter",
            self.bytes_replicated.load(Ordering::Relaxed));
        metric!("relevance_server_channels_opened_total", "Channels opened", "counter",
            self.channels_opened.load(Ordering::Relaxed));
        metric!("relevance_server_channels_closed_total", "Channels closed after the grace window", "counter",
            self.channels_closed.load(Ordering::Relaxed));
        metric!("relevance_server_truncated_total", "Candidates deferred to the next tick by saturation", "counter",
            self.truncated.load(Ordering::Relaxed));

        #[cfg(feature = "metrics_extended")]
        {
            metric!("relevance_server_clean_skipped_total", "Candidates skipped with nothing new to send", "counter",
                self.clean_skipped.load(Ordering::Relaxed));
            metric!("relevance_server_relevancy_queries_total", "Relevancy evaluations requested by passes", "counter",
                self.relevancy_queries.load(Ordering::Relaxed));
        }

        metric!("relevance_server_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let body = serde_json::json!({
            "world": {
                "entities": load(&self.entities),
                "players": load(&self.players),
            },
            "performance": {
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_time_p99_us": load(&self.tick_time_p99_us),
                "tick_time_max_us": load(&self.tick_time_max_us),
                "tick_count": load(&self.tick_count),
            },
            "connections": {
                "active": load(&self.connections_active),
                "skipped": load(&self.connections_skipped),
                "saturated_passes": load(&self.saturated_passes),
            },
            "replication": {
                "considered": load(&self.entities_considered),
                "clean_skipped": load(&self.clean_skipped),
                "relevancy_queries": load(&self.relevancy_queries),
                "replications": load(&self.replications),
                "bytes": load(&self.bytes_replicated),
                "channels_opened": load(&self.channels_opened),
                "channels_closed": load(&self.channels_closed),
                "truncated": load(&self.truncated),
            },
            "uptime_seconds": self.uptime_seconds(),
        });
        serde_json::to_string_pretty(&body).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

/// Build the HTTP response for one request
fn route(metrics: &Metrics, request: &str) -> String {
    let (content_type, body) = if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
        ("application/json", metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        ("text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        ("text/plain", "OK".to_string())
    } else {
        return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
    };
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}
