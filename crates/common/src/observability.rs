use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::dto::{PerformanceMetrics, StopReason, TurnStats};
use crate::error::ErrorReport;

const MAX_SAMPLES: usize = 10000;
const LATENCY_WINDOW: usize = 32;
const MAX_RECENT_ERRORS: usize = 100;

/// Correlation ID for one generation, used in logs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationId(Arc<str>);

impl Serialize for GenerationId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl GenerationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GenerationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tracks the performance figures a runtime reports through `getPerformanceMetrics`.
///
/// Accessed from blocking generation threads, so it is a plain value meant to sit
/// behind a `std::sync::Mutex`.
#[derive(Debug, Clone, Default)]
pub struct PerformanceTracker {
    last_tokens_per_second: f32,
    latencies_ms: VecDeque<u64>,
    memory_usage_mb: u64,
    accelerator: Option<String>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the static part of the report when a model is loaded
    pub fn set_model_footprint(&mut self, size_bytes: u64, accelerator: Option<String>) {
        self.memory_usage_mb = size_bytes / (1024 * 1024);
        self.accelerator = accelerator;
    }

    /// Record a finished generation
    pub fn record_generation(&mut self, token_count: usize, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        self.last_tokens_per_second = if elapsed_ms > 0 {
            (token_count as f32 * 1000.0) / elapsed_ms as f32
        } else {
            0.0
        };

        self.latencies_ms.push_back(elapsed_ms);
        if self.latencies_ms.len() > LATENCY_WINDOW {
            self.latencies_ms.pop_front();
        }
    }

    /// Forget everything, used when the model is released
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> PerformanceMetrics {
        let average_latency_ms = if self.latencies_ms.is_empty() {
            0
        } else {
            self.latencies_ms.iter().sum::<u64>() / self.latencies_ms.len() as u64
        };

        PerformanceMetrics {
            tokens_per_second: self.last_tokens_per_second,
            average_latency_ms,
            memory_usage_mb: self.memory_usage_mb,
            accelerator: self.accelerator.clone(),
        }
    }
}

/// Generation telemetry shared by the chat orchestrator
#[derive(Debug, Clone)]
pub struct GenerationTelemetry {
    inner: Arc<RwLock<TelemetryData>>,
    start_time: Instant,
}

#[derive(Debug, Default)]
struct TelemetryData {
    // Generation tracking
    total_generations: u64,
    active_generations: HashMap<GenerationId, ActiveGeneration>,

    // Performance samples
    response_times: VecDeque<u64>,
    tokens_per_second: VecDeque<f64>,
    total_tokens: u64,

    // Outcome tracking
    outcomes: HashMap<StopReason, u64>,
    failed_loads: u64,
    recent_errors: VecDeque<(Instant, ErrorReport)>,

    // Live engine readings
    live_tokens_per_second: f32,
    live_context_used: usize,
}

#[derive(Debug, Clone)]
struct ActiveGeneration {
    started_at: Instant,
    model_id: String,
}

impl GenerationTelemetry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(TelemetryData::default())),
            start_time: Instant::now(),
        }
    }

    /// Start tracking a generation
    pub async fn start_generation(&self, model_id: &str) -> GenerationId {
        let id = GenerationId::new();
        let mut data = self.inner.write().await;

        data.total_generations += 1;
        data.active_generations.insert(
            id.clone(),
            ActiveGeneration {
                started_at: Instant::now(),
                model_id: model_id.to_string(),
            },
        );

        id
    }

    /// Finish tracking a generation, whatever the outcome
    pub async fn finish_generation(&self, id: &GenerationId, stats: &TurnStats) {
        let mut data = self.inner.write().await;

        if let Some(active) = data.active_generations.remove(id) {
            tracing::debug!(
                generation = %id,
                model = %active.model_id,
                elapsed_ms = active.started_at.elapsed().as_millis() as u64,
                "generation finished"
            );
        }

        *data.outcomes.entry(stats.stop_reason).or_insert(0) += 1;
        if !stats.stop_reason.is_success() {
            return;
        }

        data.total_tokens += stats.token_count as u64;
        data.response_times.push_back(stats.response_time_ms);
        if data.response_times.len() > MAX_SAMPLES {
            data.response_times.pop_front();
        }
        data.tokens_per_second.push_back(stats.tokens_per_second as f64);
        if data.tokens_per_second.len() > MAX_SAMPLES {
            data.tokens_per_second.pop_front();
        }
    }

    /// Record a failed generation or load
    pub async fn record_error(&self, id: Option<&GenerationId>, error: &crate::Error) {
        let mut data = self.inner.write().await;

        if error.is_load_error() {
            data.failed_loads += 1;
        }

        data.recent_errors.push_back((Instant::now(), ErrorReport::from(error)));
        if data.recent_errors.len() > MAX_RECENT_ERRORS {
            data.recent_errors.pop_front();
        }

        if let Some(id) = id {
            if data.active_generations.remove(id).is_some() {
                *data.outcomes.entry(StopReason::Error).or_insert(0) += 1;
            }
        }
    }

    /// Record live readings taken from the engine after a turn
    pub async fn record_live(&self, tokens_per_second: f32, context_used: Option<usize>) {
        let mut data = self.inner.write().await;
        data.live_tokens_per_second = tokens_per_second;
        if let Some(used) = context_used {
            data.live_context_used = used;
        }
    }

    /// Calculate percentile from samples
    fn calculate_percentile(samples: &[u64], percentile: f64) -> u64 {
        if samples.is_empty() {
            return 0;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let index = ((percentile / 100.0) * (sorted.len() - 1) as f64) as usize;
        sorted[index]
    }

    /// Get detailed telemetry snapshot
    pub async fn snapshot(&self) -> TelemetrySnapshot {
        let data = self.inner.read().await;

        let durations: Vec<u64> = data.response_times.iter().copied().collect();
        let average_tokens_per_second = if data.tokens_per_second.is_empty() {
            0.0
        } else {
            data.tokens_per_second.iter().sum::<f64>() / data.tokens_per_second.len() as f64
        };

        let count = |reason: StopReason| data.outcomes.get(&reason).copied().unwrap_or(0);

        TelemetrySnapshot {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            uptime_seconds: self.start_time.elapsed().as_secs(),

            total_generations: data.total_generations,
            active_generations: data.active_generations.len() as u64,
            completed_generations: count(StopReason::EndOfSequence)
                + count(StopReason::MaxTokensReached)
                + count(StopReason::Completed),
            cancelled_generations: count(StopReason::Cancelled),
            failed_generations: count(StopReason::Error),
            failed_loads: data.failed_loads,

            response_time_p50_ms: Self::calculate_percentile(&durations, 50.0),
            response_time_p95_ms: Self::calculate_percentile(&durations, 95.0),
            average_tokens_per_second,
            total_tokens: data.total_tokens,

            live_tokens_per_second: data.live_tokens_per_second,
            live_context_used: data.live_context_used,
        }
    }

    /// Get recent errors for debugging, with their age in seconds
    pub async fn recent_errors(&self) -> Vec<(u64, ErrorReport)> {
        let data = self.inner.read().await;
        let now = Instant::now();

        data.recent_errors
            .iter()
            .map(|(time, report)| (now.duration_since(*time).as_secs(), report.clone()))
            .collect()
    }
}

impl Default for GenerationTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// Telemetry snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,

    // Generation counts
    pub total_generations: u64,
    pub active_generations: u64,
    pub completed_generations: u64,
    pub cancelled_generations: u64,
    pub failed_generations: u64,
    pub failed_loads: u64,

    // Latency percentiles (milliseconds)
    pub response_time_p50_ms: u64,
    pub response_time_p95_ms: u64,

    // Token metrics
    pub average_tokens_per_second: f64,
    pub total_tokens: u64,

    // Last engine readings
    pub live_tokens_per_second: f32,
    pub live_context_used: usize,
}
