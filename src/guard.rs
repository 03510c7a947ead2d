//! Wraps one outbound call-site with deterministic caching, token-bucket
//! rate limiting, circuit breaking, and exponential backoff retries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::cache::{Cache, CacheEntry};
use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::errors::GuardError;
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit_best_effort, GuardEvent, LatencyQuantiles, LatencyTracker, TelemetrySink};
use crate::token_bucket::{TokenBucket, TokenBucketConfig};

/// An outbound request, keyed for caching by the collaborator.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub cache_key: String,
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>, cache_key: impl Into<String>) -> Self {
        Self { method: method.into(), url: url.into(), headers: HashMap::new(), body: Vec::new(), cache_key: cache_key.into() }
    }
}

/// The fetcher's result before the guard interprets retryability.
#[derive(Debug, Clone)]
pub struct Response {
    pub body: Vec<u8>,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub cache_hit: bool,
    pub age: Duration,
    pub retry_count: u32,
}

/// The collaborator-supplied callable performing the actual I/O. Purely
/// functional with respect to the guard's state: no retries, no caching.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, String>;
}

const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub name: String,
    pub ttl: Duration,
    pub burst_limit: f64,
    pub sustained_rate: f64,
    pub max_retries: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub failure_threshold: usize,
    pub window_requests: usize,
    pub fraction_threshold: f64,
    pub min_samples: usize,
    pub probe_interval: Duration,
    pub enable_file_cache: bool,
    pub cache_path: Option<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            name: "unnamed".into(),
            ttl: Duration::from_secs(30),
            burst_limit: 10.0,
            sustained_rate: 5.0,
            max_retries: 3,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
            failure_threshold: 5,
            window_requests: 20,
            fraction_threshold: 0.5,
            min_samples: 10,
            probe_interval: Duration::from_secs(30),
            enable_file_cache: false,
            cache_path: None,
        }
    }
}

/// Telemetry counters mutated under a guard. Monotone non-decreasing except
/// on explicit operator reset.
#[derive(Default)]
pub struct GuardCounters {
    pub requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub backoffs: AtomicU64,
    pub circuit_opens: AtomicU64,
}

impl GuardCounters {
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let misses = self.cache_misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            return 0.0;
        }
        (hits / (hits + misses)).clamp(0.0, 1.0)
    }
}

/// Per-provider request wrapper. Cheap to clone — internals are `Arc`-shared.
#[derive(Clone)]
pub struct ProviderGuard {
    config: Arc<GuardConfig>,
    cache: Arc<Cache>,
    token_bucket: Arc<TokenBucket>,
    circuit: CircuitBreaker,
    sleeper: Arc<dyn Sleeper>,
    backoff: Backoff,
    jitter: Jitter,
    counters: Arc<GuardCounters>,
    latency: Arc<LatencyTracker>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl ProviderGuard {
    pub fn new(config: GuardConfig) -> Self {
        let cache = if config.enable_file_cache {
            match &config.cache_path {
                Some(path) => Arc::new(Cache::with_disk_path(path.clone())),
                None => Arc::new(Cache::new()),
            }
        } else {
            Arc::new(Cache::new())
        };

        let circuit_config = CircuitBreakerConfig {
            failure_threshold: config.failure_threshold,
            window_size: config.window_requests,
            fraction_threshold: config.fraction_threshold,
            min_samples: config.min_samples,
            open_timeout: config.probe_interval,
            half_open_success_threshold: 1,
        };

        Self {
            token_bucket: Arc::new(TokenBucket::new(TokenBucketConfig {
                burst: config.burst_limit,
                sustained_rate: config.sustained_rate,
            })),
            circuit: CircuitBreaker::new(circuit_config),
            sleeper: Arc::new(TokioSleeper),
            backoff: Backoff::exponential(config.backoff_base).with_max(config.backoff_max),
            jitter: Jitter::symmetric(0.25),
            counters: Arc::new(GuardCounters::default()),
            latency: Arc::new(LatencyTracker::new(1000)),
            telemetry: None,
            cache,
            config: Arc::new(config),
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_circuit_clock<C: crate::clock::Clock + 'static>(mut self, clock: C) -> Self {
        self.circuit = self.circuit.with_clock(clock);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn counters(&self) -> &GuardCounters {
        &self.counters
    }

    pub fn latency_quantiles(&self) -> LatencyQuantiles {
        self.latency.quantiles()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    fn emit(&self, event: GuardEvent) {
        emit_best_effort(self.telemetry.as_deref(), &self.config.name, event);
    }

    /// The guard's public contract: cache / rate-limit / circuit / retry /
    /// telemetry around one opaque fetcher invocation.
    pub async fn execute(
        &self,
        token: CancellationToken,
        mut request: Request,
        fetcher: &(dyn Fetcher + Sync),
    ) -> Result<Response, GuardError> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        // 1. Circuit check.
        self.circuit.check().map_err(|err| {
            self.counters.circuit_opens.fetch_add(1, Ordering::Relaxed);
            err
        })?;

        // 2. Cache lookup.
        let now = Utc::now();
        let cached = self.cache.get(&request.cache_key);
        if let Some(entry) = &cached {
            if entry.is_fresh(now, self.config.ttl.as_millis() as i64) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.emit(GuardEvent::CacheHit { key: request.cache_key.clone() });
                return Ok(Response {
                    body: entry.body.clone(),
                    status: entry.status,
                    headers: entry.headers.clone(),
                    cache_hit: true,
                    age: entry.age(now).to_std().unwrap_or_default(),
                    retry_count: 0,
                });
            }
            inject_pit_headers(&mut request, entry);
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.emit(GuardEvent::CacheMiss { key: request.cache_key.clone() });

        // 3. Rate-limit admission.
        let admission = self.token_bucket.try_acquire();
        if !admission.admitted {
            self.emit(GuardEvent::RateLimitDenied { retry_after: admission.retry_after });
            return Err(GuardError::RateLimited { retry_after: admission.retry_after });
        }
        self.emit(GuardEvent::RateLimitAdmitted);

        // 4. Retry loop.
        let mut min_next_sleep = Duration::from_secs(0);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let mut delay = self.jitter.apply(self.backoff.delay(attempt));
                delay = delay.max(min_next_sleep);
                min_next_sleep = Duration::from_secs(0);
                self.counters.backoffs.fetch_add(1, Ordering::Relaxed);
                self.emit(GuardEvent::RetryAttempt { attempt, delay });

                if self.sleep_cancelable(delay, &token).await.is_err() {
                    return Err(GuardError::ContextCancelled);
                }
            }

            let started = std::time::Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(GuardError::ContextCancelled);
                }
                result = fetcher.fetch(&request) => result,
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(mut response) => {
                    response.retry_count = attempt as u32;
                    if response.status == 304 {
                        self.cache.refresh_inserted_at(&request.cache_key, now);
                        self.circuit.record_success();
                        self.counters.successes.fetch_add(1, Ordering::Relaxed);
                        self.latency.record(elapsed);
                        self.emit(GuardEvent::RequestSucceeded { duration: elapsed, cache_hit: false });
                        let refreshed = self.cache.get(&request.cache_key).unwrap_or(CacheEntry {
                            body: response.body.clone(),
                            status: 200,
                            headers: response.headers.clone(),
                            inserted_at: now,
                            etag: None,
                            last_modified: None,
                        });
                        return Ok(Response {
                            body: refreshed.body,
                            status: 200,
                            headers: refreshed.headers,
                            cache_hit: false,
                            age: Duration::from_secs(0),
                            retry_count: attempt as u32,
                        });
                    }

                    if (200..300).contains(&response.status) {
                        self.cache.put(
                            request.cache_key.clone(),
                            CacheEntry {
                                body: response.body.clone(),
                                status: response.status,
                                headers: response.headers.clone(),
                                inserted_at: now,
                                etag: response.headers.get("etag").cloned(),
                                last_modified: response.headers.get("last-modified").cloned(),
                            },
                        );
                        self.circuit.record_success();
                        self.counters.successes.fetch_add(1, Ordering::Relaxed);
                        self.latency.record(elapsed);
                        self.emit(GuardEvent::RequestSucceeded { duration: elapsed, cache_hit: false });
                        return Ok(response);
                    }

                    let retryable = RETRYABLE_STATUSES.contains(&response.status);
                    self.circuit.record_failure();
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    self.emit(GuardEvent::RequestFailed { duration: elapsed, retryable });

                    if response.status == 429 {
                        if let Some(retry_after) = response.headers.get("retry-after").and_then(|v| v.parse::<u64>().ok()) {
                            min_next_sleep = Duration::from_secs(retry_after);
                        }
                    }

                    last_error = Some(GuardError::Upstream {
                        status: response.status,
                        retryable,
                        message: format!("upstream returned {}", response.status),
                    });

                    if !retryable {
                        return Err(last_error.unwrap());
                    }
                }
                Err(message) => {
                    self.circuit.record_failure();
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    self.emit(GuardEvent::RequestFailed { duration: elapsed, retryable: true });
                    last_error = Some(GuardError::Network { message });
                }
            }
        }

        self.emit(GuardEvent::RetryExhausted { attempts: self.config.max_retries + 1 });
        Err(last_error.unwrap_or(GuardError::Network { message: "retries exhausted".into() }))
    }

    async fn sleep_cancelable(&self, delay: Duration, token: &CancellationToken) -> Result<(), ()> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(()),
            _ = self.sleeper.sleep(delay) => Ok(()),
        }
    }
}

fn inject_pit_headers(request: &mut Request, entry: &CacheEntry) {
    if let Some(etag) = &entry.etag {
        request.headers.insert("If-None-Match".into(), etag.clone());
    }
    if let Some(last_modified) = &entry.last_modified {
        request.headers.insert("If-Modified-Since".into(), last_modified.clone());
    }
}
