//! LLM safety fabric: per-module circuit breakers, timeouts, and jitter.
//!
//! Each logical LLM consumer (classifier, generator, extractor) gets its own
//! breaker so one flaky operation cannot disable the others. A breaker opens
//! after three failures inside a rolling 60-second window, cools down for 60
//! seconds, then admits a single half-open probe.
//!
//! `safe_call` never propagates an error: the caller always gets either the
//! upstream value or its own fallback, synchronously on an open circuit.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::llm::LlmError;

const MAX_FAILURES: usize = 3;
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const COOLDOWN: Duration = Duration::from_secs(60);

/// The three independent LLM consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmModule {
    Classifier,
    Generator,
    Extractor,
}

impl LlmModule {
    pub fn tag(self) -> &'static str {
        match self {
            LlmModule::Classifier => "classifier",
            LlmModule::Generator => "generator",
            LlmModule::Extractor => "extractor",
        }
    }

    /// Timeout budget for the remote call itself (jitter is slept first and
    /// does not count against this).
    pub fn timeout(self) -> Duration {
        match self {
            LlmModule::Classifier => Duration::from_millis(800),
            LlmModule::Generator => Duration::from_millis(1200),
            LlmModule::Extractor => Duration::from_millis(800),
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<Instant>,
}

/// Closed / open / half-open breaker with a rolling failure window.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    max_failures: usize,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_config(name, MAX_FAILURES, FAILURE_WINDOW, COOLDOWN)
    }

    pub fn with_config(
        name: &'static str,
        max_failures: usize,
        window: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            name,
            max_failures,
            window,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a call may proceed right now. An expired cooldown admits
    /// exactly one half-open probe; concurrent callers are shed until the
    /// probe resolves.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    info!(breaker = self.name, "cooldown elapsed, admitting half-open probe");
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, BreakerState::HalfOpen) {
            info!(breaker = self.name, "probe succeeded, closing circuit");
        }
        inner.state = BreakerState::Closed;
        inner.failures.clear();
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(breaker = self.name, "probe failed, re-opening circuit");
                inner.state = BreakerState::Open {
                    until: now + self.cooldown,
                };
            }
            BreakerState::Closed => {
                inner.failures.push_back(now);
                let window = self.window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                if inner.failures.len() >= self.max_failures {
                    warn!(
                        breaker = self.name,
                        failures = inner.failures.len(),
                        "tripped, opening for {:?}",
                        self.cooldown
                    );
                    inner.state = BreakerState::Open {
                        until: now + self.cooldown,
                    };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Hold the circuit open (master kill-switch and tests).
    pub fn force_open(&self, for_duration: Duration) {
        let mut inner = self.lock();
        inner.state = BreakerState::Open {
            until: Instant::now() + for_duration,
        };
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.lock().state, BreakerState::Closed)
    }
}

/// Process-global fabric fronting every LLM call.
pub struct SafetyFabric {
    classifier: CircuitBreaker,
    generator: CircuitBreaker,
    extractor: CircuitBreaker,
    /// Bounds concurrent upstream calls; saturation falls back immediately
    /// rather than queueing inbound turns.
    limiter: Semaphore,
}

impl SafetyFabric {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            classifier: CircuitBreaker::new("classifier"),
            generator: CircuitBreaker::new("generator"),
            extractor: CircuitBreaker::new("extractor"),
            limiter: Semaphore::new(max_concurrency),
        }
    }

    pub fn breaker(&self, module: LlmModule) -> &CircuitBreaker {
        match module {
            LlmModule::Classifier => &self.classifier,
            LlmModule::Generator => &self.generator,
            LlmModule::Extractor => &self.extractor,
        }
    }

    /// Run `f` under the module's breaker, timeout, and the global
    /// concurrency bound, returning `fallback` on any denial or failure.
    ///
    /// The 10–30 ms jitter is slept before the timed call so the timeout
    /// budget covers only the remote work.
    pub async fn safe_call<T, F, Fut>(&self, module: LlmModule, fallback: T, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let breaker = self.breaker(module);
        if !breaker.try_acquire() {
            debug!(module = module.tag(), "circuit open, using fallback");
            return fallback;
        }

        let Ok(_permit) = self.limiter.try_acquire() else {
            // Saturation is backpressure, not an upstream failure.
            debug!(module = module.tag(), "llm concurrency saturated, using fallback");
            return fallback;
        };

        let jitter = rand::thread_rng().gen_range(10..=30);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let started = Instant::now();
        match tokio::time::timeout(module.timeout(), f()).await {
            Ok(Ok(value)) => {
                breaker.record_success();
                debug!(
                    module = module.tag(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "llm call ok"
                );
                value
            }
            Ok(Err(e)) => {
                breaker.record_failure();
                warn!(module = module.tag(), error = %e, "llm call failed, using fallback");
                fallback
            }
            Err(_) => {
                breaker.record_failure();
                warn!(
                    module = module.tag(),
                    timeout_ms = module.timeout().as_millis() as u64,
                    "llm call timed out, using fallback"
                );
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmErrorKind;

    fn tiny_breaker() -> CircuitBreaker {
        CircuitBreaker::with_config(
            "test",
            3,
            Duration::from_secs(60),
            Duration::from_millis(20),
        )
    }

    #[test]
    fn opens_on_third_failure() {
        let breaker = tiny_breaker();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn half_open_admits_single_probe() {
        let breaker = tiny_breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.try_acquire());
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.try_acquire(), "first caller gets the probe");
        assert!(!breaker.try_acquire(), "second caller is shed during probe");
        breaker.record_success();
        assert!(breaker.is_closed());
        assert!(breaker.try_acquire());
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = tiny_breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn success_clears_the_window() {
        let breaker = tiny_breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.try_acquire(), "window was reset by success");
    }

    #[tokio::test]
    async fn safe_call_returns_value_on_success() {
        let fabric = SafetyFabric::new(4);
        let out = fabric
            .safe_call(LlmModule::Generator, "fallback".to_string(), || async {
                Ok("real".to_string())
            })
            .await;
        assert_eq!(out, "real");
        assert!(fabric.breaker(LlmModule::Generator).is_closed());
    }

    #[tokio::test]
    async fn safe_call_falls_back_on_error_and_counts_failure() {
        let fabric = SafetyFabric::new(4);
        for _ in 0..3 {
            let out = fabric
                .safe_call(LlmModule::Extractor, 7u32, || async {
                    Err::<u32, _>(LlmError::new(LlmErrorKind::Server, "boom"))
                })
                .await;
            assert_eq!(out, 7);
        }
        assert!(!fabric.breaker(LlmModule::Extractor).is_closed());
        // Circuit now open: fallback without invoking the closure.
        let out = fabric
            .safe_call(LlmModule::Extractor, 9u32, || async {
                panic!("must not be called while open")
            })
            .await;
        assert_eq!(out, 9);
    }

    #[tokio::test]
    async fn safe_call_times_out_slow_upstream() {
        let fabric = SafetyFabric::new(4);
        let out = fabric
            .safe_call(LlmModule::Classifier, "fallback".to_string(), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("too late".to_string())
            })
            .await;
        assert_eq!(out, "fallback");
    }

    #[tokio::test]
    async fn breakers_are_independent_per_module() {
        let fabric = SafetyFabric::new(4);
        fabric
            .breaker(LlmModule::Extractor)
            .force_open(Duration::from_secs(60));
        assert!(!fabric.breaker(LlmModule::Extractor).is_closed());
        assert!(fabric.breaker(LlmModule::Classifier).is_closed());
        assert!(fabric.breaker(LlmModule::Generator).is_closed());
    }
}
