//! Per-model token-bucket, daily budget, and connection-slot limiter.
//!
//! Each model gets its own lazy-refill token bucket (advance the refill
//! clock against an `Instant`, never eagerly) and a mutex-guarded set of
//! budget and connection counters, generalized to three independently
//! capped resources per model rather than one.

use crate::config::ModelLimits;
use crate::error::LimiterError;
use chrono::{Duration as ChronoDuration, Local, Timelike};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelStatus {
    pub tokens: u32,
    pub budget_spent_usd: f64,
    pub connections: u32,
}

struct ModelState {
    max_tpm: u32,
    max_budget_usd_per_day: f64,
    max_connections: u32,
    current_tokens: u32,
    current_budget_usd: f64,
    current_connections: u32,
    last_refill_at: Instant,
}

impl ModelState {
    fn new(limits: &ModelLimits) -> Self {
        Self {
            max_tpm: limits.max_tpm,
            max_budget_usd_per_day: limits.daily_budget_usd,
            max_connections: limits.max_connections,
            current_tokens: limits.max_tpm,
            current_budget_usd: 0.0,
            current_connections: 0,
            last_refill_at: Instant::now(),
        }
    }

    /// Lazy refill: advance `last_refill_at` by whole minutes elapsed,
    /// never all the way to `now` so sub-minute residual is preserved.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        if elapsed < MINUTE {
            return;
        }
        let whole_minutes = elapsed.as_secs() / 60;
        if whole_minutes == 0 {
            return;
        }
        let added = whole_minutes.saturating_mul(self.max_tpm as u64);
        self.current_tokens = ((self.current_tokens as u64 + added).min(self.max_tpm as u64)) as u32;
        self.last_refill_at += MINUTE * whole_minutes as u32;
    }

    fn reset_daily(&mut self, now: Instant) {
        self.current_budget_usd = 0.0;
        self.current_connections = 0;
        self.current_tokens = self.max_tpm;
        self.last_refill_at = now;
    }

    fn status(&self) -> ModelStatus {
        ModelStatus {
            tokens: self.current_tokens,
            budget_spent_usd: self.current_budget_usd,
            connections: self.current_connections,
        }
    }
}

/// Thread-safe per-model limiter. One `Mutex` guards each model's triad of
/// counters (one mutex guards all three counters per model); an outer
/// `RwLock` over the model map lets `register_model` add models without
/// blocking in-flight reservations on unrelated models.
pub struct Limiter {
    models: RwLock<HashMap<String, Mutex<ModelState>>>,
}

impl Limiter {
    pub fn new(configs: HashMap<String, ModelLimits>) -> Self {
        let models = configs
            .into_iter()
            .map(|(name, limits)| (name, Mutex::new(ModelState::new(&limits))))
            .collect();
        Self { models: RwLock::new(models) }
    }

    pub async fn register_model(&self, model: impl Into<String>, limits: ModelLimits) {
        self.models
            .write()
            .await
            .insert(model.into(), Mutex::new(ModelState::new(&limits)));
    }

    pub async fn reserve(&self, model: &str, tokens: u32) -> Result<(), LimiterError> {
        let guard = self.models.read().await;
        let state_lock = guard
            .get(model)
            .ok_or_else(|| LimiterError::UnknownModel(model.to_string()))?;
        let mut state = state_lock.lock().unwrap();
        state.refill(Instant::now());
        if state.current_tokens < tokens {
            return Err(LimiterError::RateLimited(model.to_string()));
        }
        state.current_tokens -= tokens;
        Ok(())
    }

    pub async fn reserve_budget(&self, model: &str, usd: f64) -> Result<(), LimiterError> {
        let guard = self.models.read().await;
        let state_lock = guard
            .get(model)
            .ok_or_else(|| LimiterError::UnknownModel(model.to_string()))?;
        let mut state = state_lock.lock().unwrap();
        if state.current_budget_usd + usd > state.max_budget_usd_per_day {
            return Err(LimiterError::BudgetExceeded(model.to_string()));
        }
        state.current_budget_usd += usd;
        Ok(())
    }

    pub async fn reserve_connection(&self, model: &str) -> Result<(), LimiterError> {
        let guard = self.models.read().await;
        let state_lock = guard
            .get(model)
            .ok_or_else(|| LimiterError::UnknownModel(model.to_string()))?;
        let mut state = state_lock.lock().unwrap();
        if state.current_connections >= state.max_connections {
            return Err(LimiterError::ConnectionLimit(model.to_string()));
        }
        state.current_connections += 1;
        Ok(())
    }

    pub async fn release_connection(&self, model: &str) -> Result<(), LimiterError> {
        let guard = self.models.read().await;
        let state_lock = guard
            .get(model)
            .ok_or_else(|| LimiterError::UnknownModel(model.to_string()))?;
        let mut state = state_lock.lock().unwrap();
        if state.current_connections == 0 {
            return Err(LimiterError::NoConnection(model.to_string()));
        }
        state.current_connections -= 1;
        Ok(())
    }

    pub async fn status(&self, model: &str) -> Result<ModelStatus, LimiterError> {
        let guard = self.models.read().await;
        let state_lock = guard
            .get(model)
            .ok_or_else(|| LimiterError::UnknownModel(model.to_string()))?;
        let mut state = state_lock.lock().unwrap();
        state.refill(Instant::now());
        Ok(state.status())
    }

    pub async fn reset_daily(&self) {
        let guard = self.models.read().await;
        let now = Instant::now();
        for state_lock in guard.values() {
            state_lock.lock().unwrap().reset_daily(now);
        }
    }

    /// Spawns the one-shot-then-reschedule local-midnight reset timer.
    /// Returns a handle that cancels the loop when dropped or signaled.
    pub fn schedule_daily_reset(self: std::sync::Arc<Self>) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                let sleep_for = duration_until_next_local_midnight();
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {
                        self.reset_daily().await;
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        (handle, tx)
    }
}

fn duration_until_next_local_midnight() -> Duration {
    let now = Local::now();
    let tomorrow_midnight = (now + ChronoDuration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let today_midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap();
    let target = if now.hour() == 0 && now.minute() == 0 && now.second() == 0 {
        today_midnight
    } else {
        tomorrow_midnight
    };
    let delta = target.signed_duration_since(now.naive_local());
    delta.to_std().unwrap_or(Duration::from_secs(1))
}
