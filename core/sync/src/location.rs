//! Location acquisition with a high-accuracy retry phase and a low-accuracy fallback.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use fieldsync_common::{Error, GeoPosition, LocationErrorKind, Result};

use crate::config::LocationSettings;
use crate::retry::{RetryConfig, RetryExecutor};

/// Options for a single-shot position request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionOptions {
    pub enable_high_accuracy: bool,
    pub timeout: Duration,
    pub maximum_age: Duration,
}

/// Platform geolocation API.
///
/// Implementations fail with [`Error::Location`] carrying a classified kind.
#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    async fn current_position(&self, options: &PositionOptions) -> Result<GeoPosition>;
}

/// Two-phase location acquisition.
#[derive(Clone)]
pub struct LocationService {
    provider: Arc<dyn GeolocationProvider>,
    settings: LocationSettings,
}

impl LocationService {
    pub fn new(provider: Arc<dyn GeolocationProvider>, settings: LocationSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &LocationSettings {
        &self.settings
    }

    /// Obtain a fix.
    ///
    /// The high-accuracy request is retried with backoff; if every attempt
    /// fails, exactly one low-accuracy request follows without further retry.
    pub async fn get_location_with_retry(&self) -> Result<GeoPosition> {
        let high = PositionOptions {
            enable_high_accuracy: true,
            timeout: Duration::from_millis(self.settings.high_accuracy_timeout_ms),
            maximum_age: Duration::from_millis(self.settings.maximum_age_ms),
        };
        let retry = RetryExecutor::new(
            RetryConfig::new(self.settings.high_accuracy_retries)
                .with_initial_delay(Duration::from_millis(self.settings.retry_base_delay_ms)),
        );

        match retry.execute(|| self.get_location(high)).await {
            Ok(position) => Ok(position),
            Err(err) => {
                warn!("High accuracy location failed ({}), trying low accuracy", err);
                let low = PositionOptions {
                    enable_high_accuracy: false,
                    timeout: Duration::from_millis(self.settings.low_accuracy_timeout_ms),
                    maximum_age: Duration::from_millis(self.settings.maximum_age_ms),
                };
                self.get_location(low).await
            }
        }
    }

    /// Single request bounded by `options.timeout`.
    pub async fn get_location(&self, options: PositionOptions) -> Result<GeoPosition> {
        let request = self.provider.current_position(&options);
        match tokio::time::timeout(options.timeout, request).await {
            Ok(Ok(position)) => {
                debug!(
                    "Got location {} (accuracy {} m, high accuracy: {})",
                    position, position.accuracy, options.enable_high_accuracy
                );
                Ok(position)
            }
            Ok(Err(Error::Location(kind))) => Err(Error::Location(kind)),
            Ok(Err(other)) => {
                warn!("Geolocation provider failed: {}", other);
                Err(Error::Location(LocationErrorKind::Unknown))
            }
            Err(_) => Err(Error::Location(LocationErrorKind::Timeout)),
        }
    }
}

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum ScriptedFix {
    Fix(GeoPosition),
    Fail(LocationErrorKind),
    /// Never answers; the caller's timeout fires.
    Hang,
}

/// Provider that plays back queued responses, then repeats a fallback.
///
/// Stands in for the platform API in tests and on hosts without a GPS.
pub struct ScriptedGeolocation {
    script: Mutex<VecDeque<ScriptedFix>>,
    fallback: Mutex<ScriptedFix>,
    requests: Mutex<Vec<PositionOptions>>,
}

impl ScriptedGeolocation {
    /// Always answer with `position`.
    pub fn fixed(position: GeoPosition) -> Self {
        Self::with_fallback(ScriptedFix::Fix(position))
    }

    /// Always fail with `kind`.
    pub fn failing(kind: LocationErrorKind) -> Self {
        Self::with_fallback(ScriptedFix::Fail(kind))
    }

    pub fn with_fallback(fallback: ScriptedFix) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response ahead of the fallback.
    pub fn push(&self, fix: ScriptedFix) -> &Self {
        lock(&self.script).push_back(fix);
        self
    }

    /// Replace the fallback response.
    pub fn set_fallback(&self, fix: ScriptedFix) {
        *lock(&self.fallback) = fix;
    }

    /// Options of every request received so far.
    pub fn requests(&self) -> Vec<PositionOptions> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl GeolocationProvider for ScriptedGeolocation {
    async fn current_position(&self, options: &PositionOptions) -> Result<GeoPosition> {
        lock(&self.requests).push(*options);
        let next = lock(&self.script).pop_front();
        let step = match next {
            Some(step) => step,
            None => lock(&self.fallback).clone(),
        };

        match step {
            ScriptedFix::Fix(mut position) => {
                position.timestamp = chrono::Utc::now();
                Ok(position)
            }
            ScriptedFix::Fail(kind) => Err(Error::Location(kind)),
            ScriptedFix::Hang => std::future::pending().await,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
