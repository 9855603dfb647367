//! Consumer settings and their precedence.
//!
//! Settings resolve once, when a consumer handle is created: call-site
//! [`SwrOptions`] win over the nearest [`ConfigScope`], which already carries
//! everything its parents set, which wins over [`Settings::default`].

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SwrError;
use crate::fetcher::Fetcher;
use crate::revalidate::{ErrorHook, SuccessHook};

/// Exponential retry schedule for keys whose latest attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry; every further retry doubles it.
    pub base_delay_ms: u64,
    /// Retries scheduled per failure streak.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay_ms: 2_000,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based): 2s, 4s, 8s, ...
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Fully resolved consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// A disabled consumer never fetches and reports no key.
    pub is_enabled: bool,
    /// Keep showing the last key's data while the current key has none, and
    /// keep showing last good data after a failed attempt.
    pub keep_previous_data: bool,
    /// Polling period in milliseconds; 0 disables polling.
    pub refresh_interval_ms: u64,
    pub revalidate_on_focus: bool,
    pub revalidate_on_online: bool,
    /// `None` disables retry on error.
    pub retry: Option<RetryPolicy>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            is_enabled: true,
            keep_previous_data: false,
            refresh_interval_ms: 0,
            revalidate_on_focus: true,
            revalidate_on_online: true,
            retry: Some(RetryPolicy::default()),
        }
    }
}

impl Settings {
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_ms > 0).then(|| Duration::from_millis(self.refresh_interval_ms))
    }

    pub fn validate(&self) -> Result<(), SwrError> {
        if let Some(retry) = &self.retry
            && retry.base_delay_ms == 0
        {
            return Err(SwrError::config("retry.base_delay_ms must be positive"));
        }
        Ok(())
    }

    /// Apply every field `partial` sets on top of these settings.
    pub fn merged(&self, partial: &PartialSettings) -> Settings {
        Settings {
            is_enabled: partial.is_enabled.unwrap_or(self.is_enabled),
            keep_previous_data: partial.keep_previous_data.unwrap_or(self.keep_previous_data),
            refresh_interval_ms: partial.refresh_interval_ms.unwrap_or(self.refresh_interval_ms),
            revalidate_on_focus: partial.revalidate_on_focus.unwrap_or(self.revalidate_on_focus),
            revalidate_on_online: partial
                .revalidate_on_online
                .unwrap_or(self.revalidate_on_online),
            retry: partial.retry.unwrap_or(self.retry),
        }
    }
}

/// Settings where every field is optional; unset fields inherit.
///
/// `retry` distinguishes "unset" (`None`) from "disabled" (`Some(None)`,
/// written as `"retry": null` in JSON).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_previous_data: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revalidate_on_focus: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revalidate_on_online: Option<bool>,
    #[serde(
        deserialize_with = "explicit_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry: Option<Option<RetryPolicy>>,
}

impl PartialSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from JSON, e.g. a configuration file section.
    pub fn from_json(json: &str) -> Result<Self, SwrError> {
        let partial: PartialSettings = serde_json::from_str(json)
            .map_err(|e| SwrError::config(format!("malformed settings: {e}")))?;
        if let Some(Some(retry)) = partial.retry
            && retry.base_delay_ms == 0
        {
            return Err(SwrError::config("retry.base_delay_ms must be positive"));
        }
        Ok(partial)
    }

    pub fn is_enabled(mut self, value: bool) -> Self {
        self.is_enabled = Some(value);
        self
    }

    pub fn keep_previous_data(mut self, value: bool) -> Self {
        self.keep_previous_data = Some(value);
        self
    }

    pub fn refresh_interval_ms(mut self, value: u64) -> Self {
        self.refresh_interval_ms = Some(value);
        self
    }

    pub fn revalidate_on_focus(mut self, value: bool) -> Self {
        self.revalidate_on_focus = Some(value);
        self
    }

    pub fn revalidate_on_online(mut self, value: bool) -> Self {
        self.revalidate_on_online = Some(value);
        self
    }

    pub fn retry(mut self, value: Option<RetryPolicy>) -> Self {
        self.retry = Some(value);
        self
    }
}

fn explicit_null<'de, De, T>(deserializer: De) -> Result<Option<Option<T>>, De::Error>
where
    De: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Options given at a call site or to a scope. Unset fields inherit.
pub struct SwrOptions<D, E> {
    pub fetcher: Option<Arc<dyn Fetcher<D, E>>>,
    pub settings: PartialSettings,
    /// Fired once per successful attempt this consumer observes.
    pub on_success: Option<SuccessHook<D>>,
    /// Fired once per failed attempt this consumer observes.
    pub on_error: Option<ErrorHook<E>>,
    /// Data shown for a key that has nothing else to show.
    pub fallback: HashMap<String, D>,
}

impl<D, E> Default for SwrOptions<D, E> {
    fn default() -> Self {
        SwrOptions {
            fetcher: None,
            settings: PartialSettings::default(),
            on_success: None,
            on_error: None,
            fallback: HashMap::new(),
        }
    }
}

impl<D: Clone, E> Clone for SwrOptions<D, E> {
    fn clone(&self) -> Self {
        SwrOptions {
            fetcher: self.fetcher.clone(),
            settings: self.settings.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<D, E> fmt::Debug for SwrOptions<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwrOptions")
            .field("fetcher", &self.fetcher.is_some())
            .field("settings", &self.settings)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("fallback", &self.fallback.len())
            .finish()
    }
}

impl<D, E> SwrOptions<D, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher<D, E>>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn settings(mut self, settings: PartialSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &D) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &E) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn fallback(mut self, key: impl Into<String>, data: D) -> Self {
        self.fallback.insert(key.into(), data);
        self
    }
}

/// Options after precedence has been applied.
pub struct ResolvedOptions<D, E> {
    pub settings: Settings,
    pub fetcher: Option<Arc<dyn Fetcher<D, E>>>,
    pub on_success: Option<SuccessHook<D>>,
    pub on_error: Option<ErrorHook<E>>,
    pub fallback: HashMap<String, D>,
}

impl<D: Clone, E> Clone for ResolvedOptions<D, E> {
    fn clone(&self) -> Self {
        ResolvedOptions {
            settings: self.settings.clone(),
            fetcher: self.fetcher.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<D: Clone, E> ResolvedOptions<D, E> {
    fn with(&self, overrides: &SwrOptions<D, E>) -> Result<Self, SwrError> {
        let settings = self.settings.merged(&overrides.settings);
        settings.validate()?;

        let mut fallback = self.fallback.clone();
        fallback.extend(
            overrides
                .fallback
                .iter()
                .map(|(key, data)| (key.clone(), data.clone())),
        );

        Ok(ResolvedOptions {
            settings,
            fetcher: overrides.fetcher.clone().or_else(|| self.fetcher.clone()),
            on_success: overrides.on_success.clone().or_else(|| self.on_success.clone()),
            on_error: overrides.on_error.clone().or_else(|| self.on_error.clone()),
            fallback,
        })
    }

    /// The fetcher to use for `key`.
    pub fn require_fetcher(&self, key: &str) -> Result<Arc<dyn Fetcher<D, E>>, SwrError> {
        self.fetcher
            .clone()
            .ok_or_else(|| SwrError::missing_fetcher(key))
    }
}

/// One level of ambient configuration.
///
/// A child scope is merged with its parent when it is created, so resolving
/// options never walks the chain.
pub struct ConfigScope<D, E> {
    resolved: ResolvedOptions<D, E>,
}

impl<D: Clone, E> Clone for ConfigScope<D, E> {
    fn clone(&self) -> Self {
        ConfigScope {
            resolved: self.resolved.clone(),
        }
    }
}

impl<D: Clone, E> ConfigScope<D, E> {
    /// A root scope over `settings` and an optional default fetcher.
    pub fn root(
        settings: Settings,
        fetcher: Option<Arc<dyn Fetcher<D, E>>>,
    ) -> Result<Self, SwrError> {
        settings.validate()?;
        Ok(ConfigScope {
            resolved: ResolvedOptions {
                settings,
                fetcher,
                on_success: None,
                on_error: None,
                fallback: HashMap::new(),
            },
        })
    }

    /// A nested scope: everything `overrides` sets wins over this scope.
    pub fn child(&self, overrides: &SwrOptions<D, E>) -> Result<Self, SwrError> {
        Ok(ConfigScope {
            resolved: self.resolved.with(overrides)?,
        })
    }

    /// Apply call-site options on top of this scope.
    pub fn resolve(&self, local: &SwrOptions<D, E>) -> Result<ResolvedOptions<D, E>, SwrError> {
        self.resolved.with(local)
    }

    pub fn settings(&self) -> &Settings {
        &self.resolved.settings
    }

    pub fn fetcher(&self) -> Option<&Arc<dyn Fetcher<D, E>>> {
        self.resolved.fetcher.as_ref()
    }
}
