//! Utility functions for geodispatch

use crate::common::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::future::Future;
use std::time::Duration;

/// Convert milliseconds since the Unix epoch to a UTC timestamp.
pub fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::Corrupted(format!("timestamp out of range: {}", millis)))
}

/// Run a store call under a deadline.
///
/// An elapsed deadline and any backend failure both surface as
/// `StoreUnavailable` for `store`.
pub async fn with_timeout<T, Fut>(store: &'static str, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|e| e.into_store_failure(store)),
        Err(_) => Err(Error::unavailable(
            store,
            format!("timed out after {:?}", timeout),
        )),
    }
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Internal("Max retries exceeded".into()))
}

/// Validate a sign-up name (must be non-empty once trimmed)
pub fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation("Name can not be empty"));
    }
    Ok(name)
}

/// Validate latitude/longitude ranges (inclusive bounds)
pub fn validate_coordinates(lat: f64, lng: f64) -> Result<()> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(Error::validation(format!("Invalid latitude: {}", lat)));
    }
    if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
        return Err(Error::validation(format!("Invalid longitude: {}", lng)));
    }
    Ok(())
}
