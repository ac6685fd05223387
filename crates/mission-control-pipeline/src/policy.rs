//! Operator switches stored in the `ops_policy` table.
//!
//! `worker_enabled:<worker_id>` overrides `worker_enabled`; both accept
//! `{"enabled": bool}` or a bare boolean. `daily_quota` accepts
//! `{"limit": n}` or a bare integer.

use mission_control_core::{MissionStore, PipelineError};
use serde_json::Value;

pub const WORKER_ENABLED_KEY: &str = "worker_enabled";
pub const DAILY_QUOTA_KEY: &str = "daily_quota";

#[must_use]
pub fn worker_enabled_key(worker_id: &str) -> String {
    format!("{WORKER_ENABLED_KEY}:{worker_id}")
}

/// Whether `worker_id` may claim work. Missing or unreadable switches
/// default to enabled.
///
/// # Errors
/// Propagates store errors.
pub fn worker_enabled(store: &dyn MissionStore, worker_id: &str) -> Result<bool, PipelineError> {
    for key in [worker_enabled_key(worker_id), WORKER_ENABLED_KEY.to_string()] {
        if let Some(enabled) = store.get_policy(&key)?.as_ref().and_then(enabled_flag) {
            return Ok(enabled);
        }
    }
    Ok(true)
}

/// Daily proposal quota, falling back to `default_limit`.
///
/// # Errors
/// Propagates store errors.
pub fn daily_quota(store: &dyn MissionStore, default_limit: u32) -> Result<u32, PipelineError> {
    let limit = store
        .get_policy(DAILY_QUOTA_KEY)?
        .as_ref()
        .and_then(|value| value.get("limit").unwrap_or(value).as_u64())
        .and_then(|limit| u32::try_from(limit).ok());
    Ok(limit.unwrap_or(default_limit))
}

fn enabled_flag(value: &Value) -> Option<bool> {
    value.get("enabled").unwrap_or(value).as_bool()
}
