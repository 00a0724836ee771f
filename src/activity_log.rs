//! Activity Logging Module
//!
//! Provides structured activity logging for auditing and debugging.
//! IMPORTANT: This module must NEVER log PHI (Protected Health Information)
//! or credentials.
//!
//! What IS logged:
//! - Clinic user ids and EMR system names
//! - OAuth actions and outcomes (success/failure)
//! - Provider HTTP status codes, attempt numbers, durations
//! - Result counts and FHIR resource ids
//! - Error kinds and sanitized messages
//!
//! What is NOT logged:
//! - Access tokens, refresh tokens, client secrets, authorization codes
//! - OAuth state values
//! - Patient names, birth dates, contact details
//! - Search criteria or FHIR resource bodies

use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::Config;
use crate::emr::EmrSystem;

/// Guard that must be held for the duration of the process
/// to ensure logs are flushed before exit
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the activity logging system
///
/// Sets up dual logging:
/// - Console output (human-readable, filtered by `RUST_LOG`)
/// - File output (JSON, for auditing and analysis)
///
/// Log files are stored in ~/.emr-gateway/logs/ with daily rotation
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = get_log_directory()?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "activity.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    info!(
        event = "logging_initialized",
        log_dir = %log_dir.display(),
        "Activity logging system initialized"
    );

    Ok(())
}

/// Console-only logging, used when the log directory is unavailable
pub fn init_console_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Get the log directory path
fn get_log_directory() -> Result<PathBuf, Box<dyn std::error::Error>> {
    Ok(Config::config_dir()?.join("logs"))
}

// ============================================================================
// OAuth Events
// ============================================================================

/// Log an OAuth action against a provider
pub fn log_emr_auth(
    action: &str, // "authorize", "exchange", "disconnect"
    system: EmrSystem,
    user_id: Option<&str>,
    success: bool,
    error: Option<&str>,
) {
    if success {
        info!(
            event = "emr_auth",
            action = %action,
            system = %system,
            user_id = user_id,
            success = true,
            "EMR authentication action"
        );
    } else {
        warn!(
            event = "emr_auth",
            action = %action,
            system = %system,
            user_id = user_id,
            success = false,
            error = error,
            "EMR authentication failed"
        );
    }
}

/// Log a refresh-token grant
pub fn log_token_refresh(system: EmrSystem, user_id: &str, success: bool, error: Option<&str>) {
    if success {
        info!(
            event = "token_refresh",
            system = %system,
            user_id = %user_id,
            success = true,
            "EMR access token refreshed"
        );
    } else {
        warn!(
            event = "token_refresh",
            system = %system,
            user_id = %user_id,
            success = false,
            error = error,
            "EMR token refresh failed"
        );
    }
}

// ============================================================================
// Provider Request Events
// ============================================================================

/// Log one outbound provider request (status only, never URL or body)
pub fn log_provider_request(
    system: EmrSystem,
    operation: &str, // "token", "search", "read", "create"
    status: Option<u16>,
    attempt: u32,
    duration_ms: u64,
) {
    match status {
        Some(code) if code < 400 => info!(
            event = "provider_request",
            system = %system,
            operation = %operation,
            status = code,
            attempt = attempt,
            duration_ms = duration_ms,
            "Provider request completed"
        ),
        _ => warn!(
            event = "provider_request",
            system = %system,
            operation = %operation,
            status = status,
            attempt = attempt,
            duration_ms = duration_ms,
            "Provider request failed"
        ),
    }
}

/// Log a completed FHIR operation
pub fn log_fhir_operation(
    system: EmrSystem,
    user_id: &str,
    operation: &str,
    result_count: usize,
    success: bool,
    error_kind: Option<&str>,
) {
    if success {
        info!(
            event = "fhir_operation",
            system = %system,
            user_id = %user_id,
            operation = %operation,
            result_count = result_count,
            success = true,
            "FHIR operation completed"
        );
    } else {
        warn!(
            event = "fhir_operation",
            system = %system,
            user_id = %user_id,
            operation = %operation,
            success = false,
            error_kind = error_kind,
            "FHIR operation failed"
        );
    }
}

// ============================================================================
// Application Lifecycle Events
// ============================================================================

/// Log application start
pub fn log_app_start(version: &str, systems: &[EmrSystem]) {
    let systems: Vec<&str> = systems.iter().map(|s| s.as_str()).collect();
    info!(
        event = "app_start",
        version = %version,
        systems = ?systems,
        "EMR gateway started"
    );
}

/// Log application shutdown
pub fn log_app_shutdown(reason: &str) {
    info!(
        event = "app_shutdown",
        reason = %reason,
        "EMR gateway shutting down"
    );
}
