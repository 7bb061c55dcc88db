// ABOUTME: Utility functions for validation and retry handling
// ABOUTME: Provides project URL and table name checks plus exponential backoff

use anyhow::{bail, Context, Result};
use std::future::Future;
use std::time::Duration;
use url::Url;

/// Tables the farm application reads and writes.
///
/// Only used for hints; any valid identifier can be synced.
pub const KNOWN_TABLES: &[&str] = &[
    "sites",
    "zones",
    "modules",
    "cultivation_cycles",
    "stock_movements",
    "farmer_deliveries",
    "site_transfers",
    "incidents",
    "farmers",
    "employees",
    "service_providers",
    "periodic_tests",
    "pest_observations",
    "farmer_credits",
    "repayments",
    "monthly_payments",
    "gallery_photos",
    "message_logs",
    "seaweed_types",
    "credit_types",
    "roles",
];

/// Table read by the connection health check.
pub const HEALTH_PROBE_TABLE: &str = "sites";

pub fn is_known_table(table: &str) -> bool {
    KNOWN_TABLES.contains(&table)
}

/// Validate a project URL
///
/// The URL must parse, use `http` or `https`, and name a host. Paths,
/// queries and fragments are rejected because the REST and realtime
/// endpoints are derived from the base URL.
///
/// # Examples
///
/// ```
/// # use seafarm_sync::utils::validate_project_url;
/// # use anyhow::Result;
/// # fn example() -> Result<()> {
/// validate_project_url("https://abcd.supabase.co")?;
/// validate_project_url("http://localhost:54321")?;
///
/// assert!(validate_project_url("").is_err());
/// assert!(validate_project_url("postgres://localhost/db").is_err());
/// # Ok(())
/// # }
/// ```
pub fn validate_project_url(url: &str) -> Result<Url> {
    if url.trim().is_empty() {
        bail!("Project URL cannot be empty");
    }

    let parsed = Url::parse(url.trim()).with_context(|| {
        format!(
            "Invalid project URL format.\n\
             Expected format: https://<project>.supabase.co\n\
             Got: {}",
            url
        )
    })?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        bail!(
            "Project URL must use http or https, not '{}'",
            parsed.scheme()
        );
    }

    if parsed.host_str().is_none() {
        bail!("Project URL is missing a host");
    }

    if (parsed.path() != "/" && !parsed.path().is_empty())
        || parsed.query().is_some()
        || parsed.fragment().is_some()
    {
        bail!(
            "Project URL must be a base URL without a path, query or fragment.\n\
             Got: {}",
            url
        );
    }

    Ok(parsed)
}

/// Validate a table identifier
///
/// Table names end up in request paths and channel topics, so only ASCII
/// letters, digits and underscores are accepted, starting with a letter or
/// underscore, at most 63 characters.
///
/// # Examples
///
/// ```
/// # use seafarm_sync::utils::validate_table_name;
/// # use anyhow::Result;
/// # fn example() -> Result<()> {
/// validate_table_name("cultivation_cycles")?;
///
/// assert!(validate_table_name("1sites").is_err());
/// assert!(validate_table_name("sites?select=*").is_err());
/// # Ok(())
/// # }
/// ```
pub fn validate_table_name(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Table name cannot be empty or whitespace-only");
    }

    if trimmed.len() > 63 {
        bail!(
            "Table name '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        );
    }

    let mut chars = trimmed.chars();
    if let Some(first_char) = chars.next() {
        if !first_char.is_ascii_alphabetic() && first_char != '_' {
            bail!(
                "Table name '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first_char
            );
        }
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Table name '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(trimmed),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Sanitize an identifier for display
///
/// Removes control characters and limits length so identifiers from
/// untrusted input cannot break log lines.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure<E> {
    /// Attempt number (1-based) that produced `error`
    pub attempts: u32,
    pub error: E,
    /// True if every allowed attempt was used; false if `error` was not retryable
    pub exhausted: bool,
}

/// Retry an operation with exponential backoff
///
/// Runs `operation` up to `max_attempts` times. After a failure that
/// `should_retry` accepts, the delay doubles and the operation runs again:
/// the first retry waits `2 * base_delay`, the second `4 * base_delay`.
/// The closure receives the 1-based attempt number.
///
/// # Examples
///
/// ```no_run
/// # use std::time::Duration;
/// # use seafarm_sync::utils::retry_with_backoff;
/// # async fn example() {
/// let result: Result<&str, String> = retry_with_backoff(
///     |_attempt| async { Ok("success") },
///     3,                          // Try up to 3 times
///     Duration::from_secs(1),     // Retries wait 2s, then 4s
///     |_err: &String| true,
/// )
/// .await
/// .map_err(|failure| failure.error);
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    mut operation: F,
    max_attempts: u32,
    base_delay: Duration,
    should_retry: P,
) -> std::result::Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut delay = base_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&error) {
            return Err(RetryFailure {
                attempts: attempt,
                error,
                exhausted: false,
            });
        }
        if attempt >= max_attempts {
            return Err(RetryFailure {
                attempts: attempt,
                error,
                exhausted: true,
            });
        }

        delay *= 2; // Exponential backoff
        tracing::warn!(
            "Operation failed (attempt {}/{}): {}, retrying in {:?}...",
            attempt,
            max_attempts,
            error,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}
