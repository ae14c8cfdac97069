// ABOUTME: Utility functions for identifier handling and retry logic
// ABOUTME: Provides identifier validation, quoting and exponential backoff

use anyhow::{bail, Result};
use std::time::Duration;

/// Longest identifier PostgreSQL keeps (NAMEDATALEN - 1); longer names are truncated.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Retry a function with exponential backoff
///
/// Executes an async operation with automatic retry on failure. Each retry doubles
/// the delay (exponential backoff) to handle transient failures gracefully.
///
/// # Arguments
///
/// * `operation` - Async function to retry (FnMut returning Future\<Output = Result\<T, E\>\>)
/// * `max_retries` - Maximum number of retry attempts (0 = no retries, just initial attempt)
/// * `initial_delay` - Delay before first retry (doubles each subsequent retry)
///
/// # Returns
///
/// Returns the successful result or the last error after all retries exhausted.
///
/// # Examples
///
/// ```no_run
/// # use std::time::Duration;
/// # use analytics_replicator::utils::retry_with_backoff;
/// # async fn example() -> anyhow::Result<()> {
/// let result = retry_with_backoff(
///     || async { Ok::<_, anyhow::Error>("success") },
///     3,  // Try up to 3 times
///     Duration::from_secs(1)  // Start with 1s delay
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries => {
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}, retrying in {:?}...",
                    attempt + 1,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2; // Exponential backoff
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Validate a PostgreSQL identifier (database, table or column name)
///
/// Identifiers that are interpolated into DDL must be plain: a letter or
/// underscore followed by letters, digits or underscores, at most 63 characters.
///
/// # Examples
///
/// ```
/// # use analytics_replicator::utils::validate_postgres_identifier;
/// assert!(validate_postgres_identifier("analytics").is_ok());
/// assert!(validate_postgres_identifier("_private_db").is_ok());
/// assert!(validate_postgres_identifier("123db").is_err());
/// assert!(validate_postgres_identifier("my-database").is_err());
/// assert!(validate_postgres_identifier("db\"; DROP TABLE users; --").is_err());
/// ```
pub fn validate_postgres_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }

    if trimmed.len() > MAX_IDENTIFIER_LEN {
        bail!(
            "Identifier '{}' exceeds maximum length of {} characters (got {})",
            sanitize_identifier(trimmed),
            MAX_IDENTIFIER_LEN,
            trimmed.len()
        );
    }

    let mut chars = trimmed.chars();
    if let Some(first_char) = chars.next() {
        if !first_char.is_ascii_alphabetic() && first_char != '_' {
            bail!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first_char
            );
        }
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
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
/// Removes control characters and limits length to prevent log injection.
/// This is for display only; SQL safety comes from quoting and bound parameters.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier (database, schema, table, column)
///
/// Escapes embedded quotes and wraps the identifier in double quotes.
///
/// ```
/// use analytics_replicator::utils::quote_ident;
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// The name PostgreSQL actually stores for `identifier`, which silently
/// truncates anything longer than 63 bytes.
pub fn stored_identifier(identifier: &str) -> &str {
    if identifier.len() <= MAX_IDENTIFIER_LEN {
        return identifier;
    }
    let mut end = MAX_IDENTIFIER_LEN;
    while !identifier.is_char_boundary(end) {
        end -= 1;
    }
    &identifier[..end]
}
