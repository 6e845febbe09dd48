//! Retry with exponential backoff for opening remote inputs

use std::time::Duration;

use crate::stream::StreamError;

/// Exponential backoff: 2^attempt seconds (2s, 4s, 8s, ...)
pub const fn backoff_duration(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt))
}

/// Retry a fallible stream operation with exponential backoff.
///
/// Retryable errors are logged and retried up to `max_retries` times;
/// returns the final `Err` on exhaustion or on a non-retryable error.
pub fn retry_with_backoff<T>(
    label: &str,
    max_retries: u32,
    mut attempt_fn: impl FnMut() -> Result<T, StreamError>,
) -> Result<T, StreamError> {
    retry_with_sleep(label, max_retries, &mut attempt_fn, std::thread::sleep)
}

fn retry_with_sleep<T>(
    label: &str,
    max_retries: u32,
    attempt_fn: &mut impl FnMut() -> Result<T, StreamError>,
    mut sleep: impl FnMut(Duration),
) -> Result<T, StreamError> {
    let mut attempt = 0u32;
    loop {
        match attempt_fn() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries && e.is_retryable() => {
                attempt += 1;
                log::warn!("{label}: attempt {attempt}/{max_retries} failed: {e}, retrying...");
                sleep(backoff_duration(attempt));
            }
            Err(e) => {
                log::error!("{label}: failed permanently: {e}");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_err(status: u16) -> StreamError {
        StreamError::Http {
            status: Some(status),
            message: "test".to_string(),
        }
    }

    #[test]
    fn backoff_exponential() {
        assert_eq!(backoff_duration(1), Duration::from_secs(2));
        assert_eq!(backoff_duration(2), Duration::from_secs(4));
        assert_eq!(backoff_duration(3), Duration::from_secs(8));
    }

    #[test]
    fn retries_until_success() {
        let mut calls = 0;
        let mut slept = Vec::new();
        let result = retry_with_sleep(
            "test",
            3,
            &mut || {
                calls += 1;
                if calls < 3 { Err(http_err(503)) } else { Ok(calls) }
            },
            |d| slept.push(d),
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(slept, vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[test]
    fn gives_up_on_client_error() {
        let mut calls = 0;
        let result: Result<(), _> = retry_with_sleep(
            "test",
            5,
            &mut || {
                calls += 1;
                Err(http_err(404))
            },
            |_| {},
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn stops_after_max_retries() {
        let mut calls = 0;
        let result: Result<(), _> = retry_with_sleep(
            "test",
            2,
            &mut || {
                calls += 1;
                Err(http_err(500))
            },
            |_| {},
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
