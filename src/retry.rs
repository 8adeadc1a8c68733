// ENCLAVE-BENCH RETRY-UNTIL-READY GATE
// POLLS A CHEAP CONNECTIVITY PROBE AGAINST A PEER STILL IN ITS STARTUP
// WINDOW. EVERY FAILURE MEANS "NOT READY YET": PRINT A DOT, TRY AGAIN.
// NO DELAY BETWEEN ATTEMPTS. NOT A GENERAL RETRY POLICY -- ONLY WRAP
// PROBES WITHOUT SIDE EFFECTS.

use std::io::{self, Write};

use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    // None: RETRY FOREVER
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    pub fn capped(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
        }
    }
}

#[derive(Debug, Error)]
#[error("peer not ready after {attempts} attempts: {last}")]
pub struct RetryError<E: std::fmt::Display + std::fmt::Debug> {
    pub attempts: u32,
    pub last: E,
}

// RETURNS THE FIRST SUCCESS. `on_retry` SEES EACH FAILURE AND ITS ATTEMPT NUMBER.
pub fn retry_until_ready<T, E, P, R>(
    policy: RetryPolicy,
    mut probe: P,
    mut on_retry: R,
) -> Result<T, RetryError<E>>
where
    P: FnMut() -> Result<T, E>,
    R: FnMut(&E, u32),
    E: std::fmt::Display + std::fmt::Debug,
{
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        match probe() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(RetryError { attempts: attempt, last: e });
                }
                on_retry(&e, attempt);
            }
        }
    }
}

// PROGRESS INDICATOR FOR INTERACTIVE USE
pub fn print_dot<E: std::fmt::Display>(err: &E, attempt: u32) {
    tracing::debug!(attempt, "peer not ready: {}", err);
    print!(".");
    let _ = io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn fails_twice_then_succeeds() {
        let calls = Cell::new(0u32);
        let mut retries = Vec::new();
        let result = retry_until_ready(
            RetryPolicy::unbounded(),
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(format!("refused #{}", calls.get()))
                } else {
                    Ok("connected")
                }
            },
            |e: &String, n| retries.push((e.clone(), n)),
        );
        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.get(), 3);
        assert_eq!(
            retries,
            vec![("refused #1".to_string(), 1), ("refused #2".to_string(), 2)]
        );
    }

    #[test]
    fn first_success_is_not_retried() {
        let calls = Cell::new(0u32);
        let result: Result<u8, RetryError<String>> = retry_until_ready(
            RetryPolicy::unbounded(),
            || {
                calls.set(calls.get() + 1);
                Ok(7)
            },
            |_, _| panic!("no retry expected"),
        );
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn cap_stops_after_max_attempts() {
        let calls = Cell::new(0u32);
        let result: Result<(), RetryError<&str>> = retry_until_ready(
            RetryPolicy::capped(4),
            || {
                calls.set(calls.get() + 1);
                Err("down")
            },
            |_, _| {},
        );
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last, "down");
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn zero_cap_still_probes_once() {
        assert_eq!(RetryPolicy::capped(0).max_attempts, Some(1));
    }
}
