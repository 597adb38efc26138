use odb_core::OdbResult;

/// Run `f` until it returns something other than a revision conflict,
/// at most `max_attempts` times. Each attempt starts from scratch; the last
/// conflict is returned once attempts run out.
pub fn retry_on_conflict<T, F>(max_attempts: usize, mut f: F) -> OdbResult<T>
where
    F: FnMut() -> OdbResult<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                tracing::debug!("attempt {} conflicted ({}); retrying", attempt, e);
                attempt += 1;
            }
            Err(e) if e.is_conflict() => {
                tracing::warn!("giving up after {} conflicting attempts", attempt);
                return Err(e);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use odb_core::OdbError;

    use super::*;

    #[test]
    fn test_retries_until_success() {
        let calls = Cell::new(0);
        let value = retry_on_conflict(5, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(OdbError::RevisionConflict(None))
            } else {
                Ok(calls.get())
            }
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: OdbResult<()> = retry_on_conflict(4, || {
            calls.set(calls.get() + 1);
            Err(OdbError::RevisionConflict(None))
        });
        assert!(matches!(result, Err(OdbError::RevisionConflict(None))));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: OdbResult<()> = retry_on_conflict(10, || {
            calls.set(calls.get() + 1);
            Err(OdbError::Disconnected)
        });
        assert!(matches!(result, Err(OdbError::Disconnected)));
        assert_eq!(calls.get(), 1);
    }
}
