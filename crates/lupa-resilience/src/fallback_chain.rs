use std::future::Future;

/// Runs `operations` in order, returning the first success. A typed failure
/// advances to the next position; the chain fails only when every position is
/// exhausted, carrying the last error.
pub async fn run_fallback_chain<T, E, Fut, Op>(operations: Vec<Op>) -> Result<T, Vec<E>>
where
    Op: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut errors = Vec::new();
    let total = operations.len();
    for (position, operation) in operations.into_iter().enumerate() {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                tracing::debug!(position, total, "fallback position failed, advancing");
                errors.push(error);
            }
        }
    }
    Err(errors)
}
