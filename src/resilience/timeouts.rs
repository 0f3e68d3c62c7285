//! Deadline enforcement.
//!
//! Every external wait carries a deadline; expiry maps to
//! [`GatewayError::Timeout`] naming the operation.

use std::future::Future;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Run `fut` with a deadline.
pub async fn with_deadline<F, T>(operation: &'static str, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!(operation, deadline_ms = deadline.as_millis() as u64, "Deadline exceeded");
            Err(GatewayError::Timeout { operation })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through_result() {
        let value = with_deadline("noop", Duration::from_secs(1), async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn expiry_names_operation() {
        let err = with_deadline("backend response", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { operation: "backend response" }));
    }
}
