//! Per-backend timeout wrapper for drivers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use switchyard_error::CallError;

use crate::{BackendRequest, Driver};

/// A [`Driver`] that enforces a per-call timeout on the inner driver.
pub struct TimeoutDriver {
    inner: Arc<dyn Driver>,
    timeout: Duration,
}

impl TimeoutDriver {
    /// Wrap an inner driver with a per-call timeout.
    pub fn new(inner: Arc<dyn Driver>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait::async_trait]
impl Driver for TimeoutDriver {
    #[tracing::instrument(skip(self, request, connection), fields(backend = %request.kind()))]
    async fn execute(
        &self,
        request: BackendRequest,
        connection: &Value,
    ) -> Result<Value, CallError> {
        let backend = request.kind();
        match tokio::time::timeout(self.timeout, self.inner.execute(request, connection)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(CallError::Timeout {
                backend: backend.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::HttpRequest;
    use std::collections::BTreeMap;

    struct InstantDriver;

    #[async_trait::async_trait]
    impl Driver for InstantDriver {
        async fn execute(
            &self,
            _request: BackendRequest,
            _connection: &Value,
        ) -> Result<Value, CallError> {
            Ok(serde_json::json!({"status": "ok"}))
        }
    }

    struct SlowDriver {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Driver for SlowDriver {
        async fn execute(
            &self,
            _request: BackendRequest,
            _connection: &Value,
        ) -> Result<Value, CallError> {
            tokio::time::sleep(self.delay).await;
            Ok(serde_json::json!({"status": "ok"}))
        }
    }

    fn request() -> BackendRequest {
        BackendRequest::Http(HttpRequest {
            method: "GET".into(),
            url: Some("http://localhost".into()),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
        })
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let driver = TimeoutDriver::new(Arc::new(InstantDriver), Duration::from_secs(5));
        let result = driver.execute(request(), &Value::Null).await.unwrap();
        assert_eq!(result["status"], "ok");
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let driver = TimeoutDriver::new(
            Arc::new(SlowDriver {
                delay: Duration::from_secs(10),
            }),
            Duration::from_millis(50),
        );
        let err = driver.execute(request(), &Value::Null).await.unwrap_err();
        match &err {
            CallError::Timeout {
                backend,
                timeout_ms,
            } => {
                assert_eq!(backend, "http");
                assert_eq!(*timeout_ms, 50);
            }
            other => panic!("expected Timeout, got: {other:?}"),
        }
        assert!(err.retryable());
    }
}
