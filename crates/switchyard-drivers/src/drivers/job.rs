//! Job driver: runs another proxy endpoint by name.
//!
//! The gateway implements [`JobRunner`] and binds itself after construction;
//! the driver holds only a weak reference so the gateway and its drivers do
//! not keep each other alive.

use std::sync::{Arc, OnceLock, Weak};

use chrono::Utc;
use serde_json::{json, Map, Value};
use switchyard_error::CallError;

use crate::descriptor::{JobRequest, JobTiming};
use crate::{BackendRequest, Driver};

/// Executes a named proxy endpoint as a job.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    /// Run the endpoint called `name` with `attributes` as its request body,
    /// returning the job's response body.
    async fn run_job(&self, name: &str, attributes: Map<String, Value>) -> Result<Value, String>;
}

/// Job driver.
#[derive(Default)]
pub struct JobDriver {
    runner: OnceLock<Weak<dyn JobRunner>>,
}

impl JobDriver {
    /// A driver with no runner bound yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the runner. Only the first binding takes effect.
    pub fn bind(&self, runner: Weak<dyn JobRunner>) {
        if self.runner.set(runner).is_err() {
            tracing::warn!("job runner already bound");
        }
    }

    fn runner(&self) -> Result<Arc<dyn JobRunner>, CallError> {
        self.runner
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| CallError::upstream("job", "no job runner available"))
    }

    async fn run(&self, job: JobRequest) -> Result<Value, CallError> {
        let runner = self.runner()?;
        match job.timing {
            JobTiming::Now => {
                let data = runner
                    .run_job(&job.name, job.attributes)
                    .await
                    .map_err(|e| CallError::upstream("job", e))?;
                Ok(json!({ "data": data }))
            }
            JobTiming::At(at) => {
                let delay = (at - Utc::now()).to_std().unwrap_or_default();
                let name = job.name.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(error) = runner.run_job(&job.name, job.attributes).await {
                        tracing::warn!(job = %job.name, %error, "scheduled job failed");
                    }
                });
                tracing::debug!(job = %name, at = %at.to_rfc3339(), "job scheduled");
                Ok(json!({ "data": { "scheduled": at.to_rfc3339(), "name": name } }))
            }
        }
    }
}

#[async_trait::async_trait]
impl Driver for JobDriver {
    async fn execute(&self, request: BackendRequest, _connection: &Value) -> Result<Value, CallError> {
        match request {
            BackendRequest::Job(job) => self.run(job).await,
            other => Err(CallError::invalid(
                "job",
                format!("cannot execute a {} request", other.kind()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use switchyard_model::BackendKind;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, Map<String, Value>)>>);

    #[async_trait::async_trait]
    impl JobRunner for Recorder {
        async fn run_job(&self, name: &str, attributes: Map<String, Value>) -> Result<Value, String> {
            if name == "broken" {
                return Err("job exploded".into());
            }
            self.0.lock().unwrap().push((name.to_string(), attributes));
            Ok(json!({"ran": name}))
        }
    }

    fn parse(v: Value) -> BackendRequest {
        BackendRequest::parse(BackendKind::Job, &v).unwrap()
    }

    #[tokio::test]
    async fn run_now_returns_job_result() {
        let recorder = Arc::new(Recorder::default());
        let driver = JobDriver::new();
        let weak: Weak<dyn JobRunner> = Arc::downgrade(&(recorder.clone() as Arc<dyn JobRunner>));
        driver.bind(weak);

        let out = driver
            .execute(parse(json!({"name": "nightly", "attributes": {"x": 1}})), &Value::Null)
            .await
            .unwrap();
        assert_eq!(out["data"], json!({"ran": "nightly"}));
        assert_eq!(recorder.0.lock().unwrap()[0].1["x"], 1);

        let err = driver
            .execute(parse(json!({"name": "broken"})), &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }

    #[tokio::test]
    async fn schedule_returns_immediately_then_runs() {
        let recorder = Arc::new(Recorder::default());
        let driver = JobDriver::new();
        driver.bind(Arc::downgrade(&(recorder.clone() as Arc<dyn JobRunner>)));

        let at = (Utc::now() + chrono::Duration::milliseconds(50)).to_rfc3339();
        let out = driver
            .execute(
                parse(json!({"operation": "schedule", "name": "later", "time": at})),
                &Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(out["data"]["name"], "later");
        assert!(recorder.0.lock().unwrap().is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unbound_driver_fails_the_call() {
        let err = JobDriver::new()
            .execute(parse(json!({"name": "x"})), &Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no job runner"));
    }
}
