//! Container driver.
//!
//! Runs `<binary> run --rm [-e K=V]... <image> <command> [args]...` and
//! returns the process output. The image comes from the descriptor or the
//! endpoint's `image`.

use std::process::Stdio;

use serde_json::{json, Value};
use switchyard_error::CallError;
use tokio::process::Command;

use crate::descriptor::ContainerRun;
use crate::{BackendRequest, Driver};

/// Container driver shelling out to a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerDriver {
    binary: String,
}

impl DockerDriver {
    /// Use the given CLI binary (`docker`, `podman`, ...).
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn arguments(run: &ContainerRun, image: &str) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        for (k, v) in &run.env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(image.to_string());
        args.push(run.command.clone());
        args.extend(run.arguments.iter().cloned());
        args
    }
}

impl Default for DockerDriver {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait::async_trait]
impl Driver for DockerDriver {
    async fn execute(&self, request: BackendRequest, connection: &Value) -> Result<Value, CallError> {
        let run = match request {
            BackendRequest::Docker(run) => run,
            other => {
                return Err(CallError::invalid(
                    "docker",
                    format!("cannot execute a {} request", other.kind()),
                ))
            }
        };
        let image = run
            .image
            .clone()
            .or_else(|| connection.get("image").and_then(Value::as_str).map(String::from))
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| CallError::invalid("docker", "image is required"))?;

        let args = Self::arguments(&run, &image);
        tracing::debug!(binary = %self.binary, %image, command = %run.command, "running container");
        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CallError::upstream("docker", format!("cannot run {}: {e}", self.binary)))?;

        Ok(json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "exitCode": output.status.code(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_model::BackendKind;

    #[tokio::test]
    async fn builds_the_run_command_line() {
        let driver = DockerDriver::new("echo");
        let req = BackendRequest::parse(
            BackendKind::Docker,
            &json!({"command": "ls", "arguments": ["-la", "/tmp"], "env": {"A": "1"}}),
        )
        .unwrap();
        let out = driver.execute(req, &json!({"image": "alpine:3"})).await.unwrap();
        assert_eq!(out["stdout"], "run --rm -e A=1 alpine:3 ls -la /tmp\n");
        assert_eq!(out["exitCode"], 0);
    }

    #[tokio::test]
    async fn missing_image_is_invalid() {
        let req = BackendRequest::parse(BackendKind::Docker, &json!({"command": "ls"})).unwrap();
        let err = DockerDriver::default().execute(req, &json!({})).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn missing_binary_is_upstream_failure() {
        let req = BackendRequest::parse(BackendKind::Docker, &json!({"command": "ls", "image": "x"}))
            .unwrap();
        let err = DockerDriver::new("switchyard-no-such-binary")
            .execute(req, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }
}
