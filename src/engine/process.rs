//! Worker-process inference engine
//!
//! Spawns the configured worker binary once per loaded model. The worker logs
//! to stderr while it builds the pipeline and prints a readiness line when
//! done; generations are exchanged as one JSON line each over stdin/stdout.

use super::{EngineError, EngineHandle, GeneratedImage, GenerationRequest, InferenceEngine};
use crate::config::EngineConfig;
use crate::models::ModelDescriptor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Engine backed by one worker process per loaded model
pub struct ProcessEngine {
    config: EngineConfig,
    workers: Mutex<HashMap<u64, Arc<Mutex<Worker>>>>,
    next_id: AtomicU64,
}

impl ProcessEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            workers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn command(&self, descriptor: &ModelDescriptor, model_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.worker_binary);

        cmd.args(&self.config.extra_args)
            .arg("--model-path")
            .arg(model_dir)
            .arg("--model-type")
            .arg(descriptor.model_type.as_str());
        if let Some(variant) = &descriptor.variant {
            cmd.arg("--variant").arg(variant);
        }
        for (key, component) in &descriptor.components {
            let weights = model_dir
                .join("components")
                .join(key)
                .join(&component.weight_name);
            cmd.arg("--component")
                .arg(format!("{key}={}:{}", weights.display(), component.scale));
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Wait for the worker to report ready or fail
    async fn wait_for_ready(
        &self,
        reader: &mut Lines<BufReader<ChildStderr>>,
        model: &str,
    ) -> Result<(), EngineError> {
        let result = timeout(
            Duration::from_secs(self.config.load_timeout_secs),
            monitor_output(reader, model),
        )
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(
                    model = %model,
                    timeout_secs = %self.config.load_timeout_secs,
                    "Model load timed out"
                );
                Err(EngineError::Timeout(self.config.load_timeout_secs))
            }
        }
    }

    async fn worker(&self, handle: &EngineHandle) -> Result<Arc<Mutex<Worker>>, EngineError> {
        self.workers
            .lock()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or(EngineError::UnknownHandle(handle.id))
    }
}

/// Scan worker stderr for readiness or failure indicators
async fn monitor_output(
    reader: &mut Lines<BufReader<ChildStderr>>,
    model: &str,
) -> Result<(), EngineError> {
    while let Ok(Some(line)) = reader.next_line().await {
        tracing::trace!(model = %model, line = %line, "Worker output");

        if line.contains("READY") || line.contains("Pipeline loaded") {
            return Ok(());
        }

        let lower = line.to_ascii_lowercase();
        if lower.contains("out of memory") || line.contains("OutOfMemoryError") {
            return Err(EngineError::OutOfMemory(line));
        }

        if line.contains("Traceback") || line.contains("Error:") || line.contains("error:") {
            let mut error_lines = vec![line];
            for _ in 0..5 {
                match reader.next_line().await {
                    Ok(Some(next_line)) => error_lines.push(next_line),
                    _ => break,
                }
            }
            return Err(EngineError::Load(error_lines.join("\n")));
        }
    }

    Err(EngineError::Load(
        "worker exited before reporting ready".to_string(),
    ))
}

#[async_trait]
impl InferenceEngine for ProcessEngine {
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        model_dir: &Path,
    ) -> Result<EngineHandle, EngineError> {
        let model = descriptor.name.as_str();
        tracing::debug!(
            binary = %self.config.worker_binary,
            model = %model,
            path = %model_dir.display(),
            "Spawning inference worker"
        );

        let mut child = self
            .command(descriptor, model_dir)
            .spawn()
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill().await;
            return Err(EngineError::Spawn("failed to capture worker stdio".to_string()));
        };

        let mut reader = BufReader::new(stderr).lines();
        if let Err(e) = self.wait_for_ready(&mut reader, model).await {
            let _ = child.kill().await;
            return Err(e);
        }

        // Keep draining stderr so the worker never blocks on a full pipe
        let log_model = model.to_string();
        tokio::spawn(async move {
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!(model = %log_model, line = %line, "Worker output");
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let worker = Worker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };
        self.workers
            .lock()
            .await
            .insert(id, Arc::new(Mutex::new(worker)));

        tracing::info!(model = %model, handle = id, "Model loaded in worker");
        Ok(EngineHandle {
            id,
            model: model.to_string(),
        })
    }

    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError> {
        let worker = self
            .workers
            .lock()
            .await
            .remove(&handle.id)
            .ok_or(EngineError::UnknownHandle(handle.id))?;

        let mut worker = worker.lock().await;
        if let Err(e) = worker.child.kill().await {
            tracing::warn!(model = %handle.model, error = %e, "Failed to kill worker");
        }
        tracing::info!(model = %handle.model, handle = handle.id, "Worker stopped");
        Ok(())
    }

    async fn generate(
        &self,
        handle: &EngineHandle,
        request: &GenerationRequest,
    ) -> Result<GeneratedImage, EngineError> {
        let worker = self.worker(handle).await?;
        let mut worker = worker.lock().await;

        let mut line =
            serde_json::to_string(request).map_err(|e| EngineError::Protocol(e.to_string()))?;
        line.push('\n');
        worker
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| EngineError::Protocol(format!("failed to send request: {e}")))?;
        worker
            .stdin
            .flush()
            .await
            .map_err(|e| EngineError::Protocol(format!("failed to send request: {e}")))?;

        let reply = worker
            .stdout
            .next_line()
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))?
            .ok_or_else(|| EngineError::Protocol("worker closed its output".to_string()))?;

        parse_reply(&reply)
    }
}

/// `{"ok": true, "path": ..}` or `{"ok": false, "error": ..}`
fn parse_reply(reply: &str) -> Result<GeneratedImage, EngineError> {
    let value: serde_json::Value = serde_json::from_str(reply)
        .map_err(|e| EngineError::Protocol(format!("invalid reply: {e}")))?;

    if value.get("ok").and_then(|v| v.as_bool()) != Some(true) {
        let reason = value
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("worker reported failure");
        return Err(EngineError::Generation(reason.to_string()));
    }

    serde_json::from_value(value).map_err(|e| EngineError::Protocol(format!("invalid reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_engine(script: &str, load_timeout_secs: u64) -> ProcessEngine {
        ProcessEngine::new(EngineConfig {
            worker_binary: "sh".to_string(),
            load_timeout_secs,
            extra_args: vec!["-c".to_string(), script.to_string(), "worker".to_string()],
        })
    }

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new("m", "org/m", "flux").unwrap()
    }

    #[test]
    fn test_parse_reply() {
        let image = parse_reply(r#"{"ok": true, "path": "/tmp/a.png", "seed": 3}"#).unwrap();
        assert_eq!(image.seed, Some(3));

        let err = parse_reply(r#"{"ok": false, "error": "NaN latents"}"#).unwrap_err();
        assert!(matches!(err, EngineError::Generation(reason) if reason == "NaN latents"));

        assert!(matches!(parse_reply("nope"), Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let engine = ProcessEngine::new(EngineConfig {
            worker_binary: "/nonexistent/worker-12345".to_string(),
            ..Default::default()
        });
        let err = engine.load(&descriptor(), Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_generate_unload() {
        let script = r#"echo "loading" >&2; echo "READY" >&2; while read line; do echo '{"ok":true,"path":"/tmp/out.png","seed":7}'; done"#;
        let engine = shell_engine(script, 10);

        let handle = engine.load(&descriptor(), Path::new("/tmp")).await.unwrap();
        assert_eq!(handle.model, "m");

        let image = engine
            .generate(&handle, &GenerationRequest::new("a red barn"))
            .await
            .unwrap();
        assert_eq!(image.seed, Some(7));

        engine.unload(handle.clone()).await.unwrap();
        assert!(matches!(
            engine.generate(&handle, &GenerationRequest::new("x")).await,
            Err(EngineError::UnknownHandle(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_out_of_memory_classified() {
        let engine = shell_engine(r#"echo "torch.OutOfMemoryError: CUDA out of memory" >&2; sleep 5"#, 10);
        let err = engine.load(&descriptor(), Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, EngineError::OutOfMemory(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_load_error() {
        let engine = shell_engine("exit 1", 10);
        let err = engine.load(&descriptor(), Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, EngineError::Load(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_timeout() {
        let engine = shell_engine("sleep 5", 1);
        let err = engine.load(&descriptor(), Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(1)));
    }
}
