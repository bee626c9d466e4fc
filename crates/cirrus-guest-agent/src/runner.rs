//! Function execution inside the VM.
//!
//! Each dispatch gets a scratch directory holding the handler, its
//! dependency manifest, the event/context JSON and a generated Python shim
//! that loads them and calls the entry point. Dependencies, when declared,
//! go into a per-execution virtualenv. The function timeout is enforced
//! here by killing the interpreter.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use cirrus_common::{DispatchPayload, ResultReport};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("unsupported runtime: {0}")]
    UnsupportedRuntime(String),
    #[error("invalid entry point: {0}")]
    InvalidEntryPoint(String),
    #[error("failed to prepare function: {0}")]
    Prepare(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("function timed out after {0} seconds")]
    Timeout(u64),
}

/// Run one dispatch to completion and shape the outcome as the wire-format
/// report. Never fails outright: every error becomes a non-200 report.
pub async fn execute(payload: &DispatchPayload, code_dir: &Path) -> ResultReport {
    let started = Instant::now();
    let exec_dir = code_dir.join(&payload.request_id);

    let outcome = run(payload, &exec_dir).await;
    if let Err(err) = tokio::fs::remove_dir_all(&exec_dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %err, "Failed to clean up execution directory");
        }
    }

    let duration_ms = started.elapsed().as_millis() as i64;
    match outcome {
        Ok(stdout) => ResultReport {
            request_id: payload.request_id.clone(),
            function_id: payload.function_id.clone(),
            status_code: 200,
            output: normalise_output(&stdout),
            error_message: None,
            duration_ms,
            memory_usage_kb: None,
        },
        Err(err) => ResultReport {
            request_id: payload.request_id.clone(),
            function_id: payload.function_id.clone(),
            status_code: 500,
            output: String::new(),
            error_message: Some(err.to_string()),
            duration_ms,
            memory_usage_kb: None,
        },
    }
}

async fn run(payload: &DispatchPayload, exec_dir: &Path) -> Result<String, RunnerError> {
    if !payload.runtime.starts_with("python3") {
        return Err(RunnerError::UnsupportedRuntime(payload.runtime.clone()));
    }
    let (module, function) = parse_entry_point(&payload.entry_point)?;

    let python = prepare(payload, exec_dir, &module, &function).await?;

    let mut command = Command::new(&python);
    command
        .arg("executor.py")
        .current_dir(exec_dir)
        .envs(payload.environment.iter())
        .kill_on_drop(true);

    info!(
        request_id = %payload.request_id,
        entry_point = %payload.entry_point,
        timeout = payload.timeout,
        "Running function"
    );
    let output = tokio::time::timeout(Duration::from_secs(payload.timeout), command.output())
        .await
        .map_err(|_| RunnerError::Timeout(payload.timeout))?
        .map_err(|e| RunnerError::Execution(format!("failed to run interpreter: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RunnerError::Execution(format!(
            "exit status {}: {}{}",
            output.status,
            stdout.trim(),
            stderr.trim()
        )));
    }
    Ok(stdout)
}

/// Write the code payload and the shim; build a virtualenv when the function
/// declares dependencies. Returns the interpreter to use.
async fn prepare(
    payload: &DispatchPayload,
    exec_dir: &Path,
    module: &str,
    function: &str,
) -> Result<PathBuf, RunnerError> {
    let write = |name: &'static str, contents: String| {
        let path = exec_dir.join(name);
        async move {
            tokio::fs::write(&path, contents)
                .await
                .map_err(|e| RunnerError::Prepare(format!("failed to write {name}: {e}")))
        }
    };

    tokio::fs::create_dir_all(exec_dir)
        .await
        .map_err(|e| RunnerError::Prepare(format!("failed to create execution dir: {e}")))?;

    write(
        "handler.py",
        payload.code.clone(),
    )
    .await?;
    write("requirements.txt", payload.requirements.clone()).await?;
    write("function.yaml", payload.config.clone()).await?;
    write("event.json", payload.event.to_string()).await?;
    write("context.json", payload.context.to_string()).await?;
    write("executor.py", shim(module, function, payload.timeout)).await?;

    if payload.requirements.trim().is_empty() {
        return Ok(PathBuf::from("python3"));
    }

    let venv = exec_dir.join("venv");
    run_tool(
        Command::new("python3").args(["-m", "venv"]).arg(&venv).current_dir(exec_dir),
        "create virtualenv",
    )
    .await?;
    run_tool(
        Command::new(venv.join("bin/pip"))
            .args(["install", "-r", "requirements.txt"])
            .current_dir(exec_dir),
        "install requirements",
    )
    .await?;
    Ok(venv.join("bin/python"))
}

async fn run_tool(command: &mut Command, what: &str) -> Result<(), RunnerError> {
    let output = command
        .output()
        .await
        .map_err(|e| RunnerError::Prepare(format!("failed to {what}: {e}")))?;
    if !output.status.success() {
        return Err(RunnerError::Prepare(format!(
            "failed to {what}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Entry points are `<module>.<function>`, both plain identifiers. Anything
/// else is rejected before it can reach the shim.
fn parse_entry_point(entry_point: &str) -> Result<(String, String), RunnerError> {
    let mut parts = entry_point.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(module), Some(function), None)
            if is_identifier(module) && is_identifier(function) =>
        {
            Ok((module.to_string(), function.to_string()))
        }
        _ => Err(RunnerError::InvalidEntryPoint(entry_point.to_string())),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The Python shim: loads event/context from disk, wraps the context dict in
/// a Lambda-style object and prints the handler's result as JSON.
fn shim(module: &str, function: &str, timeout_secs: u64) -> String {
    format!(
        r#"import json
import sys
import time
import traceback

import {module}


class FunctionContext:
    def __init__(self, values, deadline_ms):
        for key, value in values.items():
            setattr(self, key, value)
        self._deadline_ms = deadline_ms

    def get_remaining_time_in_millis(self):
        return max(0, self._deadline_ms - time.time() * 1000)


def main():
    with open("event.json") as f:
        event = json.load(f)
    with open("context.json") as f:
        context_values = json.load(f)
    if not isinstance(event, dict):
        event = {{}}
    if not isinstance(context_values, dict):
        context_values = {{}}

    deadline_ms = time.time() * 1000 + {timeout_ms}
    context = FunctionContext(context_values, deadline_ms)

    result = {module}.{function}(event, context)
    if not isinstance(result, str):
        result = json.dumps(result)
    print(result)


try:
    main()
    sys.exit(0)
except Exception as exc:
    print(json.dumps({{"error": str(exc), "traceback": traceback.format_exc()}}))
    sys.exit(1)
"#,
        module = module,
        function = function,
        timeout_ms = timeout_secs * 1000,
    )
}

/// Callers get JSON: pass handler output through when it already parses,
/// wrap plain text otherwise.
fn normalise_output(stdout: &str) -> String {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return "null".to_string();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(_) => trimmed.to_string(),
        Err(_) => serde_json::json!({ "result": trimmed }).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn payload(code: &str, timeout: u64) -> DispatchPayload {
        DispatchPayload {
            function_id: "f1".to_string(),
            name: "test".to_string(),
            code: code.to_string(),
            requirements: String::new(),
            config: String::new(),
            runtime: "python3.9".to_string(),
            entry_point: "handler.handler".to_string(),
            environment: HashMap::new(),
            request_id: "r1".to_string(),
            timeout,
            memory: 128,
            version: "1.0.0".to_string(),
            event: serde_json::json!({"name": "Ada"}),
            context: serde_json::json!({}),
        }
    }

    #[test]
    fn test_parse_entry_point() {
        assert_eq!(
            parse_entry_point("handler.handler").unwrap(),
            ("handler".to_string(), "handler".to_string())
        );
        assert!(parse_entry_point("handler").is_err());
        assert!(parse_entry_point("a.b.c").is_err());
        assert!(parse_entry_point("mod ule.func").is_err());
        assert!(parse_entry_point("__init__;import os.func").is_err());
    }

    #[test]
    fn test_shim_references_entry_point() {
        let code = shim("handler", "main", 30);
        assert!(code.contains("import handler"));
        assert!(code.contains("handler.main(event, context)"));
        assert!(code.contains("30000"));
    }

    #[test]
    fn test_normalise_output() {
        assert_eq!(normalise_output("{\"hi\": 1}\n"), "{\"hi\": 1}");
        assert_eq!(
            normalise_output("plain words\n"),
            "{\"result\":\"plain words\"}"
        );
        assert_eq!(normalise_output(""), "null");
    }

    #[tokio::test]
    async fn test_unsupported_runtime_is_reported() {
        let mut p = payload("def handler(e, c):\n    return {}\n", 5);
        p.runtime = "node18".to_string();
        let tmp = tempfile::tempdir().unwrap();

        let report = execute(&p, tmp.path()).await;
        assert_eq!(report.status_code, 500);
        assert!(report
            .error_message
            .unwrap()
            .contains("unsupported runtime"));
    }

    #[tokio::test]
    #[ignore = "Requires a python3 interpreter"]
    async fn test_executes_handler_end_to_end() {
        let p = payload(
            "def handler(event, context):\n    return {\"hi\": event.get(\"name\", \"world\")}\n",
            10,
        );
        let tmp = tempfile::tempdir().unwrap();

        let report = execute(&p, tmp.path()).await;
        assert_eq!(report.status_code, 200, "{:?}", report.error_message);
        let output: serde_json::Value = serde_json::from_str(&report.output).unwrap();
        assert_eq!(output["hi"], "Ada");
        assert!(report.duration_ms >= 0);
    }

    #[tokio::test]
    #[ignore = "Requires a python3 interpreter"]
    async fn test_sleeping_handler_times_out() {
        let p = payload(
            "import time\n\ndef handler(event, context):\n    time.sleep(10)\n    return {}\n",
            1,
        );
        let tmp = tempfile::tempdir().unwrap();

        let report = execute(&p, tmp.path()).await;
        assert_eq!(report.status_code, 500);
        assert!(report.error_message.unwrap().contains("timed out"));
    }
}
