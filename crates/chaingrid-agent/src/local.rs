//! Agent that runs executables as child processes on this machine.

use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use chaingrid_state::{ProcessChain, ProcessChainResults};
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::Agent;
use crate::error::{AgentError, AgentResult};

/// Default number of trailing output lines kept per executable.
pub const DEFAULT_OUTPUT_LINES: usize = 100;

/// Runs a process chain's executables one after another. Each
/// executable's trailing stdout lines are reported under its id.
pub struct LocalAgent {
    id: String,
    output_lines_to_collect: usize,
}

impl LocalAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            output_lines_to_collect: DEFAULT_OUTPUT_LINES,
        }
    }

    pub fn with_output_lines(mut self, lines: usize) -> Self {
        self.output_lines_to_collect = lines;
        self
    }

    fn tail(&self, bytes: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(bytes);
        let mut lines = VecDeque::with_capacity(self.output_lines_to_collect);
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            if lines.len() == self.output_lines_to_collect {
                lines.pop_front();
            }
            lines.push_back(line.to_string());
        }
        lines.into()
    }
}

#[async_trait]
impl Agent for LocalAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        process_chain: &ProcessChain,
        cancel: CancellationToken,
    ) -> AgentResult<ProcessChainResults> {
        let mut results = ProcessChainResults::new();
        for exe in &process_chain.executables {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            debug!(agent = %self.id, process_chain_id = %process_chain.id, executable = %exe.id, path = %exe.path, "starting executable");

            let mut command = Command::new(&exe.path);
            command.args(&exe.arguments);
            command.kill_on_drop(true);
            command.stdin(Stdio::null());
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());

            let output = tokio::select! {
                output = command.output() => output.map_err(|e| {
                    AgentError::Execution(format!("could not start {}: {e}", exe.path))
                })?,
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            };

            if !output.status.success() {
                let mut detail = self.tail(&output.stderr);
                if detail.is_empty() {
                    detail = self.tail(&output.stdout);
                }
                return Err(AgentError::Execution(format!(
                    "{} exited with {}: {}",
                    exe.id,
                    output.status,
                    detail.join("\n")
                )));
            }

            let lines = self.tail(&output.stdout);
            results.insert(exe.id.clone(), lines.into_iter().map(Value::String).collect());
        }
        info!(agent = %self.id, process_chain_id = %process_chain.id, executables = process_chain.executables.len(), "process chain finished");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaingrid_state::{CapabilitySet, Executable};
    use serde_json::json;
    use std::time::Duration;

    fn sh(id: &str, script: &str) -> Executable {
        Executable {
            id: id.to_string(),
            path: "sh".to_string(),
            arguments: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn chain(executables: Vec<Executable>) -> ProcessChain {
        ProcessChain {
            id: "pc-1".to_string(),
            executables,
            required_capabilities: CapabilitySet::new(),
        }
    }

    #[tokio::test]
    async fn collects_output_per_executable() {
        let agent = LocalAgent::new("local").with_output_lines(2);
        let pc = chain(vec![
            sh("first", "echo a; echo b; echo c"),
            sh("second", "echo done"),
        ]);
        let results = agent.execute(&pc, CancellationToken::new()).await.unwrap();
        assert_eq!(results["first"], vec![json!("b"), json!("c")]);
        assert_eq!(results["second"], vec![json!("done")]);
    }

    #[tokio::test]
    async fn failing_executable_reports_error() {
        let agent = LocalAgent::new("local");
        let pc = chain(vec![sh("bad", "echo broken >&2; exit 3"), sh("never", "echo x")]);
        let err = agent
            .execute(&pc, CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AgentError::Execution(message) => {
                assert!(message.contains("bad"));
                assert!(message.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_an_execution_error() {
        let agent = LocalAgent::new("local");
        let pc = chain(vec![Executable {
            id: "x".into(),
            path: "/definitely/not/here".into(),
            arguments: vec![],
        }]);
        assert!(matches!(
            agent.execute(&pc, CancellationToken::new()).await,
            Err(AgentError::Execution(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_running_executable() {
        let agent = LocalAgent::new("local");
        let pc = chain(vec![sh("sleepy", "sleep 30")]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = agent.execute(&pc, cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
