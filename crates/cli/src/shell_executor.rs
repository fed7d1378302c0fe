use async_trait::async_trait;
use testfleet_common::UnitId;
use testfleet_core::{Executor, UnitResult};
use tokio::process::Command;

/// Runs one unit by shelling out to a configured command template, with
/// `{unit}` substituted for the unit's id. The actual translation from a
/// unit id to test-framework invocation is a framework adapter's job and
/// out of scope here; this is the minimal concrete [`Executor`] the CLI
/// needs to drive real work.
pub struct ShellExecutor {
    program: String,
    args: Vec<String>,
}

impl ShellExecutor {
    /// `template` is a shell command where the literal token `{unit}` is
    /// replaced by the unit id, e.g. `"bundle exec rspec {unit}"`.
    pub fn new(template: &str) -> Self {
        let mut parts = template.split_whitespace();
        let program = parts.next().unwrap_or("true").to_string();
        let args = parts.map(str::to_string).collect();
        Self { program, args }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute_unit(&self, unit_id: &UnitId) -> UnitResult {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{unit}", unit_id.as_str()))
            .collect();

        let output = Command::new(&self.program).args(&args).output().await;

        match output {
            Ok(output) if output.status.success() => UnitResult::Success,
            Ok(output) => {
                let mut payload = String::from_utf8_lossy(&output.stderr).to_string();
                if payload.trim().is_empty() {
                    payload = String::from_utf8_lossy(&output.stdout).to_string();
                }
                UnitResult::Failure(payload)
            }
            Err(e) => UnitResult::Failure(format!("failed to spawn executor: {e}")),
        }
    }
}
