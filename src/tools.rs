//! Tool Adapter Layer (C5): renders a tool profile + task context into a
//! concrete subprocess invocation, captures stdout/stderr/exit/duration,
//! and enforces a hard timeout with SIGTERM→SIGKILL escalation (spec
//! §4.5).
//!
//! Grounded on `tokio::process::Command` usage patterns in the pack
//! (the teacher declares `tokio` with the `process` feature but has no
//! subprocess call sites of its own to imitate directly, so the
//! spawn/timeout shape here follows `tokio::process::Command`'s
//! documented `kill_on_drop` + `tokio::time::timeout` idiom, the
//! standard way this is done in the ecosystem); the SIGTERM→SIGKILL
//! escalation itself uses `nix::sys::signal::kill`, the same signal
//! crate `examples/Alb-O-xeno/crates/nu/system` depends on for process
//! signaling.

use crate::errors::ToolError;
use crate::model::{SafetyTier, ToolId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

const OUTPUT_CAP_BYTES: usize = 1024 * 1024;
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Static configuration for one tool, loaded from config (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolProfile {
    pub tool_id: ToolId,
    /// Positional/named placeholders rendered as `{name}`.
    pub command_template: Vec<String>,
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    pub timeout_secs: u64,
    pub safety_tier: SafetyTier,
    #[serde(default)]
    pub stdin_source: Option<String>,
    #[serde(default)]
    pub patch_converter_id: Option<String>,
    #[serde(default)]
    pub generally_capable: bool,
    /// Consulted only when the enclosing config's `mock_mode` is on
    /// (SPEC_FULL.md §15, Open Question 1); never bypasses Guardrails
    /// or the Ledger — it substitutes only the subprocess spawn.
    #[serde(default)]
    pub mock_response: Option<MockResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
    pub duration: Duration,
}

pub struct ToolAdapter {
    working_dir: std::path::PathBuf,
}

impl ToolAdapter {
    pub fn new(working_dir: std::path::PathBuf) -> Self {
        Self { working_dir }
    }

    /// Render the command template against task metadata. No shell
    /// expansion — the result is handed directly to `argv[1..]`.
    pub fn render_argv(
        profile: &ToolProfile,
        context: &HashMap<String, String>,
    ) -> Result<Vec<String>, ToolError> {
        let mut argv = Vec::with_capacity(profile.command_template.len());
        for part in &profile.command_template {
            argv.push(render_placeholder(&profile.tool_id, part, context)?);
        }
        Ok(argv)
    }

    /// Run the tool to completion, real or mocked. `mock_mode` gates
    /// whether `profile.mock_response` is honored (SPEC_FULL.md §15).
    pub async fn run(
        &self,
        profile: &ToolProfile,
        context: &HashMap<String, String>,
        mock_mode: bool,
    ) -> Result<ToolResult, ToolError> {
        let started_at = chrono::Utc::now();

        if mock_mode && let Some(mock) = &profile.mock_response {
            let completed_at = chrono::Utc::now();
            return Ok(ToolResult {
                exit_code: Some(mock.exit_code),
                stdout: mock.stdout.clone(),
                stderr: mock.stderr.clone(),
                timed_out: false,
                started_at,
                completed_at,
                duration: (completed_at - started_at).to_std().unwrap_or_default(),
            });
        }

        let argv = Self::render_argv(profile, context)?;
        let Some((program, args)) = argv.split_first() else {
            return Err(ToolError::UndefinedPlaceholder {
                tool_id: profile.tool_id.clone(),
                placeholder: "<empty command_template>".into(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for key in &profile.env_allowlist {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            tool_id: profile.tool_id.clone(),
            source,
        })?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let timeout = Duration::from_secs(profile.timeout_secs);
        let wait_result = tokio::time::timeout(timeout, child.wait()).await;

        let (exit_code, timed_out) = match wait_result {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(_)) => (None, false),
            Err(_) => {
                escalate_kill(&mut child).await;
                (None, true)
            }
        };

        let stdout = read_capped(&mut stdout_pipe).await;
        let stderr = read_capped(&mut stderr_pipe).await;

        let completed_at = chrono::Utc::now();
        let duration = (completed_at - started_at).to_std().unwrap_or_default();

        if timed_out {
            return Err(ToolError::Timeout {
                tool_id: profile.tool_id.clone(),
                timeout_secs: profile.timeout_secs,
            });
        }

        Ok(ToolResult {
            exit_code,
            stdout,
            stderr,
            timed_out,
            started_at,
            completed_at,
            duration,
        })
    }
}

fn render_placeholder(
    tool_id: &str,
    part: &str,
    context: &HashMap<String, String>,
) -> Result<String, ToolError> {
    if !part.contains('{') {
        return Ok(part.to_string());
    }
    let mut out = String::with_capacity(part.len());
    let mut chars = part.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut name = String::new();
            for c2 in chars.by_ref() {
                if c2 == '}' {
                    break;
                }
                name.push(c2);
            }
            match context.get(&name) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(ToolError::UndefinedPlaceholder {
                        tool_id: tool_id.to_string(),
                        placeholder: name,
                    });
                }
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

async fn read_capped(pipe: &mut Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let Some(pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::with_capacity(4096);
    let mut limited = pipe.take(OUTPUT_CAP_BYTES as u64 + 1);
    let _ = limited.read_to_end(&mut buf).await;
    let truncated = buf.len() > OUTPUT_CAP_BYTES;
    buf.truncate(OUTPUT_CAP_BYTES);
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        s.push_str("\n...[truncated]");
    }
    s
}

#[cfg(unix)]
async fn escalate_kill(child: &mut tokio::process::Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let pid = Pid::from_raw(pid as i32);
        let _ = kill(pid, Signal::SIGTERM);
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            let _ = kill(pid, Signal::SIGKILL);
        }
    }
    let _ = child.kill().await;
}

#[cfg(not(unix))]
async fn escalate_kill(child: &mut tokio::process::Child) {
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(template: Vec<&str>, timeout_secs: u64) -> ToolProfile {
        ToolProfile {
            tool_id: "tool_a".into(),
            command_template: template.into_iter().map(String::from).collect(),
            env_allowlist: vec![],
            timeout_secs,
            safety_tier: SafetyTier::Low,
            stdin_source: None,
            patch_converter_id: None,
            generally_capable: true,
            mock_response: None,
        }
    }

    #[test]
    fn render_argv_substitutes_placeholders() {
        let p = profile(vec!["echo", "{message}"], 5);
        let mut ctx = HashMap::new();
        ctx.insert("message".to_string(), "hi".to_string());
        let argv = ToolAdapter::render_argv(&p, &ctx).unwrap();
        assert_eq!(argv, vec!["echo".to_string(), "hi".to_string()]);
    }

    #[test]
    fn render_argv_fails_at_render_time_for_undefined_placeholder() {
        let p = profile(vec!["echo", "{missing}"], 5);
        let ctx = HashMap::new();
        let err = ToolAdapter::render_argv(&p, &ctx).unwrap_err();
        assert!(matches!(err, ToolError::UndefinedPlaceholder { .. }));
    }

    #[tokio::test]
    async fn run_executes_real_process_and_captures_output() {
        let adapter = ToolAdapter::new(std::env::temp_dir());
        let p = profile(vec!["echo", "{message}"], 5);
        let mut ctx = HashMap::new();
        ctx.insert("message".to_string(), "hello-world".to_string());

        let result = adapter.run(&p, &ctx, false).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains("hello-world"));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn run_honors_mock_response_when_mock_mode_enabled() {
        let adapter = ToolAdapter::new(std::env::temp_dir());
        let mut p = profile(vec!["unused"], 5);
        p.mock_response = Some(MockResponse {
            exit_code: 0,
            stdout: "mocked output".into(),
            stderr: String::new(),
        });

        let result = adapter.run(&p, &HashMap::new(), true).await.unwrap();
        assert_eq!(result.stdout, "mocked output");
    }

    #[tokio::test]
    async fn run_times_out_long_running_process() {
        let adapter = ToolAdapter::new(std::env::temp_dir());
        let p = profile(vec!["sleep", "10"], 1);
        let result = adapter.run(&p, &HashMap::new(), false).await;
        assert!(matches!(result, Err(ToolError::Timeout { .. })));
    }
}
