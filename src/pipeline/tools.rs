//! External tool execution with streamed output.
//!
//! Every stdout/stderr line of a tool is logged at debug level as it
//! arrives; the last lines are kept as diagnostics for error reports.

use crate::error::ToolError;
use crate::system::paths::WorkspaceLayout;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Diagnostic lines retained from a tool's output.
pub const DEFAULT_TAIL_LINES: usize = 40;

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        ToolInvocation {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args_from(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|a| a.to_string()));
        self
    }

    /// Append `--flag value`.
    pub fn flag(self, flag: &str, value: impl ToString) -> Self {
        self.arg(flag).arg(value.to_string())
    }

    pub fn path_flag(self, flag: &str, value: &Path) -> Self {
        self.arg(flag).arg(value.display().to_string())
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Subcommand or first argument, for log lines.
    pub fn label(&self) -> String {
        match self.args.first() {
            Some(first) if !first.starts_with('-') => format!("{} {}", self.program, first),
            _ => self.program.clone(),
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// Exit status and trailing output of a finished tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub tail: Vec<String>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run to completion. Only a failure to launch or read output is an `Err`;
    /// a non-zero exit is reported through `ToolOutput`.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError>;
}

/// Runs tools as child processes via tokio.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    tail_lines: usize,
}

impl ProcessRunner {
    pub fn new() -> Self {
        ProcessRunner {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_tail_lines(tail_lines: usize) -> Self {
        ProcessRunner {
            tail_lines: tail_lines.max(1),
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefer an executable installed in the training environment over `PATH`.
pub fn resolve_program(layout: &WorkspaceLayout, name: &str) -> String {
    if name.contains('/') {
        return name.to_string();
    }
    let installed = layout.venv_bin(name);
    if installed.is_file() {
        installed.display().to_string()
    } else {
        name.to_string()
    }
}

fn push_tail(tail: &mut VecDeque<String>, limit: usize, line: String) {
    if tail.len() == limit {
        tail.pop_front();
    }
    tail.push_back(line);
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        log::info!("[Tools] [EXEC] {}", invocation.command_line());

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &invocation.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| ToolError::Launch {
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| ToolError::Launch {
            program: invocation.program.clone(),
            reason: "failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ToolError::Launch {
            program: invocation.program.clone(),
            reason: "failed to capture stderr".to_string(),
        })?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_closed = false;
        let mut stderr_closed = false;
        let mut tail = VecDeque::with_capacity(self.tail_lines);
        let label = invocation.label();

        while !(stdout_closed && stderr_closed) {
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_closed => {
                    match line {
                        Ok(Some(line)) => {
                            log::debug!("[Tools] [{}] {}", label, line);
                            push_tail(&mut tail, self.tail_lines, line);
                        }
                        Ok(None) => stdout_closed = true,
                        Err(e) => {
                            log::warn!("[Tools] [{}] stdout read error: {}", label, e);
                            stdout_closed = true;
                        }
                    }
                }
                line = stderr_lines.next_line(), if !stderr_closed => {
                    match line {
                        Ok(Some(line)) => {
                            log::debug!("[Tools] [{}] [STDERR] {}", label, line);
                            push_tail(&mut tail, self.tail_lines, line);
                        }
                        Ok(None) => stderr_closed = true,
                        Err(e) => {
                            log::warn!("[Tools] [{}] stderr read error: {}", label, e);
                            stderr_closed = true;
                        }
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|e| ToolError::Io {
            program: invocation.program.clone(),
            source: e,
        })?;

        match status.code() {
            Some(0) => log::debug!("[Tools] [{}] exited successfully", label),
            Some(code) => log::warn!("[Tools] [{}] exited with code {}", label, code),
            None => log::warn!("[Tools] [{}] terminated by signal", label),
        }

        Ok(ToolOutput {
            exit_code: status.code(),
            tail: tail.into_iter().collect(),
        })
    }
}
