use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Exit status `sh` reports when the command itself cannot be found.
const COMMAND_NOT_FOUND: i32 = 127;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Command not found: '{program}' {}", .stderr.trim())]
    NotFound { program: String, stderr: String },
    #[error("Argument list too long for '{program}' ({count} arguments)")]
    ArgumentListTooLong { program: String, count: usize },
    #[error("Error waiting for '{program}': {message}")]
    Wait { program: String, message: String },
    #[error("Failed to kill timed-out process '{program}': {message}")]
    Kill { program: String, message: String },
}

/// One external process invocation. `program` is a shell command line, such as
/// `./test.sh --device 1`; `args` are appended to it as positional parameters and
/// never reinterpreted by the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, pairs: &[(String, String)]) -> Self {
        self.envs.extend(pairs.iter().cloned());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Stdout followed by stderr, the stream diagnostics are parsed from.
    pub fn combined(&self) -> String {
        let mut all = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        all.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stdout.ends_with('\n') && !self.stderr.is_empty() {
            all.push('\n');
        }
        all.push_str(&self.stderr);
        all
    }

    pub fn describe(&self) -> String {
        if self.timed_out {
            "timed out".to_string()
        } else if let Some(code) = self.exit_code {
            format!("exited with code {code}")
        } else if let Some(signal) = self.signal {
            format!("terminated by signal {signal}")
        } else {
            "exited abnormally".to_string()
        }
    }
}

/// Runs external processes on behalf of the engine.
pub trait CommandRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput, RunnerError>;
}

/// Builds the `sh -c` script for `command`. A bare name that exists in `dir`
/// runs from there rather than from `PATH`.
pub fn shell_command(command: &str, dir: &Path) -> String {
    let command = command.trim();
    let program = command.split_whitespace().next().unwrap_or_default();
    let local = !program.is_empty() && !program.contains('/') && dir.join(program).is_file();
    let prefix = if local { "./" } else { "" };
    format!("exec {prefix}{command} \"$@\"")
}

/// Runs real processes through `sh`, capturing their output and enforcing per-invocation timeouts.
#[derive(Debug, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        ShellRunner
    }

    fn wait_with_timeout(
        program: &str,
        child: &mut Child,
        timeout: Option<Duration>,
    ) -> Result<Option<std::process::ExitStatus>, RunnerError> {
        let start_time = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => {
                    if timeout.is_some_and(|limit| start_time.elapsed() > limit) {
                        warn!("'{program}' timed out, killing");
                        child.kill().map_err(|e| RunnerError::Kill {
                            program: program.to_string(),
                            message: e.to_string(),
                        })?;
                        // Reap the killed child.
                        let _ = child.wait();
                        return Ok(None);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(RunnerError::Wait {
                        program: program.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = stream.read_to_end(&mut buffer);
            buffer
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

impl CommandRunner for ShellRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput, RunnerError> {
        debug!(
            "Running '{}' with {} argument(s)",
            invocation.program,
            invocation.args.len()
        );

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(shell_command(&invocation.program, Path::new(".")))
            .arg("sh")
            .args(&invocation.args);
        for (key, value) in &invocation.envs {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::ArgumentListTooLong {
                RunnerError::ArgumentListTooLong {
                    program: invocation.program.clone(),
                    count: invocation.args.len(),
                }
            } else {
                RunnerError::Spawn {
                    program: invocation.program.clone(),
                    source: e,
                }
            }
        })?;

        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let status = Self::wait_with_timeout(&invocation.program, &mut child, invocation.timeout)?;

        let mut output = CommandOutput::default();
        match status {
            Some(status) => {
                output.exit_code = status.code();
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    output.signal = status.signal();
                }
                output.stdout = collect(stdout_reader);
                output.stderr = collect(stderr_reader);
                if output.exit_code == Some(COMMAND_NOT_FOUND) {
                    return Err(RunnerError::NotFound {
                        program: invocation.program.clone(),
                        stderr: output.stderr,
                    });
                }
            }
            // Grandchildren may still hold the pipes open; leave the readers detached.
            None => output.timed_out = true,
        }
        Ok(output)
    }
}
