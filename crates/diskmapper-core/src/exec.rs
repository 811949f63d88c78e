//! Bounded execution of external binaries.
//!
//! Shell integration is kept here so backends stay testable against fake
//! binaries and deterministic stdout parsing.

use crate::error::{DiskMapperError, DiskMapperResult};
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Captured result of one command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// Prefer stderr, fall back to stdout; trimmed.
    pub fn diagnostic(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        self.stdout_string()
    }
}

/// A binary plus the deadline applied to every invocation of it.
#[derive(Debug, Clone)]
pub struct BoundedCommand {
    binary: PathBuf,
    timeout: Duration,
    envs: Vec<(String, String)>,
}

impl BoundedCommand {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            envs: Vec::new(),
        }
    }

    /// Set an environment variable on the child only.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run with `args`, optionally feeding `input` on stdin.
    ///
    /// Key material is only ever passed through `input`, never on argv.
    pub fn run<S: AsRef<OsStr>>(
        &self,
        args: &[S],
        input: Option<&[u8]>,
    ) -> DiskMapperResult<CommandOutput> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            DiskMapperError::Command(format!(
                "failed to spawn {}: {err}",
                self.binary.display()
            ))
        })?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                match stdin.write_all(payload) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(err) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(err.into());
                    }
                }
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> DiskMapperResult<CommandOutput> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DiskMapperError::Command(format!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| DiskMapperError::Command("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| DiskMapperError::Command("stderr reader thread panicked".into()))??;

        Ok(CommandOutput {
            stdout,
            stderr,
            status: status.code().unwrap_or(-1),
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<DiskMapperResult<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> DiskMapperResult<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

/// Return the first existing path among `configured` and `candidates`, then `$PATH`.
pub fn locate_binary(
    configured: Option<&str>,
    candidates: &[&str],
    name: &str,
) -> DiskMapperResult<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(DiskMapperError::InvalidConfig(format!(
                "{name} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    if let Some(found) = candidates.iter().map(Path::new).find(|p| p.exists()) {
        return Ok(found.to_path_buf());
    }

    find_in_path(name).ok_or_else(|| {
        DiskMapperError::InvalidConfig(format!(
            "unable to locate {name} binary; tried {candidates:?} and PATH"
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.exists())
}
