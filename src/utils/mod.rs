// Utility functions for the passthrough lifecycle manager

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Logging setup for the binary
pub mod logging {
    use tracing_subscriber::EnvFilter;

    /// Installs a fmt subscriber; `RUST_LOG` wins over the supplied default level
    pub fn init(default_level: &str) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));
        // A second init (tests, embedding) is harmless
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Convenience constructor for a successful run
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { code: Some(0), stdout: stdout.into(), stderr: String::new() }
    }

    /// Convenience constructor for a failed run
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self { code: Some(code), stdout: String::new(), stderr: stderr.into() }
    }
}

const POLL_STEP: Duration = Duration::from_millis(20);

/// Runs a command, killing it once `timeout` elapses.
///
/// A timeout is reported as `io::ErrorKind::TimedOut`; a missing binary as
/// `io::ErrorKind::NotFound`.
pub fn run_command(program: &str, args: &[&str], timeout: Duration) -> io::Result<CommandOutput> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain pipes on helper threads so a chatty child never blocks on a full pipe
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} did not finish within {:?}", program, timeout),
            ));
        }
        thread::sleep(POLL_STEP);
    };

    Ok(CommandOutput {
        code: status.code(),
        stdout: stdout.map(collect).unwrap_or_default(),
        stderr: stderr.map(collect).unwrap_or_default(),
    })
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Writes `value` to a kernel control file, giving up after `timeout`.
///
/// Sysfs writes can block inside the driver (an unbind waiting on a busy
/// device); the write runs on a helper thread that is abandoned on timeout.
pub fn write_with_timeout(path: &Path, value: &str, timeout: Duration) -> io::Result<()> {
    let (tx, rx) = mpsc::channel();
    let path_owned = path.to_path_buf();
    let value = value.to_string();
    thread::spawn(move || {
        let result = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path_owned)
            .and_then(|mut file| file.write_all(value.as_bytes()));
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("write to {} did not finish within {:?}", path.display(), timeout),
        )),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("writer thread for {} exited without reporting", path.display()),
        )),
    }
}

/// Sibling of `file_path` named after the current time
pub fn timestamped_backup_path(file_path: &Path) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.3f").to_string();
    let backup_filename = format!(
        "{}.backup_{}",
        file_path.file_name().unwrap_or_default().to_string_lossy(),
        timestamp
    );
    file_path.with_file_name(backup_filename)
}

/// Helper to create a timestamped backup of a file
pub fn create_timestamped_backup(file_path: &Path) -> io::Result<Option<PathBuf>> {
    if !file_path.exists() {
        return Ok(None);
    }

    let backup_path = timestamped_backup_path(file_path);
    fs::copy(file_path, &backup_path)?;
    Ok(Some(backup_path))
}
