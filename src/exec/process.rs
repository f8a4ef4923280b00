use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

#[derive(Debug)]
pub enum SpawnFailure {
    NotFound { binary: String },
    Io(std::io::Error),
}

/// Spawn `argv` and wait with a wall-clock timeout, draining stdout/stderr on
/// reader threads so the child can never deadlock on a full pipe. On timeout
/// the child is killed and the partial output is returned with
/// `timed_out = true`.
pub fn run_process(
    argv: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<ProcessOutput, SpawnFailure> {
    let Some((program, args)) = argv.split_first() else {
        return Err(SpawnFailure::Io(std::io::Error::other("empty argv")));
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SpawnFailure::NotFound {
                binary: program.clone(),
            })
        }
        Err(err) => return Err(SpawnFailure::Io(err)),
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SpawnFailure::Io(std::io::Error::other("missing stdout pipe")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SpawnFailure::Io(std::io::Error::other("missing stderr pipe")))?;

    let stdout_reader = thread::spawn(move || {
        let mut buf = String::new();
        let mut reader = BufReader::new(stdout);
        let _ = reader.read_to_string(&mut buf);
        buf
    });
    let stderr_reader = thread::spawn(move || {
        let mut buf = String::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_string(&mut buf);
        buf
    });

    let start = Instant::now();
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => return Err(SpawnFailure::Io(err)),
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    match exit_status {
        Some(status) => Ok(ProcessOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            timed_out: false,
        }),
        None => Ok(ProcessOutput {
            exit_code: None,
            stdout,
            stderr,
            timed_out: true,
        }),
    }
}
