use clap::Args;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Hidden pane shim. A multiplexer pane merges stdout and stderr into one
/// terminal stream, so the supervisor launches every child through this
/// wrapper: each stream stays visible in the pane and is also appended,
/// line by line, to its own log file for the supervisor to tail.
#[derive(Debug, Args)]
pub struct WrapArgs {
    /// File receiving the child's stdout lines
    #[arg(long)]
    pub stdout_log: PathBuf,
    /// File receiving the child's stderr lines
    #[arg(long)]
    pub stderr_log: PathBuf,
    /// Shell command to run
    #[arg(long)]
    pub command: String,
}

pub async fn run(args: WrapArgs) -> i32 {
    let mut child = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&args.command)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            eprintln!("sidecar wrap: failed to spawn: {err}");
            return 1;
        }
    };

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let out_task = tokio::spawn(tee(stdout, args.stdout_log, false));
    let err_task = tokio::spawn(tee(stderr, args.stderr_log, true));

    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            let _ = child.start_kill();
            match child.wait().await {
                Ok(status) => status.code().unwrap_or(130),
                Err(_) => 130,
            }
        }
        status = child.wait() => {
            match status {
                Ok(status) => status.code().unwrap_or(1),
                Err(_) => 1,
            }
        }
    };

    let _ = out_task.await;
    let _ = err_task.await;
    exit_code
}

/// Copies one stream to the pane and to its log file, line by line.
async fn tee<R: AsyncRead + Unpin>(stream: R, log_path: PathBuf, to_stderr: bool) {
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
        if let Some(log) = log.as_mut() {
            let _ = writeln!(log, "{line}");
        }
    }
}
