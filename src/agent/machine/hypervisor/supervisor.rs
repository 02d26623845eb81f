use std::{
    ffi::OsStr,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use nix::{
    sys::signal::{Signal, kill},
    unistd::{Pid, setsid},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tracing::{info, warn};

/// A machine process started in its own session, so it outlives the agent.
pub struct Supervised {
    pub pid: i32,
    exited: Arc<AtomicBool>,
}

impl Supervised {
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

fn drain<R>(machine: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(machine = %machine, stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!(machine = %machine, stream, "Failed to read output: {}", e);
                    break;
                }
            }
        }
    });
}

pub fn spawn<I, S>(machine: &str, binary: impl AsRef<OsStr>, args: I) -> Result<Supervised>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let binary = binary.as_ref();
    let mut command = Command::new(binary);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // SAFETY: setsid is async-signal-safe and touches no parent state
    unsafe {
        command.pre_exec(|| setsid().map(|_| ()).map_err(std::io::Error::from));
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", binary.to_string_lossy()))?;

    let Some(pid) = child.id() else {
        bail!("{} exited before its pid was read", binary.to_string_lossy());
    };

    if let Some(stdout) = child.stdout.take() {
        drain(machine.to_string(), "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        drain(machine.to_string(), "stderr", stderr);
    }

    let exited = Arc::new(AtomicBool::new(false));
    let machine = machine.to_string();
    let exited_flag = exited.clone();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => info!(machine = %machine, "Process exited: {}", status),
            Err(e) => warn!(machine = %machine, "Failed to wait for process: {}", e),
        }
        exited_flag.store(true, Ordering::SeqCst);
    });

    Ok(Supervised {
        pid: pid as i32,
        exited,
    })
}

/// Signal-0 probe.
pub fn is_alive(pid: i32) -> bool {
    pid > 0 && kill(Pid::from_raw(pid), None).is_ok()
}

pub fn terminate(pid: i32) -> Result<()> {
    if pid <= 0 {
        bail!("invalid pid {pid}");
    }
    kill(Pid::from_raw(pid), Signal::SIGTERM)?;
    Ok(())
}
