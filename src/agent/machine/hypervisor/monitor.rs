use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::debug;

/// Runtime command channel of a hypervisor process.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn open(&self, socket: &Path) -> Result<Box<dyn ControlSession>>;
}

#[async_trait]
pub trait ControlSession: Send {
    async fn execute(&mut self, command: &str) -> Result<Value>;

    /// Runs a human monitor command line and returns its output.
    async fn human_monitor(&mut self, command_line: &str) -> Result<String>;
}

pub async fn pause(session: &mut dyn ControlSession) -> Result<()> {
    session.execute("stop").await?;
    Ok(())
}

pub async fn resume(session: &mut dyn ControlSession) -> Result<()> {
    session.execute("cont").await?;
    Ok(())
}

pub async fn save_state(session: &mut dyn ControlSession, snapshot: &str) -> Result<()> {
    session.human_monitor(&format!("savevm {snapshot}")).await?;
    Ok(())
}

pub async fn load_state(session: &mut dyn ControlSession, snapshot: &str) -> Result<()> {
    session.human_monitor(&format!("loadvm {snapshot}")).await?;
    Ok(())
}

pub async fn delete_state(session: &mut dyn ControlSession, snapshot: &str) -> Result<()> {
    session.human_monitor(&format!("delvm {snapshot}")).await?;
    Ok(())
}

pub struct QmpChannel;

#[async_trait]
impl ControlChannel for QmpChannel {
    async fn open(&self, socket: &Path) -> Result<Box<dyn ControlSession>> {
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("failed to connect to {}", socket.display()))?;
        let (reader, writer) = stream.into_split();

        let mut session = QmpSession {
            reader: BufReader::new(reader),
            writer,
        };

        let greeting = session.read_message().await?;
        if greeting.get("QMP").is_none() {
            bail!("unexpected greeting: {greeting}");
        }
        session.execute("qmp_capabilities").await?;

        Ok(Box::new(session))
    }
}

struct QmpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpSession {
    async fn read_message(&mut self) -> Result<Value> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            bail!("control socket closed");
        }
        Ok(serde_json::from_str(&line)?)
    }

    async fn request(&mut self, request: Value) -> Result<Value> {
        let mut raw = serde_json::to_vec(&request)?;
        raw.push(b'\n');
        self.writer.write_all(&raw).await?;

        loop {
            let message = self.read_message().await?;
            if let Some(event) = message.get("event") {
                debug!("qmp event {}", event);
                continue;
            }
            if let Some(error) = message.get("error") {
                let desc = error.get("desc").and_then(Value::as_str).unwrap_or("unknown");
                bail!("{}: {}", request["execute"], desc);
            }
            if let Some(value) = message.get("return") {
                return Ok(value.clone());
            }
        }
    }
}

#[async_trait]
impl ControlSession for QmpSession {
    async fn execute(&mut self, command: &str) -> Result<Value> {
        self.request(json!({ "execute": command })).await
    }

    async fn human_monitor(&mut self, command_line: &str) -> Result<String> {
        let value = self
            .request(json!({
                "execute": "human-monitor-command",
                "arguments": { "command-line": command_line },
            }))
            .await?;

        let output = value.as_str().unwrap_or_default().to_string();
        // the monitor reports failures as plain text
        if output.contains("Error") {
            bail!("{}: {}", command_line, output.trim());
        }
        Ok(output)
    }
}
