use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AccessLogConfig;
use super::RequestLogEntry;

const CHANNEL_CAPACITY: usize = 4096;

/// Access log line layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLogFormat {
    Json,
    Combined,
    Common,
}

impl FromStr for AccessLogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "combined" => Ok(Self::Combined),
            "common" => Ok(Self::Common),
            other => anyhow::bail!("Unknown access log format: {}", other),
        }
    }
}

impl AccessLogFormat {
    pub fn format_line(&self, entry: &RequestLogEntry) -> String {
        let timestamp = entry.timestamp.format("%d/%b/%Y:%H:%M:%S %z");

        match self {
            Self::Combined => format!(
                "{} - - [{}] \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\"\n",
                entry.client,
                timestamp,
                entry.method,
                entry.path,
                entry.status,
                entry.bytes_sent,
                entry.referer.as_deref().unwrap_or("-"),
                entry.user_agent.as_deref().unwrap_or("-")
            ),
            Self::Common => format!(
                "{} - - [{}] \"{} {} HTTP/1.1\" {} {}\n",
                entry.client, timestamp, entry.method, entry.path, entry.status, entry.bytes_sent
            ),
            Self::Json => format!("{}\n", serde_json::to_string(entry).unwrap_or_default()),
        }
    }
}

/// Handle to the background access log writer.
///
/// [`AccessLogger::log`] never waits: when the writer falls behind and the
/// channel is full the line is dropped and counted.
#[derive(Clone)]
pub struct AccessLogger {
    tx: mpsc::Sender<RequestLogEntry>,
    dropped: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl AccessLogger {
    /// Open the configured output and start the writer task
    pub async fn start(config: &AccessLogConfig) -> Result<(Self, JoinHandle<()>)> {
        let format: AccessLogFormat = config.format.parse()?;

        if config.output == "stdout" {
            info!("Access log writing {} lines to stdout", config.format);
            return Ok(Self::spawn(tokio::io::stdout(), format, CHANNEL_CAPACITY));
        }

        let path = Path::new(&config.output);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create access log directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open access log: {}", config.output))?;

        info!("Access log writing {} lines to {}", config.format, config.output);
        Ok(Self::spawn(file, format, CHANNEL_CAPACITY))
    }

    /// Start a writer task over any async writer
    pub fn spawn<W>(writer: W, format: AccessLogFormat, capacity: usize) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(write_loop(rx, BufWriter::new(writer), format, shutdown.clone()));

        let logger = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            shutdown,
        };
        (logger, handle)
    }

    pub fn log(&self, entry: RequestLogEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_access_log_dropped_total").increment(1);
            }
        }
    }

    /// Lines dropped because the writer could not keep up
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting lines. The writer drains what is queued, flushes and exits.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn write_loop<W>(
    mut rx: mpsc::Receiver<RequestLogEntry>,
    mut writer: BufWriter<W>,
    format: AccessLogFormat,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => {
                    write_entry(&mut writer, format, &entry).await;
                    if rx.is_empty() {
                        flush(&mut writer).await;
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled() => {
                rx.close();
                while let Some(entry) = rx.recv().await {
                    write_entry(&mut writer, format, &entry).await;
                }
                break;
            }
        }
    }

    flush(&mut writer).await;
}

async fn write_entry<W: AsyncWrite + Unpin>(writer: &mut BufWriter<W>, format: AccessLogFormat, entry: &RequestLogEntry) {
    let line = format.format_line(entry);
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        error!("Failed to write access log line: {}", e);
    }
}

async fn flush<W: AsyncWrite + Unpin>(writer: &mut BufWriter<W>) {
    if let Err(e) = writer.flush().await {
        error!("Failed to flush access log: {}", e);
    }
}
