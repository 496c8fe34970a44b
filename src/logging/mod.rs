use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use env_logger::{Builder, Env, Target};
use log::LevelFilter;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, metadata, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
};

use crate::config;

/// Sets up `log` for the whole process.
///
/// Without a log path lines go to stderr. With one, a [`Logger`] is
/// returned that must be added to the server so lines reach the file.
/// `RUST_LOG` overrides the configured level.
pub fn init(log: &config::Log) -> Option<Logger> {
    let level = LevelFilter::from(log.level);
    match &log.path {
        Some(path) => {
            let logger = Logger::new(path.clone());
            logger.init_env_logger(level);
            Some(logger)
        }
        None => {
            builder(level).init();
            None
        }
    }
}

fn builder(level: LevelFilter) -> Builder {
    let mut builder = Builder::new();
    builder.filter_level(level).parse_env(Env::default());
    builder
}

enum LogMessage {
    Line(Vec<u8>),
    /// Acknowledged once everything queued before it is on disk.
    Flush(oneshot::Sender<()>),
}

pub struct AsyncWriter {
    sender: UnboundedSender<LogMessage>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let data = buf.to_vec();
        self.sender
            .send(LogMessage::Line(data))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Asks a running [`Logger`] service to push its buffered lines to disk.
#[derive(Clone)]
pub struct LogFlusher {
    sender: UnboundedSender<LogMessage>,
}

impl LogFlusher {
    /// Returns false if the sink did not confirm within `timeout`, for
    /// instance because the service is not running.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (ack, done) = oneshot::channel();
        if self.sender.send(LogMessage::Flush(ack)).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, done).await, Ok(Ok(())))
    }
}

/// File log sink, running as a server service.
pub struct Logger {
    sender: UnboundedSender<LogMessage>,
    receiver: UnboundedReceiver<LogMessage>,
    path: String,
}

impl Logger {
    pub fn new(path: String) -> Self {
        let (sender, receiver) = unbounded_channel::<LogMessage>();
        Self {
            sender,
            receiver,
            path,
        }
    }

    pub(crate) fn create_async_writer(&self) -> AsyncWriter {
        AsyncWriter {
            sender: self.sender.clone(),
        }
    }

    pub fn flusher(&self) -> LogFlusher {
        LogFlusher {
            sender: self.sender.clone(),
        }
    }

    pub fn init_env_logger(&self, level: LevelFilter) {
        let writer = self.create_async_writer();
        builder(level)
            .target(Target::Pipe(Box::new(writer)))
            .init();
    }

    /// Writes queued lines synchronously. Used when the process exits
    /// before the server, and with it this service, ever ran.
    pub fn flush_pending(&mut self) -> io::Result<()> {
        let path = Path::new(&self.path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                LogMessage::Line(data) => file.write_all(&data)?,
                LogMessage::Flush(ack) => {
                    file.flush()?;
                    let _ = ack.send(());
                }
            }
        }
        file.flush()
    }
}

#[async_trait]
impl Service for Logger {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let log_file_path = Path::new(&self.path);

        if let Some(parent) = log_file_path.parent() {
            if metadata(parent).await.is_err() {
                if let Err(e) = create_dir_all(parent).await {
                    eprintln!("Failed to create log directory {}: {e}", parent.display());
                    return;
                }
            }
        }

        let file = match OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_file_path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", self.path);
                return;
            }
        };
        let mut file = BufWriter::new(file);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("Shutdown signal received, stopping write log");
                        break;
                    }
                },

                message = self.receiver.recv() => {
                    match message {
                        Some(LogMessage::Line(data)) => {
                            if let Err(e) = file.write_all(&data).await {
                                eprintln!("Failed to write to log file: {e}");
                            }
                        }
                        Some(LogMessage::Flush(ack)) => {
                            if let Err(e) = file.flush().await {
                                eprintln!("Failed to flush log file: {e}");
                            }
                            let _ = ack.send(());
                        }
                        None => break,
                    }
                }
            }
        }

        // keep lines logged while other services wind down
        let mut acks = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                LogMessage::Line(data) => {
                    if file.write_all(&data).await.is_err() {
                        break;
                    }
                }
                LogMessage::Flush(ack) => acks.push(ack),
            }
        }
        if let Err(e) = file.flush().await {
            eprintln!("Failed to flush log file: {e}");
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }

    fn name(&self) -> &'static str {
        "log sync"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}
