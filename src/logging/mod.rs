use std::io::{self, Write};

use async_trait::async_trait;
use env_logger::{Builder, Env};
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

use crate::config;

const DEFAULT_FILTER: &str = "info";

/// `Write` end of the log channel; formatted records are shipped to [`Logger`].
pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .send(buf.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn builder() -> Builder {
    Builder::from_env(Env::default().default_filter_or(DEFAULT_FILTER))
}

/// Log to stderr, filtered by `RUST_LOG`.
pub fn init_stderr_logger() {
    if let Err(e) = builder().try_init() {
        eprintln!("Logger already initialised: {e}");
    }
}

/// Appends log output to the configured file.
pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
        }
    }

    fn create_async_writer(&self) -> AsyncWriter {
        AsyncWriter {
            sender: self.sender.clone(),
        }
    }

    /// Route the `log` facade into this logger. Records are buffered in the channel
    /// until the service starts.
    pub fn init_env_logger(&self) {
        let writer = self.create_async_writer();
        if let Err(e) = builder()
            .target(env_logger::Target::Pipe(Box::new(writer)))
            .try_init()
        {
            eprintln!("Logger already initialised: {e}");
        }
    }

    async fn open(&self) -> io::Result<BufWriter<tokio::fs::File>> {
        let path = std::path::Path::new(&self.config.path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await?;
        Ok(BufWriter::new(file))
    }
}

#[async_trait]
impl Service for Logger {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let mut file = match self.open().await {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Unable to open log file {}: {e}", self.config.path);
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("Shutdown signal received, stopping write log");
                        break;
                    }
                },

                data = self.receiver.recv() => {
                    match data {
                        Some(data) => {
                            if let Err(e) = file.write_all(&data).await {
                                eprintln!("Failed to write to log file: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Whatever was queued before shutdown still goes out
        while let Ok(data) = self.receiver.try_recv() {
            if let Err(e) = file.write_all(&data).await {
                eprintln!("Failed to write to log file: {e}");
                break;
            }
        }
        if let Err(e) = file.flush().await {
            eprintln!("Failed to flush log file: {e}");
        }
    }

    fn name(&self) -> &'static str {
        "log sync"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_reaches_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/formdesk.log");
        let mut logger = Logger::new(config::Log {
            path: path.to_string_lossy().into_owned(),
        });

        let mut writer = logger.create_async_writer();
        writer.write_all(b"first line\n").unwrap();
        writer.write_all(b"second line\n").unwrap();

        let (tx, rx) = tokio::sync::watch::channel(false);
        tx.send(true).unwrap();
        logger.start_service(None, rx).await;

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "first line\nsecond line\n");
    }
}
