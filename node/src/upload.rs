//! Streams a stored artifact to the collector as an HTTP/1.1 POST.

use std::time::Duration;

use decay_core::config::UploadConfig;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};

use crate::{
    error::PipelineError,
    store::{Artifact, DurableStore},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub content_length: u64,
    pub bytes_sent: u64,
    /// Status code of the collector's reply, if it sent a parsable one.
    pub status: Option<u16>,
}

pub struct UploadClient {
    host: String,
    port: u16,
    path: String,
    content_type: String,
    chunk_size: usize,
    chunk_pause: Duration,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl UploadClient {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            path: config.path.clone(),
            content_type: config.content_type.clone(),
            chunk_size: config.chunk_size.max(1),
            chunk_pause: Duration::from_millis(config.chunk_pause_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            io_timeout: Duration::from_millis(config.io_timeout_ms),
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn request_head(&self, content_length: u64) -> String {
        format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n",
            self.path, self.host, self.content_type, content_length
        )
    }

    /// Reopens `artifact` and posts its exact bytes.
    ///
    /// Nothing is retried; a failure leaves the artifact on storage.
    pub async fn send(
        &self,
        store: &DurableStore,
        artifact: &Artifact,
    ) -> Result<UploadReport, PipelineError> {
        let (file, content_length) = store.open(artifact)?;
        log::info!("File size (Content-Length): {content_length}");
        if content_length != artifact.byte_length {
            log::warn!(
                "{} is {content_length} bytes on storage but {} bytes were written",
                artifact.name,
                artifact.byte_length
            );
        }

        let addr = self.addr();
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(PipelineError::ConnectFailed {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(PipelineError::ConnectFailed {
                    addr,
                    reason: format!("no answer within {:?}", self.connect_timeout),
                })
            }
        };
        log::info!("Connected to {addr}, sending {}", artifact.name);

        let file = tokio::fs::File::from_std(file);
        self.exchange(stream, file, content_length).await
    }

    async fn exchange<S, F>(
        &self,
        mut stream: S,
        mut file: F,
        content_length: u64,
    ) -> Result<UploadReport, PipelineError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        F: AsyncRead + Unpin,
    {
        let head = self.request_head(content_length);
        self.bounded(stream.write_all(head.as_bytes())).await?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut bytes_sent = 0u64;
        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(PipelineError::TransportUnavailable)?;
            if n == 0 {
                break;
            }
            self.bounded(stream.write_all(&buffer[..n])).await?;
            bytes_sent += n as u64;
            tokio::time::sleep(self.chunk_pause).await;
        }
        self.bounded(stream.flush()).await?;
        log::info!("File content sent ({bytes_sent} bytes)");

        let mut status = None;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.bounded(reader.read_line(&mut line)).await?;
            if n == 0 {
                break;
            }
            let line = line.trim_end();
            log::trace!("Server response: {line}");
            if status.is_none() {
                status = parse_status_line(line);
            }
        }

        match status {
            Some(code) => log::info!("Collector answered {code}"),
            None => log::warn!("Collector closed the connection without a status line"),
        }

        Ok(UploadReport {
            content_length,
            bytes_sent,
            status,
        })
    }

    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> Result<T, PipelineError> {
        match timeout(self.io_timeout, op).await {
            Ok(result) => result.map_err(PipelineError::TransportUnavailable),
            Err(elapsed) => Err(PipelineError::TransportUnavailable(elapsed.into())),
        }
    }
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
