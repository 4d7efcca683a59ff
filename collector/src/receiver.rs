//! Receives uploaded records and keeps each one as `voltageDecay_<n>.csv`.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    time::timeout,
};

const FILE_PREFIX: &str = "voltageDecay_";
const FILE_EXTENSION: &str = ".csv";
const MAX_BODY: u64 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    #[error("unexpected request {0:?}")]
    WrongTarget(String),
    #[error("No data received")]
    Empty,
    #[error("request body of {0} bytes is too large")]
    TooLarge(u64),
    #[error("client took too long")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ReceiveError {
    fn status(&self) -> &'static str {
        match self {
            ReceiveError::WrongTarget(_) => "404 Not Found",
            ReceiveError::Io(_) => "500 Internal Server Error",
            _ => "400 Bad Request",
        }
    }
}

pub struct UploadReceiver {
    dir: PathBuf,
    path: String,
    counter: u32,
    io_timeout: Duration,
}

impl UploadReceiver {
    pub fn new(
        dir: impl Into<PathBuf>,
        path: impl Into<String>,
        io_timeout: Duration,
    ) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let counter = next_counter(&dir)?;

        Ok(Self {
            dir,
            path: path.into(),
            counter,
            io_timeout,
        })
    }

    /// Handles one request and answers it. Returns where the body was saved.
    pub async fn handle<S>(&mut self, stream: S) -> Result<PathBuf, ReceiveError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);
        let result = match timeout(self.io_timeout, self.receive(&mut reader)).await {
            Ok(result) => result,
            Err(_) => Err(ReceiveError::Timeout),
        };

        let (status, body) = match &result {
            Ok(_) => ("200 OK".to_string(), "File uploaded successfully".to_string()),
            Err(e) => (e.status().to_string(), e.to_string()),
        };
        let response = format!(
            "HTTP/1.1 {status}\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {body}\n",
            body.len() + 1
        );

        let mut stream = reader.into_inner();
        stream.write_all(response.as_bytes()).await?;
        let _ = stream.shutdown().await;

        result
    }

    async fn receive<R>(&mut self, reader: &mut R) -> Result<PathBuf, ReceiveError>
    where
        R: AsyncBufReadExt + AsyncRead + Unpin,
    {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let mut parts = line.split_whitespace();
        let (method, target) = match (parts.next(), parts.next()) {
            (Some(method), Some(target)) => (method, target),
            _ => return Err(ReceiveError::Malformed("no request line")),
        };
        if method != "POST" || target != self.path {
            return Err(ReceiveError::WrongTarget(line.trim_end().to_string()));
        }

        let mut content_length = None;
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(ReceiveError::Malformed("request head ended early"));
            }
            let header = line.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = Some(
                        value
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| ReceiveError::Malformed("bad content length"))?,
                    );
                }
            }
        }

        let content_length =
            content_length.ok_or(ReceiveError::Malformed("missing content length"))?;
        if content_length == 0 {
            return Err(ReceiveError::Empty);
        }
        if content_length > MAX_BODY {
            return Err(ReceiveError::TooLarge(content_length));
        }

        let mut body = vec![0; content_length as usize];
        reader.read_exact(&mut body).await?;

        let path = self
            .dir
            .join(format!("{FILE_PREFIX}{}{FILE_EXTENSION}", self.counter));
        tokio::fs::write(&path, &body).await?;
        self.counter = self.counter.saturating_add(1);

        log::info!("Upload of {content_length} bytes saved to {path:?}");
        Ok(path)
    }
}

/// One past the highest `voltageDecay_<n>.csv` already in `dir`.
fn next_counter(dir: &Path) -> io::Result<u32> {
    let mut next = 0;
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let counter = name
            .to_str()
            .and_then(|name| name.strip_prefix(FILE_PREFIX))
            .and_then(|rest| rest.strip_suffix(FILE_EXTENSION))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(counter) = counter {
            next = next.max(counter.saturating_add(1));
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn exchange(
        receiver: &mut UploadReceiver,
        request: &str,
    ) -> (Result<PathBuf, ReceiveError>, String) {
        let (mut client, server) = duplex(8192);
        client.write_all(request.as_bytes()).await.unwrap();
        let result = receiver.handle(server).await;
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        (result, response)
    }

    fn receiver(dir: &Path) -> UploadReceiver {
        UploadReceiver::new(dir, "/upload", Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn stores_uploads_with_increasing_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = receiver(dir.path());
        let body = "Voltage,Time\n3.300,0\n";
        let request = format!(
            "POST /upload HTTP/1.1\r\n\
             Host: 127.0.0.1\r\n\
             Content-Type: text/csv\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {body}",
            body.len()
        );

        let (first, response) = exchange(&mut receiver, &request).await;
        let (second, _) = exchange(&mut receiver, &request).await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("File uploaded successfully\n"));
        assert_eq!(first.unwrap(), dir.path().join("voltageDecay_0.csv"));
        assert_eq!(second.unwrap(), dir.path().join("voltageDecay_1.csv"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("voltageDecay_1.csv")).unwrap(),
            body
        );
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = receiver(dir.path());

        let (result, response) = exchange(
            &mut receiver,
            "POST /upload HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
        )
        .await;

        assert!(matches!(result, Err(ReceiveError::Empty)));
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn other_targets_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = receiver(dir.path());

        let (result, response) = exchange(&mut receiver, "GET /status HTTP/1.1\r\n\r\n").await;

        assert!(matches!(result, Err(ReceiveError::WrongTarget(_))));
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn counter_continues_after_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "voltageDecay_0.csv",
            "voltageDecay_7.csv",
            "notes.txt",
            "voltageDecay_x.csv",
        ] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }

        assert_eq!(next_counter(dir.path()).unwrap(), 8);
    }

    #[test]
    fn counter_saturates_at_the_largest_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("voltageDecay_{}.csv", u32::MAX)), "").unwrap();

        assert_eq!(next_counter(dir.path()).unwrap(), u32::MAX);
    }
}
