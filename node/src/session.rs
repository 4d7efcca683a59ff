//! Per-trigger control loop: sample, serialize, persist, deliver.

use std::time::Duration;

use decay_core::{record::RecordLayout, CaptureBuffer, VoltageScale};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::{timeout_at, Instant},
};

use crate::{
    clock::{ClockResolver, TimeSource, TimeSourceError},
    error::PipelineError,
    peripherals::{AnalogInput, ExcitationPin},
    record::Record,
    sampler::Sampler,
    store::{Artifact, DurableStore},
    telemetry::{StreamPublisher, TelemetrySession},
    upload::{UploadClient, UploadReport},
};

const MAX_REQUEST_LINE: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Sampling,
    Serializing,
    Persisting,
    Delivering,
}

/// A capture that made it to storage.
#[derive(Debug)]
pub struct Acquisition {
    pub buffer: CaptureBuffer,
    pub artifact: Artifact,
}

/// The stages every deployment profile shares.
pub struct Pipeline<A, P, T> {
    sampler: Sampler<A, P>,
    scale: VoltageScale,
    layout: RecordLayout,
    clock: Option<ClockResolver<T>>,
    store: DurableStore,
    stage: Stage,
}

impl<A, P, T> Pipeline<A, P, T>
where
    A: AnalogInput,
    P: ExcitationPin,
    T: TimeSource,
{
    pub fn new(
        sampler: Sampler<A, P>,
        scale: VoltageScale,
        layout: RecordLayout,
        clock: Option<ClockResolver<T>>,
        store: DurableStore,
    ) -> Self {
        Self {
            sampler,
            scale,
            layout,
            clock,
            store,
            stage: Stage::Idle,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn scale(&self) -> &VoltageScale {
        &self.scale
    }

    fn enter(&mut self, stage: Stage) {
        log::debug!("{:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    /// Runs Sampling, Serializing and Persisting. On success the pipeline is
    /// left in `Delivering`; on failure it is back in `Idle`.
    pub fn acquire(&mut self) -> Result<Acquisition, PipelineError> {
        let result = self.acquire_inner();
        if result.is_err() {
            self.enter(Stage::Idle);
        }
        result
    }

    fn acquire_inner(&mut self) -> Result<Acquisition, PipelineError> {
        self.enter(Stage::Sampling);
        let buffer = self.sampler.capture()?;

        self.enter(Stage::Serializing);
        let record = Record::serialize(&buffer, &self.scale, self.layout);
        debug_assert_eq!(record.sample_lines(), buffer.len());
        record.log_lines();

        self.enter(Stage::Persisting);
        let timestamp = if self.store.needs_timestamp() {
            let clock = self.clock.as_mut().ok_or(TimeSourceError::NoTime)?;
            Some(clock.resolve_now()?)
        } else {
            None
        };
        let artifact = self.store.persist(&record, timestamp.as_ref())?;

        self.enter(Stage::Delivering);
        Ok(Acquisition { buffer, artifact })
    }

    fn finish(&mut self) {
        self.enter(Stage::Idle);
    }
}

/// What an inbound request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetData,
    Unrecognized(String),
}

impl Command {
    pub fn parse(request_line: &str, token: &str) -> Self {
        if request_line.contains(token) {
            Command::GetData
        } else {
            Command::Unrecognized(request_line.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    BadRequest,
    Failed(String),
}

impl Response {
    fn render(&self) -> String {
        let (status, body) = match self {
            Response::Ok => ("200 OK", "Data sampling and upload complete!"),
            Response::BadRequest => ("400 Bad Request", "Invalid command"),
            Response::Failed(reason) => ("500 Internal Server Error", reason.as_str()),
        };
        format!(
            "HTTP/1.1 {status}\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {body}\n",
            body.len() + 1
        )
    }
}

/// Pull profile: waits for a command, then persists and uploads a capture.
pub struct PullDriver<A, P, T> {
    pipeline: Pipeline<A, P, T>,
    uploader: UploadClient,
    command_token: String,
    request_timeout: Duration,
}

impl<A, P, T> PullDriver<A, P, T>
where
    A: AnalogInput,
    P: ExcitationPin,
    T: TimeSource,
{
    pub fn new(
        pipeline: Pipeline<A, P, T>,
        uploader: UploadClient,
        command_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            uploader,
            command_token: command_token.into(),
            request_timeout,
        }
    }

    pub fn pipeline(&self) -> &Pipeline<A, P, T> {
        &self.pipeline
    }

    /// Serves one client at a time, forever.
    pub async fn serve(&mut self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Waiting for commands on {addr}");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    log::info!("Client connected: {peer}");
                    let response = self.handle(stream).await;
                    log::info!("Client disconnected: {peer} ({response:?})");
                }
                Err(e) => log::error!("Could not accept a client: {e}"),
            }
        }
    }

    /// Reads a request, runs the pipeline if it carries the command token
    /// and answers with a coarse status.
    pub async fn handle<S>(&mut self, mut stream: S) -> Response
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let command = match self.read_command(&mut stream).await {
            Some(line) => Command::parse(&line, &self.command_token),
            None => Command::Unrecognized(String::new()),
        };

        let response = match command {
            Command::GetData => {
                log::info!("{} command received", self.command_token);
                match self.trigger().await {
                    Ok(_) => Response::Ok,
                    Err(e) => {
                        log::error!("Trigger failed: {e}");
                        Response::Failed(e.to_string())
                    }
                }
            }
            Command::Unrecognized(line) => {
                log::warn!("Rejecting request {line:?}");
                Response::BadRequest
            }
        };

        if let Err(e) = stream.write_all(response.render().as_bytes()).await {
            log::error!("Could not answer the client: {e}");
        }
        let _ = stream.shutdown().await;

        response
    }

    /// First request line, with the rest of the request head discarded.
    async fn read_command<S>(&self, stream: &mut S) -> Option<String>
    where
        S: AsyncRead + Unpin,
    {
        let deadline = Instant::now() + self.request_timeout;
        let mut reader = BufReader::new(stream.take(MAX_REQUEST_LINE * 8));

        let mut request_line = String::new();
        match timeout_at(deadline, reader.read_line(&mut request_line)).await {
            Ok(Ok(n)) if n > 0 => {}
            Ok(Ok(_)) => return None,
            Ok(Err(e)) => {
                log::warn!("Could not read request: {e}");
                return None;
            }
            Err(_) => {
                log::warn!("Client sent no request within {:?}", self.request_timeout);
                return None;
            }
        }

        // A bare command is answered right away; only an HTTP request line
        // is followed by headers worth draining.
        if !is_http_request_line(&request_line) {
            return Some(truncate_request_line(&request_line));
        }

        let mut header = String::new();
        loop {
            header.clear();
            match timeout_at(deadline, reader.read_line(&mut header)).await {
                Ok(Ok(n)) if n > 0 && !header.trim().is_empty() => {}
                _ => break,
            }
        }

        Some(truncate_request_line(&request_line))
    }

    /// One full pass: sample, serialize, persist, then upload what was
    /// persisted.
    pub async fn trigger(&mut self) -> Result<UploadReport, PipelineError> {
        let acquisition = self.pipeline.acquire()?;
        let result = self
            .uploader
            .send(self.pipeline.store(), &acquisition.artifact)
            .await;
        self.pipeline.finish();

        if let Err(e) = &result {
            log::error!(
                "Delivery of {} abandoned, artifact kept on storage: {e}",
                acquisition.artifact.name
            );
        }
        result
    }
}

fn is_http_request_line(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    matches!(
        (parts.next(), parts.next(), parts.next(), parts.next()),
        (Some(_), Some(_), Some(version), None) if version.starts_with("HTTP/")
    )
}

fn truncate_request_line(line: &str) -> String {
    line.trim_end()
        .chars()
        .take(MAX_REQUEST_LINE as usize)
        .collect()
}

/// Push profile: captures once and streams the samples to the broker.
pub struct PushDriver<A, P, T, S> {
    pipeline: Pipeline<A, P, T>,
    publisher: StreamPublisher<S>,
}

impl<A, P, T, S> PushDriver<A, P, T, S>
where
    A: AnalogInput,
    P: ExcitationPin,
    T: TimeSource,
    S: TelemetrySession,
{
    pub fn new(pipeline: Pipeline<A, P, T>, publisher: StreamPublisher<S>) -> Self {
        Self {
            pipeline,
            publisher,
        }
    }

    pub fn pipeline(&self) -> &Pipeline<A, P, T> {
        &self.pipeline
    }

    /// Single shot. Delivery uses the in-memory capture, not the stored
    /// artifact. Returns the number of published samples.
    pub async fn run_once(&mut self) -> Result<usize, PipelineError> {
        self.publisher.ensure_connected().await;

        let acquisition = self.pipeline.acquire()?;
        let scale = *self.pipeline.scale();
        let published = self
            .publisher
            .publish_samples(&acquisition.buffer, &scale)
            .await;
        let closed = self.publisher.close().await;
        self.pipeline.finish();

        // Without a clean close the broker may not have read every sample
        closed?;
        Ok(published)
    }
}
