use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::HarvestError;

pub const DEFAULT_SIZE_CAP: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadCandidate {
    pub url: String,
    /// Size advertised by the provider; zero when unknown.
    pub declared_size: u64,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32 << attempt.saturating_sub(1).min(16);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Fixed(Duration::from_millis(500)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSettings {
    pub size_cap: u64,
    pub retry: RetryPolicy,
    pub request_delay: Duration,
    pub timeout: Duration,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            size_cap: DEFAULT_SIZE_CAP,
            retry: RetryPolicy::default(),
            request_delay: Duration::from_millis(30),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Fetched(Vec<u8>),
    TooLarge { size: u64, cap: u64 },
    Exhausted { attempts: u32 },
}

impl DownloadOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, DownloadOutcome::Fetched(_))
    }

    pub fn into_parts(self) -> (bool, Vec<u8>) {
        match self {
            DownloadOutcome::Fetched(bytes) => (true, bytes),
            _ => (false, Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request cancelled")]
    Cancelled,
}

pub trait Transport: Send + Sync {
    fn get(&self, url: &str) -> Result<HttpReply, TransportError>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("treeharvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn get(&self, url: &str) -> Result<HttpReply, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        let status = response.status().as_u16();
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = response
            .bytes()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(HttpReply {
            status,
            content_length,
            body: body.to_vec(),
        })
    }
}

pub struct Downloader<T: Transport> {
    transport: T,
    settings: DownloadSettings,
    cancel: CancelToken,
}

impl<T: Transport> Downloader<T> {
    pub fn new(transport: T, settings: DownloadSettings) -> Self {
        Self {
            transport,
            settings,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn download(&self, url: &str, declared_size: u64) -> Result<DownloadOutcome, HarvestError> {
        let cap = self.settings.size_cap;
        if declared_size > cap {
            info!(url, declared_size, cap, "download refused, too big");
            return Ok(DownloadOutcome::TooLarge {
                size: declared_size,
                cap,
            });
        }

        let policy = self.settings.retry;
        let started = Instant::now();
        for attempt in 1..=policy.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }
            debug!(url, attempt, declared_size, "downloading");
            match self.transport.get(url) {
                Ok(reply) if !(200..300).contains(&reply.status) => {
                    warn!(url, attempt, status = reply.status, "download failed");
                }
                Ok(reply) => match reply.content_length {
                    Some(expected) if expected != reply.body.len() as u64 => {
                        warn!(
                            url,
                            attempt,
                            expected,
                            received = reply.body.len(),
                            "body length does not match Content-Length"
                        );
                    }
                    _ => return Ok(self.accept(url, declared_size, reply.body, started)),
                },
                Err(TransportError::Cancelled) => return Err(HarvestError::Cancelled),
                Err(TransportError::Request(message)) => {
                    warn!(url, attempt, %message, "download error");
                }
            }
            if attempt < policy.max_attempts {
                self.pause(policy.delay(attempt))?;
            }
        }

        error!(url, attempts = policy.max_attempts, "download retries exhausted");
        Ok(DownloadOutcome::Exhausted {
            attempts: policy.max_attempts,
        })
    }

    pub fn download_all(
        &self,
        candidates: &[DownloadCandidate],
    ) -> Vec<Result<DownloadOutcome, HarvestError>> {
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(candidates.len());
            for (index, candidate) in candidates.iter().enumerate() {
                if index > 0 && !self.settings.request_delay.is_zero() {
                    thread::sleep(self.settings.request_delay);
                }
                handles.push(
                    scope.spawn(move || self.download(&candidate.url, candidate.declared_size)),
                );
            }
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(HarvestError::Http("download worker panicked".to_string()))
                    })
                })
                .collect()
        })
    }

    fn accept(
        &self,
        url: &str,
        declared_size: u64,
        body: Vec<u8>,
        started: Instant,
    ) -> DownloadOutcome {
        let size = body.len() as u64;
        if size > self.settings.size_cap {
            info!(url, size, cap = self.settings.size_cap, "downloaded body over size cap");
            return DownloadOutcome::TooLarge {
                size,
                cap: self.settings.size_cap,
            };
        }
        if declared_size != 0 && declared_size != size {
            debug!(url, declared_size, size, "declared size differs from body");
        }
        info!(url, size, elapsed_ms = started.elapsed().as_millis() as u64, "downloaded");
        DownloadOutcome::Fetched(body)
    }

    fn pause(&self, delay: Duration) -> Result<(), HarvestError> {
        let deadline = Instant::now() + delay;
        loop {
            if self.cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}
