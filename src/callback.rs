//! Asynchronous finalization-report delivery.
//!
//! Dispatch never runs in the inbound request path: the session manager
//! spawns `deliver` and returns immediately. Delivery tries three POSTs with
//! exponential backoff; what cannot be delivered lands in an append-only
//! JSONL retry queue on disk, which a recovery worker drains on startup.
//! Scheduling is at-most-once per session (guarded by the session's
//! `finalized_notified` flag); the consumer is expected to be idempotent on
//! `sessionId`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::types::CallbackPayload;

const MAX_ATTEMPTS: u32 = 3;
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Append-only JSONL file of callback payloads awaiting redelivery.
pub struct RetryQueue {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl RetryQueue {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn append(&self, payload: &CallbackPayload) -> anyhow::Result<()> {
        let line = serde_json::to_string(payload)?;
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Take every queued payload off disk. Unparsable lines are dropped with
    /// a log line rather than wedging the queue forever.
    pub async fn drain(&self) -> anyhow::Result<Vec<CallbackPayload>> {
        let _guard = self.lock.lock().await;
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        tokio::fs::write(&self.path, b"").await?;
        let mut payloads = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<CallbackPayload>(line) {
                Ok(p) => payloads.push(p),
                Err(e) => warn!(error = %e, "dropping unparsable retry-queue line"),
            }
        }
        Ok(payloads)
    }
}

pub struct CallbackDispatcher {
    client: reqwest::Client,
    url: Option<String>,
    queue: RetryQueue,
    /// First backoff step; doubles per attempt. Shrunk in tests.
    backoff_base: Duration,
}

impl CallbackDispatcher {
    pub fn new(url: Option<String>, queue_path: PathBuf) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url,
            queue: RetryQueue::new(queue_path),
            backoff_base: Duration::from_secs(1),
        })
    }

    #[cfg(test)]
    fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Schedule delivery off the request path.
    pub fn spawn(self: &Arc<Self>, payload: CallbackPayload) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.deliver(payload).await;
        });
    }

    pub async fn deliver(&self, payload: CallbackPayload) {
        let Some(url) = self.url.as_deref() else {
            // No callback target configured (development): park the payload
            // in the queue where it can be inspected.
            info!(session_id = %payload.session_id, "no callback url, queueing payload");
            self.enqueue(payload).await;
            return;
        };

        for attempt in 1..=MAX_ATTEMPTS {
            match self.post_once(url, &payload).await {
                Ok(()) => {
                    info!(
                        session_id = %payload.session_id,
                        attempt,
                        "finalization callback delivered"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        session_id = %payload.session_id,
                        attempt,
                        error = %e,
                        "callback attempt failed"
                    );
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(jittered_backoff(self.backoff_base, attempt)).await;
            }
        }

        error!(
            session_id = %payload.session_id,
            "callback delivery exhausted, parking payload in retry queue"
        );
        self.enqueue(payload).await;
    }

    async fn post_once(&self, url: &str, payload: &CallbackPayload) -> anyhow::Result<()> {
        let response = self.client.post(url).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("callback endpoint answered {status}");
        }
        Ok(())
    }

    async fn enqueue(&self, payload: CallbackPayload) {
        let session_id = payload.session_id.clone();
        if let Err(e) = self.queue.append(&payload).await {
            // Queue write failure is the end of the line; log loudly.
            error!(session_id = %session_id, error = %e, "failed to persist callback payload");
        }
    }

    /// Drain the on-disk queue once at startup, giving each parked payload a
    /// single redelivery attempt. Still-failing payloads go back on disk.
    pub fn spawn_recovery(self: &Arc<Self>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let Some(url) = dispatcher.url.clone() else {
                return;
            };
            let parked = match dispatcher.queue.drain().await {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "could not read callback retry queue");
                    return;
                }
            };
            if parked.is_empty() {
                return;
            }
            info!(count = parked.len(), "re-delivering parked callback payloads");
            for payload in parked {
                if let Err(e) = dispatcher.post_once(&url, &payload).await {
                    warn!(
                        session_id = %payload.session_id,
                        error = %e,
                        "redelivery failed, re-queueing"
                    );
                    dispatcher.enqueue(payload).await;
                }
            }
        });
    }
}

fn jittered_backoff(base: Duration, attempt: u32) -> Duration {
    let exact = base * 2u32.pow(attempt - 1);
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    exact.mul_f64(factor)
}
