use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::client::backoff::Backoff;
use crate::client::decoder::SseDecoder;

/// Connectivity of the logical stream, as shown to the user.
///
/// `Unauthorized` is terminal: the agent stops retrying and the UI is
/// expected to route through re-authentication instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Live,
    Offline,
    Unauthorized,
}

/// Ceiling applied to the pending delay when [`StreamConsumer::wake`]
/// interrupts a backoff sleep.
const WAKE_CEILING: Duration = Duration::from_millis(1500);

/// Client side of a streaming endpoint: keeps one logical subscription
/// alive across physical connection drops.
///
/// A single driver task owns the connection, so at most one reconnect
/// timer can ever be pending. Decoded payloads are handed to the event
/// callback; connectivity transitions are published on a watch channel
/// for the UI layer. The consumer never blocks its caller.
pub struct StreamConsumer {
    status_rx: watch::Receiver<ConnectionStatus>,
    wake: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl StreamConsumer {
    /// Connect to `url` with the default backoff (1 s floor, 15 s cap,
    /// 500 ms jitter).
    pub fn connect<F>(url: impl Into<String>, on_event: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        Self::with_backoff(url, Backoff::default(), on_event)
    }

    pub fn with_backoff<F>(url: impl Into<String>, backoff: Backoff, on_event: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let wake = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run(
            url.into(),
            status_tx,
            wake.clone(),
            stopped.clone(),
            backoff,
            on_event,
        ));

        Self {
            status_rx,
            wake,
            stopped,
            task,
        }
    }

    /// Current connectivity state.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Watch handle for status transitions, for UI indicators.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Nudge a non-live consumer to retry soon: the pending delay shrinks
    /// to a small ceiling and any backoff sleep is cut short. The analog
    /// of a backgrounded page regaining visibility. No-op while live.
    pub fn wake(&self) {
        if self.status() != ConnectionStatus::Live {
            self.wake.notify_one();
        }
    }

    /// Stop for good: no further callbacks, no further reconnects.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.task.abort();
        }
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<F>(
    url: String,
    status_tx: watch::Sender<ConnectionStatus>,
    wake: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    mut backoff: Backoff,
    on_event: F,
) where
    F: Fn(Value) + Send + Sync + 'static,
{
    let client = reqwest::Client::new();

    loop {
        if stopped.load(Ordering::Acquire) {
            return;
        }
        let _ = status_tx.send(ConnectionStatus::Connecting);

        match client.get(&url).send().await {
            Ok(response)
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                log::error!(
                    "stream endpoint rejected credentials ({}), giving up",
                    response.status()
                );
                let _ = status_tx.send(ConnectionStatus::Unauthorized);
                return;
            }
            Ok(response) => match response.error_for_status() {
                Ok(response) => {
                    let _ = status_tx.send(ConnectionStatus::Live);
                    backoff.reset();

                    let mut decoder = SseDecoder::new();
                    let mut body = response.bytes_stream();
                    while let Some(chunk) = body.next().await {
                        match chunk {
                            Ok(bytes) => {
                                for data in decoder.feed(&bytes) {
                                    // Undecodable frames are dropped without
                                    // touching connection state.
                                    if let Ok(payload) = serde_json::from_str::<Value>(&data) {
                                        on_event(payload);
                                    }
                                }
                            }
                            Err(err) => {
                                log::debug!("stream read failed: {}", err);
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    log::debug!("stream open failed: {}", err);
                }
            },
            Err(err) => {
                log::debug!("stream connect failed: {}", err);
            }
        }

        if stopped.load(Ordering::Acquire) {
            return;
        }
        let _ = status_tx.send(ConnectionStatus::Offline);

        let delay = backoff.delay();
        backoff.advance();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {
                backoff.clamp(WAKE_CEILING);
            }
        }
    }
}
