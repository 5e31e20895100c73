//! Toggle events and their sources
//!
//! The hardware hook lives outside this crate. Whatever delivers presses calls
//! [`ToggleSink::on_toggle`], from any thread.

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use std::io::BufRead;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// One press of the toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleEvent {
    pub timestamp: DateTime<Utc>,
}

impl ToggleEvent {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
        }
    }
}

/// Receiver of toggle presses; must not block
pub trait ToggleSink: Send + Sync {
    fn on_toggle(&self, timestamp: DateTime<Utc>);
}

/// A source of toggle presses
pub trait ToggleListener {
    fn listen(self, sink: Arc<dyn ToggleSink>) -> std::io::Result<JoinHandle<()>>;
}

/// Every line on stdin (Enter) is one press
#[derive(Debug, Default)]
pub struct StdinToggle;

impl ToggleListener for StdinToggle {
    fn listen(self, sink: Arc<dyn ToggleSink>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("toggle-stdin".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    if line.is_err() {
                        break;
                    }
                    sink.on_toggle(Utc::now());
                }
                tracing::debug!("Stdin toggle listener ended");
            })
    }
}

/// Forward a stream of events into `sink`
pub async fn pump<S>(events: S, sink: &dyn ToggleSink) -> usize
where
    S: Stream<Item = ToggleEvent>,
{
    let mut events = std::pin::pin!(events);
    let mut forwarded = 0;
    while let Some(event) = events.next().await {
        sink.on_toggle(event.timestamp);
        forwarded += 1;
    }
    forwarded
}
