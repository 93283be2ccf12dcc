//! Strategy signal source.
//!
//! The strategy layer lives outside this crate. It hands over `Signal`s through
//! this trait and the scan loop drains them. `ChannelSignalSource` is the
//! in-process implementation: an embedding strategy pushes into `sender()`.
//! Signals posted to the HTTP endpoint skip the queue and go straight to
//! `OrderExecutionEngine::submit_signal`.

use crate::domain::entities::signal::Signal;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Drain signals produced since the previous call. Never blocks.
    async fn next_signals(&self) -> Vec<Signal>;
}

/// Bounded mpsc-backed signal queue
pub struct ChannelSignalSource {
    sender: mpsc::Sender<Signal>,
    receiver: Mutex<mpsc::Receiver<Signal>>,
}

impl ChannelSignalSource {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Handle for producers
    pub fn sender(&self) -> mpsc::Sender<Signal> {
        self.sender.clone()
    }
}

#[async_trait]
impl SignalSource for ChannelSignalSource {
    async fn next_signals(&self) -> Vec<Signal> {
        let mut receiver = self.receiver.lock().await;
        let mut drained = Vec::new();
        while let Ok(signal) = receiver.try_recv() {
            drained.push(signal);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::exchange::{Exchange, Instrument};
    use crate::domain::entities::position::Direction;

    fn signal(id: &str) -> Signal {
        Signal {
            id: id.to_string(),
            instrument: Instrument::new(Exchange::Nse, "3045", "SBIN-EQ"),
            direction: Direction::Long,
            entry: 100.0,
            stop_loss: 98.0,
            target: 106.0,
            quantity: 1,
            confidence: 0.9,
            bypass_screening: false,
        }
    }

    #[tokio::test]
    async fn test_channel_source_drains_in_order() {
        let source = ChannelSignalSource::new(8);
        let sender = source.sender();
        sender.send(signal("a")).await.unwrap();
        sender.send(signal("b")).await.unwrap();

        let drained = source.next_signals().await;
        let ids: Vec<_> = drained.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(source.next_signals().await.is_empty());
    }
}
