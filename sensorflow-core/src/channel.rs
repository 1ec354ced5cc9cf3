//! The data channel from the source task to the operator task.
//!
//! Bounded: when the operator falls behind, `send` blocks and the source
//! stops polling the broker.

use crate::types::StreamElement;
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

#[derive(Clone)]
pub struct LocalChannelSender<T> {
    sender: Sender<StreamElement<T>>,
}

impl<T> LocalChannelSender<T> {
    /// Blocks while the channel is full.
    pub fn send(&self, element: StreamElement<T>) -> Result<()> {
        self.sender
            .send(element)
            .map_err(|_| anyhow!("data channel closed: operator task is gone"))
    }
}

pub struct LocalChannelReceiver<T> {
    pub(crate) receiver: Receiver<StreamElement<T>>,
}

impl<T> LocalChannelReceiver<T> {
    pub fn recv(&self) -> Result<StreamElement<T>> {
        self.receiver
            .recv()
            .map_err(|_| anyhow!("data channel closed: source task is gone"))
    }

    /// `None` when nothing arrived within `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<StreamElement<T>>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(element) => Ok(Some(element)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("data channel closed: source task is gone"))
            }
        }
    }
}

/// A channel holding at most `capacity` elements.
pub fn local_channel<T>(capacity: usize) -> (LocalChannelSender<T>, LocalChannelReceiver<T>) {
    let (sender, receiver) = bounded(capacity);
    (
        LocalChannelSender { sender },
        LocalChannelReceiver { receiver },
    )
}
