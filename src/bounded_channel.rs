// SPDX-License-Identifier: Apache-2.0

//! Bounded queue between the reader thread and an async consumer.
//!
//! The reader side is a plain OS thread and uses the blocking calls; the consumer is a
//! tokio task and awaits [`BoundedReceiver::next`].

use flume::{Receiver, Sender};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("channel disconnected")]
    Disconnected,
}

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

impl<T> BoundedSender<T> {
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        self.tx
            .send_async(item)
            .await
            .map_err(|_| SendError::Disconnected)
    }

    /// Blocks until there is capacity in the channel.
    pub fn send_blocking(&self, item: T) -> Result<(), SendError> {
        self.tx.send(item).map_err(|_| SendError::Disconnected)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn is_disconnected(&self) -> bool {
        self.tx.is_disconnected()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Next item, or `None` once every sender is gone and the queue is drained.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    /// Returns `None` if no item is available or the channel is disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Returns `None` if the timeout expires or the channel is disconnected.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);
    (BoundedSender { tx }, BoundedReceiver { rx })
}
