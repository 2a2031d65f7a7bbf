//! Futures and streams handed back to callers of central and peripheral
//! operations

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BleError, BleResult};

/// Result of an operation that has already been dispatched.
///
/// The request is submitted when the operation method is called; awaiting only
/// observes the outcome. Results are never delivered synchronously from inside
/// the call, even when a precondition fails immediately.
#[must_use = "the operation result is only observable through this future"]
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<BleResult<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn channel() -> (oneshot::Sender<BleResult<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A future that resolves with `result` on its first poll
    pub fn ready(result: BleResult<T>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }
}

impl<T> Future for Pending<T> {
    type Output = BleResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(BleError::CentralNotReady)))
    }
}

/// Resolves when an established connection ends, with the cause when the end
/// was not requested cleanly
#[must_use = "dropping the disconnection future loses the disconnect notification"]
#[derive(Debug)]
pub struct Disconnection {
    rx: oneshot::Receiver<Option<BleError>>,
}

impl Disconnection {
    pub(crate) fn channel() -> (oneshot::Sender<Option<BleError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Non-blocking check; `Some` once the connection has ended
    pub fn try_ended(&mut self) -> Option<Option<BleError>> {
        match self.rx.try_recv() {
            Ok(cause) => Some(cause),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Some(BleError::CentralNotReady)),
        }
    }
}

impl Future for Disconnection {
    type Output = Option<BleError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Some(BleError::CentralNotReady)))
    }
}

/// Stream of updates pushed from the central's execution context
#[derive(Debug)]
pub struct Updates<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Updates<T> {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next update, or `None` once the producer has stopped
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Updates<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Characteristic notifications and indications
pub type Notifications = Updates<BleResult<Vec<u8>>>;

/// Periodic signal-strength readings
pub type RssiUpdates = Updates<BleResult<Option<i16>>>;
