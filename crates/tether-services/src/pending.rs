//! Caller-facing transfer results.
//!
//! Every send hands back a `PendingTransfer`; the engine keeps the matching
//! `Resolver` inside the transfer's table entry. Removing the entry is the
//! only way to consume the resolver, so each transfer resolves exactly once.
//! If the session goes away first the resolver is dropped and the waiter
//! sees `TransferError::Shutdown`.

use tokio::sync::oneshot;

use crate::error::TransferError;

pub type TransferResult<T> = Result<T, TransferError>;

#[derive(Debug)]
pub struct Resolver<T> {
    tx: oneshot::Sender<TransferResult<T>>,
}

impl<T> Resolver<T> {
    pub fn resolve(self, result: TransferResult<T>) {
        // The caller may have stopped waiting; that is not an error here.
        let _ = self.tx.send(result);
    }
}

#[derive(Debug)]
pub struct PendingTransfer<T> {
    id: u64,
    rx: oneshot::Receiver<TransferResult<T>>,
}

impl<T> PendingTransfer<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(self) -> TransferResult<T> {
        self.rx.await.unwrap_or(Err(TransferError::Shutdown))
    }
}

pub fn pending<T>(id: u64) -> (Resolver<T>, PendingTransfer<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, PendingTransfer { id, rx })
}
