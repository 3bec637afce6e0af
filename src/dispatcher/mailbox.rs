//! Bounded per-agent FIFO mailbox.
//!
//! Backed by `tokio::sync::mpsc` — never swapped for an unbounded queue,
//! since back-pressure (`mailbox-full`) is how the system surfaces
//! liveness problems.

use crate::error::DispatchError;
use crate::message::AgentMsg;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct MailboxHandle {
    tx: mpsc::Sender<AgentMsg>,
}

pub struct MailboxReceiver {
    rx: mpsc::Receiver<AgentMsg>,
}

pub fn mailbox(capacity: usize) -> (MailboxHandle, MailboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (MailboxHandle { tx }, MailboxReceiver { rx })
}

impl MailboxHandle {
    pub fn try_send(&self, msg: AgentMsg) -> Result<(), DispatchError> {
        self.tx
            .try_send(msg)
            .map_err(|_| DispatchError::MailboxFull("<mailbox>".to_string()))
    }

    /// Blocking send with a deadline: used when the dispatcher sends to a
    /// destination mailbox that is full and should wait, bounded, with
    /// context, rather than fail immediately.
    pub async fn send(&self, msg: AgentMsg, deadline: Duration) -> Result<(), DispatchError> {
        tokio::time::timeout(deadline, self.tx.send(msg))
            .await
            .map_err(|_| DispatchError::MailboxFull("<mailbox>".to_string()))?
            .map_err(|_| DispatchError::NoSuchAgent("<detached>".to_string()))
    }

    /// Quiesce signal: true once nothing is queued (empty capacity slots
    /// used), used by graceful `Stop` to decide a mailbox has drained.
    pub fn is_quiescent(&self) -> bool {
        self.tx.capacity() == self.tx.max_capacity()
    }

    pub fn clone_handle(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl MailboxReceiver {
    pub async fn recv(&mut self) -> Option<AgentMsg> {
        self.rx.recv().await
    }
}
