//! Consumer side of a watch registration

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{ChangeEvent, ProviderError};

pub(crate) type EventSender = mpsc::Sender<Result<ChangeEvent, ProviderError>>;
pub(crate) type EventReceiver = mpsc::Receiver<Result<ChangeEvent, ProviderError>>;

/// A lazy, unbounded sequence of [`ChangeEvent`]s.
///
/// Events are hints: each one means "re-read, the content may differ". Rapid
/// changes are coalesced. A fatal watch failure arrives as a final `Err` item,
/// after which the sequence ends. Once cancelled (or dropped) a subscription
/// yields nothing more and cannot be restarted.
pub struct ChangeSubscription {
    id: Uuid,
    events: EventReceiver,
    task: Option<JoinHandle<()>>,
    cancelled: bool,
}

impl ChangeSubscription {
    pub(crate) fn new(events: EventReceiver, task: Option<JoinHandle<()>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            events,
            task,
            cancelled: false,
        }
    }

    /// Channel pair sized for one subscription
    pub(crate) fn channel(buffer: usize) -> (EventSender, EventReceiver) {
        mpsc::channel(buffer.max(1))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the next event. `None` once cancelled or after the source ends.
    pub async fn next_event(&mut self) -> Option<Result<ChangeEvent, ProviderError>> {
        if self.cancelled {
            return None;
        }
        self.events.recv().await
    }

    /// Stop delivery and release the background monitor, if any.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        log::debug!("Cancelled change subscription {}", self.id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl Stream for ChangeSubscription {
    type Item = Result<ChangeEvent, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancelled {
            return Poll::Ready(None);
        }
        self.events.poll_recv(cx)
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("id", &self.id)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}
