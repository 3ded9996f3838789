use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;

struct PendingExpiry {
    sequence: u64,
    task: JoinHandle<()>,
}

/// Single-slot timer that clears the displayed caption.
///
/// At most one expiry is pending; scheduling a new one aborts the previous
/// task. The firing task must `claim` its sequence before acting, which fails
/// once a newer caption has been scheduled or the slot was cancelled.
#[derive(Default)]
pub(crate) struct CaptionExpiry {
    pending: Option<PendingExpiry>,
}

impl CaptionExpiry {
    pub(crate) fn schedule<F>(&mut self, sequence: u64, delay: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_expire.await;
        });
        self.pending = Some(PendingExpiry { sequence, task });
    }

    pub(crate) fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn claim(&mut self, sequence: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.sequence == sequence => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn pending_sequence(&self) -> Option<u64> {
        self.pending.as_ref().map(|pending| pending.sequence)
    }
}

impl Drop for CaptionExpiry {
    fn drop(&mut self) {
        self.cancel();
    }
}
