use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Stop signal shared by every task the manager spawns.
///
/// Clones observe the same signal; children are cancelled together with
/// their parent but can also be cancelled on their own.
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    token: CancellationToken,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            token: CancellationToken::new(),
        }
    }

    /// A signal that stops when either itself or `self` is cancelled
    pub fn child(&self) -> SignalOfStop {
        SignalOfStop {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_cancellation(&self) {
        self.token.cancelled().await
    }

    /// Drive `future` until it finishes or the signal fires, whichever is first.
    ///
    /// A signal that already fired wins over a future that is ready.
    pub async fn run<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            out = future => Some(out),
        }
    }

    /// Run `future` on the runtime until it finishes or the signal fires.
    ///
    /// Resolves to `None` when the task was stopped before completion.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let sos = self.clone();
        tokio::spawn(async move { sos.run(future).await })
    }
}
