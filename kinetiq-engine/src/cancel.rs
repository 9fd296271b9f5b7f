use futures_util::future::select_all;
use tokio::sync::watch;

/// Owner side of a cancellation scope. Cancelling a source cancels every
/// token derived from it and from its children.
#[derive(Debug)]
pub struct CancelSource {
    sender: watch::Sender<bool>,
    token: CancelToken,
}

/// Observer side of a cancellation scope
#[derive(Debug, Clone)]
pub struct CancelToken {
    /// Own receiver last, ancestors first
    chain: Vec<watch::Receiver<bool>>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender,
            token: CancelToken {
                chain: vec![receiver],
            },
        }
    }

    /// Create a scope that is cancelled together with this one but can
    /// also be cancelled on its own
    pub fn child(&self) -> Self {
        let (sender, receiver) = watch::channel(false);
        let mut chain = self.token.chain.clone();
        chain.push(receiver);
        Self {
            sender,
            token: CancelToken { chain },
        }
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|rx| *rx.borrow())
    }

    /// Resolves once this scope or any of its ancestors is cancelled
    pub async fn cancelled(&self) {
        let waits = self.chain.iter().cloned().map(|mut rx| {
            Box::pin(async move {
                let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                if closed {
                    // Source dropped without cancelling, this link never fires
                    std::future::pending::<()>().await;
                }
            })
        });
        select_all(waits).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parent_cancels_children() {
        let root = CancelSource::new();
        let child = root.child();
        let grandchild = child.child();
        let sibling = root.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.token().is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());

        root.cancel();
        assert!(sibling.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let root = CancelSource::new();
        let token = root.child().token();

        let waiter = tokio::spawn(async move { token.cancelled().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        root.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_source_does_not_cancel() {
        let root = CancelSource::new();
        let token = root.token();
        drop(root);

        assert!(!token.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_secs(5), token.cancelled()).await;
        assert!(waited.is_err());
    }
}
