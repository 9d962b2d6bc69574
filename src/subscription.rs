use std::future::Future;

use tokio::{sync::mpsc, task::JoinHandle};

const DEFAULT_CAPACITY: usize = 16;

/// A push feed backed by a forwarding task.
///
/// Cancelling happens at most once: `unsubscribe` consumes the handle, and a
/// subscription that is dropped without it is aborted on drop.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Subscription<T> {
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(DEFAULT_CAPACITY);
        let task = tokio::spawn(producer(tx));
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Next event, or `None` once the producer has stopped.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.cancel();
        tracing::debug!("Subscription cancelled");
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
