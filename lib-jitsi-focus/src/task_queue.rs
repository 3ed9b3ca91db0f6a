use std::{future::Future, pin::Pin};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A serial task queue. Everything that mutates one conference's state runs
/// here, so those mutations never race; callers from other threads enqueue
/// and, when they need the outcome, await it.
#[derive(Clone)]
pub(crate) struct TaskQueue {
  tx: mpsc::UnboundedSender<Task>,
}

impl TaskQueue {
  pub fn new(name: impl Into<String>) -> TaskQueue {
    let name = name.into();
    let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
    tokio::spawn(async move {
      while let Some(task) = rx.recv().await {
        task.await;
      }
      debug!(queue = name.as_str(), "task queue closed");
    });
    TaskQueue { tx }
  }

  /// Runs a task on the queue without waiting for it.
  pub fn enqueue(&self, task: impl Future<Output = ()> + Send + 'static) {
    // A send failure means the conference is shutting down; the task is
    // dropped with it.
    let _ = self.tx.send(Box::pin(task));
  }

  /// Runs a task on the queue and awaits its result.
  pub async fn run<T: Send + 'static>(
    &self,
    task: impl Future<Output = T> + Send + 'static,
  ) -> Result<T> {
    let (result_tx, result_rx) = oneshot::channel();
    self
      .tx
      .send(Box::pin(async move {
        let _ = result_tx.send(task.await);
      }))
      .map_err(|_| anyhow!("task queue closed"))?;
    result_rx.await.map_err(|_| anyhow!("task dropped"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  #[tokio::test]
  async fn tasks_run_in_order() {
    let queue = TaskQueue::new("test");
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    for i in 0..10 {
      let log = log.clone();
      queue.enqueue(async move {
        log.lock().unwrap().push(i);
      });
    }
    queue.run(async {}).await.unwrap();
    assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
  }

  #[tokio::test]
  async fn run_returns_the_task_result() {
    let queue = TaskQueue::new("test");
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_ = counter.clone();
    let value = queue
      .run(async move {
        counter_.fetch_add(1, Ordering::SeqCst);
        42
      })
      .await
      .unwrap();
    assert_eq!(value, 42);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }
}
