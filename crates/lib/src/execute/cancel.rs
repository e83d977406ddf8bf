//! Run-wide cancellation.

use std::sync::Arc;

use tokio::sync::watch;

/// A cancellation flag shared by every task in a run.
///
/// Raising it is idempotent. Tasks poll [`CancelSignal::is_cancelled`] at their
/// checkpoints or await [`CancelSignal::cancelled`] alongside other work.
#[derive(Debug, Clone)]
pub struct CancelSignal {
  tx: Arc<watch::Sender<bool>>,
  rx: watch::Receiver<bool>,
}

impl Default for CancelSignal {
  fn default() -> Self {
    Self::new()
  }
}

impl CancelSignal {
  pub fn new() -> Self {
    let (tx, rx) = watch::channel(false);
    Self { tx: Arc::new(tx), rx }
  }

  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once the signal has been raised.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    // the sender lives as long as any clone of self, so this only returns once raised
    let _ = rx.wait_for(|cancelled| *cancelled).await;
  }
}
