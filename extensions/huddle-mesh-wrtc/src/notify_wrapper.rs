use std::sync::Arc;
use tokio::sync::Notify;

/// Wakes a background task when the handle that owns this value goes away.
pub struct NotifyWrapper {
    pub notify: Arc<Notify>,
}

impl NotifyWrapper {
    pub fn new() -> (Self, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        (
            Self {
                notify: notify.clone(),
            },
            notify,
        )
    }
}

impl Drop for NotifyWrapper {
    fn drop(&mut self) {
        self.notify.notify_waiters();
    }
}
