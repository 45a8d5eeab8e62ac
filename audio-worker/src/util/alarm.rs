use std::sync::OnceLock;

use tokio::sync::Notify;

/// A one-off alarm carrying a value.
pub struct Alarm<T> {
    notify: Notify,
    value: OnceLock<T>,
}

impl<T: Copy> Alarm<T> {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
            value: OnceLock::new(),
        }
    }

    /// Trigger the alarm with `value`.
    ///
    /// Makes any tasks waiting on [`Self::triggered`] unblocked.
    ///
    /// If the alarm has been triggered already does nothing and returns `false`.
    pub fn trigger(&self, value: T) -> bool {
        if self.value.set(value).is_err() {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    /// Returns the value if the alarm has been triggered.
    pub fn get(&self) -> Option<T> {
        self.value.get().copied()
    }

    /// Wait until the alarm is triggered and return its value.
    ///
    /// If the [`Self::trigger`] has been called already returns immediately.
    pub async fn triggered(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking, a trigger in between must not be missed.
            notified.as_mut().enable();
            if let Some(value) = self.get() {
                return value;
            }
            notified.await;
        }
    }
}

impl<T: Copy> Default for Alarm<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Alarm;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn first_trigger_wins() {
        let alarm = Alarm::new();
        assert!(alarm.trigger(0));
        assert!(!alarm.trigger(7));
        assert_eq!(alarm.triggered().await, 0);
    }

    #[tokio::test]
    async fn wakes_a_pending_waiter() {
        let alarm = Arc::new(Alarm::new());
        let waiter = tokio::spawn({
            let alarm = alarm.clone();
            async move { alarm.triggered().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        alarm.trigger(3);
        let value = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 3);
    }
}
