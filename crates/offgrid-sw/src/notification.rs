//! System notifications.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::WorkerResult;

/// A notification to display. Derived per push event; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDescriptor {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// De-duplication tag; a new notification with the same tag replaces
    /// the visible one.
    pub tag: String,
    /// Scope-relative or absolute URL opened on click.
    pub url: String,
    pub renotify: bool,
    pub require_interaction: bool,
    pub vibrate: Vec<u32>,
}

/// Platform seam for the notification display API.
pub trait Notifier: Send + Sync {
    fn show<'a>(
        &'a self,
        notification: &'a NotificationDescriptor,
    ) -> BoxFuture<'a, WorkerResult<()>>;

    /// Dismiss the notification carrying `tag`, if visible.
    fn close(&self, tag: &str);
}

/// In-process [`Notifier`] that keeps visible notifications in a list.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    inner: Mutex<CenterInner>,
}

#[derive(Debug, Default)]
struct CenterInner {
    visible: Vec<NotificationDescriptor>,
    shown: usize,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently visible notifications, oldest first.
    pub fn visible(&self) -> Vec<NotificationDescriptor> {
        self.lock().visible.clone()
    }

    /// Total number of `show` calls.
    pub fn shown_count(&self) -> usize {
        self.lock().shown
    }

    fn lock(&self) -> MutexGuard<'_, CenterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Notifier for NotificationCenter {
    fn show<'a>(
        &'a self,
        notification: &'a NotificationDescriptor,
    ) -> BoxFuture<'a, WorkerResult<()>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.visible.retain(|n| n.tag != notification.tag);
            inner.visible.push(notification.clone());
            inner.shown += 1;
            debug!(tag = %notification.tag, title = %notification.title, "Notification shown");
            Ok(())
        })
    }

    fn close(&self, tag: &str) {
        self.lock().visible.retain(|n| n.tag != tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(tag: &str, title: &str) -> NotificationDescriptor {
        NotificationDescriptor {
            title: title.to_string(),
            body: "body".to_string(),
            icon: "/static/icons/icon-192.png".to_string(),
            badge: "/static/icons/icon-192.png".to_string(),
            tag: tag.to_string(),
            url: "/notifications".to_string(),
            renotify: true,
            require_interaction: false,
            vibrate: vec![100, 50, 100],
        }
    }

    #[tokio::test]
    async fn test_same_tag_replaces() {
        let center = NotificationCenter::new();
        center.show(&notification("chat", "first")).await.unwrap();
        center.show(&notification("chat", "second")).await.unwrap();
        center.show(&notification("order", "third")).await.unwrap();

        let visible = center.visible();
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].title, "second");
        assert_eq!(center.shown_count(), 3);
    }

    #[tokio::test]
    async fn test_close_by_tag() {
        let center = NotificationCenter::new();
        center.show(&notification("chat", "hi")).await.unwrap();
        center.close("chat");
        assert!(center.visible().is_empty());
    }
}
