//! Notification sink: how the sync core asks the UI to alert the user

use crate::models::ContactId;

/// Something the user should be told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    NewMessage {
        contact_id: ContactId,
        sender: String,
        preview: String,
    },
    ContactOnline {
        contact_id: ContactId,
        display_name: String,
    },
    /// The event channel lost its connection and is retrying.
    Offline,
    /// A refresh failed; the shown data may be out of date.
    Stale,
    /// The session credential was rejected or is missing.
    SignedOut,
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::NewMessage { .. } => "new_message",
            Notification::ContactOnline { .. } => "contact_online",
            Notification::Offline => "offline",
            Notification::Stale => "stale",
            Notification::SignedOut => "signed_out",
        }
    }

    /// User-facing text.
    pub fn message(&self) -> String {
        match self {
            Notification::NewMessage {
                sender, preview, ..
            } => format!("{}: {}", sender, preview),
            Notification::ContactOnline { display_name, .. } => {
                format!("{} is online", display_name)
            }
            Notification::Offline => "You appear to be offline".to_string(),
            Notification::Stale => "Messages may be out of date, refreshing...".to_string(),
            Notification::SignedOut => "Disconnected, please sign in again".to_string(),
        }
    }
}

/// Receives notifications. Delivery is entirely up to the implementor.
pub trait NotificationSink: Send {
    fn notify(&self, notification: &Notification);
}

/// Prints notifications to stdout (used by the `watch` command).
pub struct StdoutNotifier;

impl NotificationSink for StdoutNotifier {
    fn notify(&self, notification: &Notification) {
        tracing::debug!(kind = notification.kind(), "Notification");
        println!("[{}] {}", notification.kind(), notification.message());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Collects notifications for assertions.
    #[derive(Clone, Default)]
    pub struct RecordingNotifier(pub Arc<Mutex<Vec<Notification>>>);

    impl RecordingNotifier {
        pub fn take(&self) -> Vec<Notification> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl NotificationSink for RecordingNotifier {
        fn notify(&self, notification: &Notification) {
            self.0.lock().unwrap().push(notification.clone());
        }
    }
}
