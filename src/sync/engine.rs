//! Sync engine: the single task that owns the store
//!
//! The event channel, REST calls and user commands all feed one loop.
//! Network work is spawned and reports back as an [`Input`], so the loop
//! itself never waits on the network.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::reconcile::{Effects, Reconciler};
use super::snapshot::{
    Completion, Freshness, RefreshReason, Snapshot, SnapshotLoader, SnapshotSource, SnapshotTicket,
};
use crate::auth::AuthService;
use crate::channel::{Backoff, ChannelSignal, ChannelState, EventChannel, Transport};
use crate::config::SyncSettings;
use crate::models::{
    ClientEvent, ClientId, ContactId, ContactRecord, ContactSummary, Message, MessageId,
    MessageKind, MessageRecord,
};
use crate::notify::{Notification, NotificationSink};
use crate::store::Store;

/// Outbound frames waiting for a connection beyond this are dropped.
const OUTBOUND_QUEUE: usize = 256;
const SIGNAL_QUEUE: usize = 256;

/// REST operations the engine performs on behalf of the user.
#[async_trait]
pub trait RemoteApi: SnapshotSource {
    async fn send_message(
        &self,
        to: ContactId,
        content: String,
        kind: MessageKind,
        client_id: ClientId,
    ) -> Result<MessageRecord>;
    async fn mark_read(&self, contact: ContactId) -> Result<()>;
    async fn delete_message(&self, id: MessageId) -> Result<()>;
    async fn add_contact(&self, id: ContactId) -> Result<ContactRecord>;
    async fn remove_contact(&self, id: ContactId) -> Result<()>;
}

/// User intents.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Focus(ContactId),
    Unfocus,
    MarkRead(ContactId),
    Send {
        to: ContactId,
        content: String,
        kind: MessageKind,
    },
    Delete(MessageId),
    AddContact(ContactId),
    RemoveContact(ContactId),
    Refresh,
    SetTyping {
        contact: ContactId,
        is_typing: bool,
    },
    Shutdown,
}

/// Read-only view republished after every change.
#[derive(Debug, Clone, Default)]
pub struct StoreView {
    pub contacts: Vec<ContactSummary>,
    pub focused: Option<ContactId>,
    /// Messages of the focused conversation, in order.
    pub conversation: Vec<Message>,
    pub connection: ChannelState,
    pub freshness: Freshness,
}

impl StoreView {
    pub fn contact(&self, id: &str) -> Option<&ContactSummary> {
        self.contacts.iter().find(|c| c.id == id)
    }
}

/// Completions of spawned network work.
enum Input {
    Snapshot(SnapshotTicket, Result<Snapshot>),
    SendAck(ClientId, Result<MessageRecord>),
    ContactAdded(Result<ContactRecord>),
    ContactRemoved(ContactId, Result<()>),
    Remote(&'static str, Result<()>),
    RetryRefresh,
}

pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<StoreView>,
    task: JoinHandle<Store>,
}

impl EngineHandle {
    pub fn send(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            tracing::error!("Engine stopped -- command dropped");
        }
    }

    pub fn view(&self) -> watch::Receiver<StoreView> {
        self.view.clone()
    }

    /// Stop the engine and the event channel, returning the final store.
    pub async fn shutdown(self) -> Result<Store> {
        let _ = self.commands.send(Command::Shutdown);
        self.task.await.context("Engine task failed")
    }
}

/// Start the event channel and the engine on the current runtime.
pub fn spawn<T: Transport + 'static>(
    transport: T,
    me: &str,
    settings: &SyncSettings,
    api: Arc<dyn RemoteApi>,
    auth: Arc<dyn AuthService>,
    notifier: Box<dyn NotificationSink>,
) -> EngineHandle {
    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(StoreView::default());

    let channel = EventChannel::new(transport, auth, settings, signal_tx);
    tokio::spawn(channel.run(outbound_rx, shutdown_rx));

    let engine = Engine {
        store: Store::new(me, settings.typing_expiry()),
        reconciler: Reconciler::new(settings.pending_buffer_limit, settings.pending_buffer_ttl()),
        loader: SnapshotLoader::new(),
        api,
        notifier,
        connection: ChannelState::Disconnected,
        outbound: outbound_tx,
        inputs: input_tx,
        view: view_tx,
        shutdown: shutdown_tx,
        retry: Backoff {
            base: Duration::from_millis(settings.backoff_base_ms),
            factor: settings.backoff_factor,
            cap: Duration::from_millis(settings.backoff_cap_ms),
        },
        refresh_failures: 0,
    };
    let task = tokio::spawn(engine.run(signal_rx, cmd_rx, input_rx, settings.tick()));

    EngineHandle {
        commands: cmd_tx,
        view: view_rx,
        task,
    }
}

struct Engine {
    store: Store,
    reconciler: Reconciler,
    loader: SnapshotLoader,
    api: Arc<dyn RemoteApi>,
    notifier: Box<dyn NotificationSink>,
    connection: ChannelState,
    outbound: mpsc::Sender<ClientEvent>,
    inputs: mpsc::UnboundedSender<Input>,
    view: watch::Sender<StoreView>,
    shutdown: watch::Sender<bool>,
    retry: Backoff,
    refresh_failures: u32,
}

impl Engine {
    async fn run(
        mut self,
        mut signals: mpsc::Receiver<ChannelSignal>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        tick_every: Duration,
    ) -> Store {
        self.refresh(RefreshReason::ColdStart);
        self.publish();

        let mut tick = time::interval(tick_every);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                Some(signal) = signals.recv() => self.on_signal(signal),
                Some(input) = inputs.recv() => self.on_input(input),
                _ = tick.tick() => {
                    let effects = self.reconciler.tick(&mut self.store, Instant::now());
                    self.carry_out(effects);
                }
            }
        }

        tracing::info!(
            "Sync engine shutting down ({} buffered events discarded)",
            self.reconciler.buffered()
        );
        let _ = self.shutdown.send(true);
        self.store
    }

    fn on_signal(&mut self, signal: ChannelSignal) {
        match signal {
            ChannelSignal::StateChanged(state) => {
                self.connection = state;
                match state {
                    ChannelState::Reconnecting { attempt: 1 } => {
                        self.notify(Notification::Offline);
                    }
                    ChannelState::Unauthenticated => {
                        tracing::error!("Event channel is unauthenticated");
                        self.notify(Notification::SignedOut);
                    }
                    _ => {}
                }
                self.publish();
            }
            ChannelSignal::Resynced => self.refresh(RefreshReason::Resync),
            ChannelSignal::Event(event) => {
                let effects = self
                    .reconciler
                    .apply_event(&mut self.store, event, Instant::now());
                self.carry_out(effects);
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        tracing::debug!("Command: {:?}", cmd);
        match cmd {
            Command::Focus(contact) => {
                let effects = self.reconciler.focus(&mut self.store, Some(&contact));
                self.carry_out(effects);
                // Picks up the conversation page for the newly focused contact.
                self.refresh(RefreshReason::Manual);
            }
            Command::Unfocus => {
                let effects = self.reconciler.focus(&mut self.store, None);
                self.carry_out(effects);
            }
            Command::MarkRead(contact) => {
                let effects = self.reconciler.mark_read(&mut self.store, &contact);
                self.carry_out(effects);
            }
            Command::Send { to, content, kind } => {
                let (client_id, effects) =
                    self.reconciler
                        .begin_send(&mut self.store, &to, content.clone(), kind);
                self.carry_out(effects);
                let api = Arc::clone(&self.api);
                let tx = self.inputs.clone();
                tokio::spawn(async move {
                    let result = api.send_message(to, content, kind, client_id.clone()).await;
                    let _ = tx.send(Input::SendAck(client_id, result));
                });
            }
            Command::Delete(id) => {
                let effects = self.reconciler.delete_local(&mut self.store, &id);
                self.carry_out(effects);
                let api = Arc::clone(&self.api);
                self.spawn_remote("delete message", async move { api.delete_message(id).await });
            }
            Command::AddContact(id) => {
                let api = Arc::clone(&self.api);
                let tx = self.inputs.clone();
                tokio::spawn(async move {
                    let result = api.add_contact(id).await;
                    let _ = tx.send(Input::ContactAdded(result));
                });
            }
            Command::RemoveContact(id) => {
                if self.reconciler.remove_contact(&mut self.store, &id, Utc::now()) {
                    self.publish();
                }
                let api = Arc::clone(&self.api);
                let tx = self.inputs.clone();
                tokio::spawn(async move {
                    let result = api.remove_contact(id.clone()).await;
                    let _ = tx.send(Input::ContactRemoved(id, result));
                });
            }
            Command::Refresh => self.refresh(RefreshReason::Manual),
            Command::SetTyping { contact, is_typing } => {
                self.emit(ClientEvent::Typing {
                    contact_id: contact,
                    is_typing,
                });
            }
            Command::Shutdown => {}
        }
    }

    fn on_input(&mut self, input: Input) {
        let now = Instant::now();
        match input {
            Input::Snapshot(ticket, result) => {
                match self.loader.complete(ticket, result) {
                    Completion::Apply(snapshot) => {
                        self.refresh_failures = 0;
                        let effects = self.reconciler.apply_snapshot(&mut self.store, snapshot, now);
                        self.carry_out(effects);
                    }
                    Completion::Superseded => {}
                    Completion::Failed(_) if self.loader.freshness() == Freshness::Stale => {
                        self.notify(Notification::Stale);
                        self.schedule_retry();
                    }
                    Completion::Failed(_) => {}
                }
                self.publish();
            }
            Input::SendAck(client_id, Ok(record)) => {
                let effects = self
                    .reconciler
                    .confirm_send(&mut self.store, &client_id, record, now);
                self.carry_out(effects);
            }
            Input::SendAck(client_id, Err(e)) => {
                tracing::warn!(client_id = %client_id, "Send failed: {:#}", e);
                let effects = self.reconciler.fail_send(&mut self.store, &client_id);
                self.carry_out(effects);
            }
            Input::ContactAdded(Ok(record)) => {
                let effects = self.reconciler.add_contact(&mut self.store, record);
                self.carry_out(effects);
            }
            Input::ContactAdded(Err(e)) => tracing::warn!("Add contact failed: {:#}", e),
            Input::ContactRemoved(id, Ok(())) => {
                self.reconciler.removal_confirmed(&mut self.store, &id);
            }
            Input::ContactRemoved(id, Err(e)) => {
                tracing::warn!(contact = %id, "Remove contact failed: {:#}", e);
            }
            Input::Remote(what, Ok(())) => tracing::debug!("{} done", what),
            Input::Remote(what, Err(e)) => tracing::warn!("Failed to {}: {:#}", what, e),
            Input::RetryRefresh => {
                if self.loader.freshness() == Freshness::Stale && self.loader.in_flight() == 0 {
                    self.refresh(RefreshReason::Resync);
                }
            }
        }
    }

    fn carry_out(&mut self, effects: Effects) {
        for event in effects.outbound {
            self.emit(event);
        }
        for contact in effects.read_receipts {
            let api = Arc::clone(&self.api);
            self.spawn_remote("mark read", async move { api.mark_read(contact).await });
        }
        for notification in &effects.notifications {
            self.notifier.notify(notification);
        }
        if effects.needs_hydration {
            self.refresh(RefreshReason::Hydration);
        }
        if effects.changed {
            self.publish();
        }
    }

    fn refresh(&mut self, reason: RefreshReason) {
        let Some(ticket) = self.loader.begin(reason) else {
            return;
        };
        let api = Arc::clone(&self.api);
        let tx = self.inputs.clone();
        let focus = self.store.contacts.focused().map(str::to_string);
        tokio::spawn(async move {
            let result = api.fetch_snapshot(focus).await;
            let _ = tx.send(Input::Snapshot(ticket, result));
        });
        self.publish();
    }

    fn schedule_retry(&mut self) {
        self.refresh_failures = self.refresh_failures.saturating_add(1);
        let delay = self.retry.delay(self.refresh_failures);
        tracing::info!("Retrying snapshot in {:?}", delay);
        let tx = self.inputs.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(Input::RetryRefresh);
        });
    }

    fn spawn_remote<F>(&self, what: &'static str, call: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let tx = self.inputs.clone();
        tokio::spawn(async move {
            let _ = tx.send(Input::Remote(what, call.await));
        });
    }

    /// Queue a frame for the channel. Frames wait while disconnected.
    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.outbound.try_send(event) {
            tracing::warn!("Outbound queue full, dropping frame: {}", e);
        }
    }

    fn notify(&self, notification: Notification) {
        self.notifier.notify(&notification);
    }

    fn publish(&self) {
        let focused = self.store.contacts.focused().map(str::to_string);
        let conversation = focused
            .as_deref()
            .map(|c| self.store.messages.conversation(c).to_vec())
            .unwrap_or_default();
        self.view.send_replace(StoreView {
            contacts: self.store.summaries(Instant::now()),
            focused,
            conversation,
            connection: self.connection,
            freshness: self.loader.freshness(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::auth::{Credential, StaticAuth};
    use crate::channel::testing::{scripted, Script};
    use crate::models::{DeliveryState, Presence};
    use crate::notify::testing::RecordingNotifier;

    #[derive(Default)]
    struct FakeApi {
        contacts: Mutex<Vec<ContactRecord>>,
        fail_snapshots: AtomicBool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn with_contacts(ids: &[&str]) -> Arc<Self> {
            let api = FakeApi::default();
            *api.contacts.lock().unwrap() = ids
                .iter()
                .map(|id| ContactRecord {
                    id: id.to_string(),
                    display_name: id.to_uppercase(),
                    avatar_url: None,
                    presence: Presence::Offline,
                    last_seen_at: None,
                    // Older than any live event sent during a test.
                    presence_updated_at: "2024-01-01T00:00:00Z".parse().ok(),
                    last_message_preview: None,
                    last_message_at: None,
                    unread_count: 0,
                })
                .collect();
            Arc::new(api)
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SnapshotSource for FakeApi {
        async fn fetch_snapshot(&self, focus: Option<ContactId>) -> Result<Snapshot> {
            if self.fail_snapshots.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            Ok(Snapshot {
                contacts: self.contacts.lock().unwrap().clone(),
                conversation: focus.map(|c| (c, Vec::new())),
                as_of: Utc::now(),
            })
        }
    }

    #[async_trait]
    impl RemoteApi for FakeApi {
        async fn send_message(
            &self,
            to: ContactId,
            content: String,
            kind: MessageKind,
            client_id: ClientId,
        ) -> Result<MessageRecord> {
            self.calls.lock().unwrap().push(format!("send:{}", to));
            Ok(MessageRecord {
                id: "srv-1".into(),
                sender_id: "me".into(),
                receiver_id: to,
                content: Some(content),
                media_ref: None,
                kind,
                created_at: Utc::now(),
                delivery_state: DeliveryState::Sent,
                deleted: false,
                client_id: Some(client_id),
            })
        }

        async fn mark_read(&self, contact: ContactId) -> Result<()> {
            self.calls.lock().unwrap().push(format!("read:{}", contact));
            Ok(())
        }

        async fn delete_message(&self, id: MessageId) -> Result<()> {
            self.calls.lock().unwrap().push(format!("delete:{}", id));
            Ok(())
        }

        async fn add_contact(&self, id: ContactId) -> Result<ContactRecord> {
            let record = ContactRecord {
                id: id.clone(),
                display_name: "New".into(),
                avatar_url: None,
                presence: Presence::Offline,
                last_seen_at: None,
                presence_updated_at: None,
                last_message_preview: None,
                last_message_at: None,
                unread_count: 0,
            };
            self.contacts.lock().unwrap().push(record.clone());
            Ok(record)
        }

        async fn remove_contact(&self, id: ContactId) -> Result<()> {
            self.calls.lock().unwrap().push(format!("remove:{}", id));
            self.contacts.lock().unwrap().retain(|c| c.id != id);
            Ok(())
        }
    }

    fn start(api: Arc<FakeApi>, token: Option<&str>) -> (EngineHandle, Script, RecordingNotifier) {
        let (transport, script) = scripted(vec![]);
        let notifier = RecordingNotifier::default();
        let auth = Arc::new(StaticAuth(token.map(|t| Credential::new(t.into(), Some(3600)))));
        let handle = spawn(
            transport,
            "me",
            &SyncSettings::default(),
            api,
            auth,
            Box::new(notifier.clone()),
        );
        (handle, script, notifier)
    }

    async fn wait_for(
        view: &mut watch::Receiver<StoreView>,
        pred: impl Fn(&StoreView) -> bool,
    ) -> StoreView {
        let wait = async {
            loop {
                {
                    let current = view.borrow_and_update();
                    if pred(&current) {
                        return current.clone();
                    }
                }
                view.changed().await.expect("engine stopped");
            }
        };
        time::timeout(Duration::from_secs(120), wait)
            .await
            .expect("view never reached expected state")
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_then_live_presence() {
        let api = FakeApi::with_contacts(&["ada", "bob"]);
        let (handle, script, notifier) = start(api, Some("tok"));
        let mut view = handle.view();

        let v = wait_for(&mut view, |v| {
            v.contacts.len() == 2 && v.connection == ChannelState::Connected
        })
        .await;
        assert_eq!(v.contact("ada").unwrap().presence, Presence::Offline);

        let at = Utc::now().to_rfc3339();
        script.push(&format!(
            r#"{{"event":"presence_changed","data":{{"contactId":"ada","presence":"online","at":"{}"}}}}"#,
            at
        ));
        wait_for(&mut view, |v| {
            v.contact("ada").map(|c| c.presence) == Some(Presence::Online)
        })
        .await;
        assert!(notifier
            .take()
            .iter()
            .any(|n| matches!(n, Notification::ContactOnline { contact_id, .. } if contact_id == "ada")));

        tokio_test::assert_ok!(handle.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_replaces_pending_with_confirmed() {
        let api = FakeApi::with_contacts(&["ada"]);
        let (handle, _script, _notifier) = start(api.clone(), Some("tok"));
        let mut view = handle.view();
        wait_for(&mut view, |v| v.freshness == Freshness::Fresh).await;

        handle.send(Command::Focus("ada".into()));
        handle.send(Command::Send {
            to: "ada".into(),
            content: "hello".into(),
            kind: MessageKind::Text,
        });

        let v = wait_for(&mut view, |v| {
            v.conversation.iter().any(|m| m.id() == Some("srv-1"))
        })
        .await;
        assert_eq!(v.conversation.len(), 1);
        assert!(matches!(v.conversation[0], Message::Confirmed(_)));
        assert_eq!(
            v.contact("ada").unwrap().last_message_preview.as_deref(),
            Some("hello")
        );

        let store = handle.shutdown().await.unwrap();
        assert_eq!(store.messages.conversation("ada").len(), 1);
        assert!(api.calls().contains(&"send:ada".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_snapshot_keeps_state_and_notifies() {
        let api = FakeApi::with_contacts(&["ada"]);
        let (handle, _script, notifier) = start(api.clone(), Some("tok"));
        let mut view = handle.view();
        wait_for(&mut view, |v| v.freshness == Freshness::Fresh && v.contacts.len() == 1).await;

        api.fail_snapshots.store(true, Ordering::SeqCst);
        handle.send(Command::Refresh);
        let v = wait_for(&mut view, |v| v.freshness == Freshness::Stale).await;
        assert_eq!(v.contacts.len(), 1);
        assert!(notifier.take().contains(&Notification::Stale));

        // The scheduled retry recovers once the server answers again.
        api.fail_snapshots.store(false, Ordering::SeqCst);
        wait_for(&mut view, |v| v.freshness == Freshness::Fresh).await;

        tokio_test::assert_ok!(handle.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credential_signs_out() {
        let api = FakeApi::with_contacts(&["ada"]);
        let (handle, _script, notifier) = start(api, None);
        let mut view = handle.view();

        wait_for(&mut view, |v| v.connection == ChannelState::Unauthenticated).await;
        assert!(notifier.take().contains(&Notification::SignedOut));

        // REST state is still shown.
        wait_for(&mut view, |v| v.contacts.len() == 1).await;
        tokio_test::assert_ok!(handle.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_sends_read_receipt() {
        let api = FakeApi::with_contacts(&["ada"]);
        let (handle, script, _notifier) = start(api.clone(), Some("tok"));
        let mut view = handle.view();
        wait_for(&mut view, |v| {
            v.freshness == Freshness::Fresh && v.connection == ChannelState::Connected
        })
        .await;

        let at = Utc::now().to_rfc3339();
        script.push(&format!(
            r#"{{"event":"message_received","data":{{"message":{{"id":"m1","senderId":"ada","receiverId":"me","content":"hi","type":"text","createdAt":"{}"}}}}}}"#,
            at
        ));
        wait_for(&mut view, |v| v.contact("ada").map(|c| c.unread_count) == Some(1)).await;

        handle.send(Command::Focus("ada".into()));
        wait_for(&mut view, |v| v.contact("ada").map(|c| c.unread_count) == Some(0)).await;
        time::sleep(Duration::from_millis(50)).await;

        assert!(api.calls().contains(&"read:ada".to_string()));
        assert!(script.sent().iter().any(|f| f.contains("messages_read")));
        tokio_test::assert_ok!(handle.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_and_remove_contact() {
        let api = FakeApi::with_contacts(&[]);
        let (handle, _script, _notifier) = start(api.clone(), Some("tok"));
        let mut view = handle.view();
        wait_for(&mut view, |v| v.freshness == Freshness::Fresh).await;

        handle.send(Command::AddContact("cy".into()));
        wait_for(&mut view, |v| v.contact("cy").is_some()).await;

        handle.send(Command::RemoveContact("cy".into()));
        wait_for(&mut view, |v| v.contacts.is_empty()).await;
        time::sleep(Duration::from_millis(50)).await;
        assert!(api.calls().contains(&"remove:cy".to_string()));

        handle.send(Command::Refresh);
        time::sleep(Duration::from_millis(50)).await;
        let v = view.borrow().clone();
        assert_eq!(v.freshness, Freshness::Fresh);
        assert!(v.contact("cy").is_none());

        tokio_test::assert_ok!(handle.shutdown().await);
    }
}
