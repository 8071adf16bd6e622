// Message synchronization engine.
//
// Merges REST history, optimistic sends and push events into one ordered,
// deduplicated message list. All mutations go through `MessageStore`
// reducers under a short-lived lock; the lock is never held across an await
// or while emitting on the push channel.

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::api::ChatApi;
use super::channel::{PushChannel, Subscription};
use super::correlation::{self, Exchange};
use super::events;
use super::store::MessageStore;
use super::typing::{TypingIndicator, TypingNotifier, TypingSignal};
use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult};
use crate::models::{
    Chat, ChatContext, ConnectionState, DeliveryStatus, ErrorEvent, Message, MessageDeliveredEvent,
    MessagePage, MessageReadEvent, MessageSentEvent, TypingEvent, UserOnlineEvent,
};

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    MessagesChanged,
    /// The first message created the chat for the active context.
    ChatCreated { chat_id: String },
    Typing { user_id: String, typing: bool },
    Error(ChatError),
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Reject empty or oversized content before any I/O.
pub fn validate_content(content: &str, max_chars: usize) -> ChatResult<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation("message content is empty".to_string()));
    }
    let length = trimmed.chars().count();
    if length > max_chars {
        return Err(ChatError::Validation(format!(
            "message content is {} characters, the limit is {}",
            length, max_chars
        )));
    }
    Ok(trimmed.to_string())
}

struct EngineState {
    store: MessageStore,
    context: Option<ChatContext>,
    chat_id: Option<String>,
    participants: Vec<String>,
    /// Bumped on every context switch; completions from older generations are dropped.
    generation: u64,
    joined: bool,
    push_live: bool,
    mark_read_in_flight: bool,
    typing_out: TypingNotifier,
    typing_in: TypingIndicator,
    subscriptions: Vec<Subscription>,
}

impl EngineState {
    fn accepts_push(&self, generation: u64) -> bool {
        self.generation == generation && self.push_live
    }

    fn is_current(&self, generation: u64, chat_id: &str) -> bool {
        self.generation == generation && self.chat_id.as_deref() == Some(chat_id)
    }

    /// Take the chat id the server assigned to the active context.
    fn adopt_chat_id(&mut self, chat_id: Option<&str>) -> Option<String> {
        match (self.chat_id.as_ref(), chat_id) {
            (None, Some(assigned)) => {
                info!("Server created chat {} for the active context", assigned);
                self.chat_id = Some(assigned.to_string());
                Some(assigned.to_string())
            }
            _ => None,
        }
    }
}

struct Inner {
    config: ClientConfig,
    api: Arc<dyn ChatApi>,
    channel: Arc<dyn PushChannel>,
    state: Mutex<EngineState>,
    events_tx: mpsc::Sender<EngineEvent>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

type Reducer = fn(&SyncEngine, u64, &Value);

impl SyncEngine {
    pub fn new(
        config: ClientConfig,
        api: Arc<dyn ChatApi>,
        channel: Arc<dyn PushChannel>,
    ) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let state = EngineState {
            store: MessageStore::new(&config.user_id),
            context: None,
            chat_id: None,
            participants: Vec::new(),
            generation: 0,
            joined: false,
            push_live: true,
            mark_read_in_flight: false,
            typing_out: TypingNotifier::new(config.typing_idle()),
            typing_in: TypingIndicator::new(config.typing_expiry()),
            subscriptions: Vec::new(),
        };

        (
            SyncEngine {
                inner: Arc::new(Inner {
                    config,
                    api,
                    channel,
                    state: Mutex::new(state),
                    events_tx,
                }),
            },
            events_rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // A panicking reducer must not wedge the chat.
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: EngineEvent) {
        if let Err(e) = self.inner.events_tx.try_send(event) {
            debug!("Engine event not delivered: {}", e);
        }
    }

    fn local_user_id(&self) -> &str {
        &self.inner.config.user_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Context lifecycle
    // ------------------------------------------------------------------

    /// Switch to `context`. `chat` is `None` while the context has no chat.
    ///
    /// In-flight work for the previous context is invalidated and its push
    /// listeners are removed before the new ones are registered.
    pub fn open(&self, context: ChatContext, chat: Option<&Chat>) {
        let (generation, stale) = {
            let mut st = self.lock();
            st.generation += 1;
            st.store.clear();
            st.context = Some(context.clone());
            st.chat_id = chat.map(|c| c.chat_id.clone());
            st.participants = chat
                .map(|c| c.participants.iter().map(|p| p.user_id.clone()).collect())
                .unwrap_or_default();
            st.joined = false;
            st.mark_read_in_flight = false;
            st.typing_out.reset();
            st.typing_in.clear();
            (st.generation, std::mem::take(&mut st.subscriptions))
        };
        drop(stale);
        info!(
            "Opened {} (chat {:?}, generation {})",
            context,
            chat.map(|c| c.chat_id.as_str()),
            generation
        );

        let subscriptions = self.subscribe_all(generation);
        let mut st = self.lock();
        if st.generation == generation {
            st.subscriptions = subscriptions;
        }
        drop(st);
        self.publish(EngineEvent::MessagesChanged);
    }

    /// Drop every message and listener (chat switch away, logout).
    pub fn reset(&self) {
        let stale = {
            let mut st = self.lock();
            st.generation += 1;
            st.store.clear();
            st.context = None;
            st.chat_id = None;
            st.participants.clear();
            st.joined = false;
            st.mark_read_in_flight = false;
            st.typing_out.reset();
            st.typing_in.clear();
            std::mem::take(&mut st.subscriptions)
        };
        drop(stale);
        debug!("Engine state reset");
        self.publish(EngineEvent::MessagesChanged);
    }

    /// Refresh chat metadata (participants) without touching the store.
    pub fn update_chat(&self, chat: &Chat) {
        let created = {
            let mut st = self.lock();
            if st.context.as_ref() != Some(&chat.context()) {
                debug!("Ignoring metadata for chat {} of another context", chat.chat_id);
                return;
            }
            st.participants = chat.participants.iter().map(|p| p.user_id.clone()).collect();
            st.adopt_chat_id(Some(&chat.chat_id))
        };
        if let Some(chat_id) = created {
            self.publish(EngineEvent::ChatCreated { chat_id });
        }
    }

    fn subscribe_all(&self, generation: u64) -> Vec<Subscription> {
        let reducers: [(&'static str, Reducer); 7] = [
            (events::MESSAGE_SENT, SyncEngine::on_message_sent),
            (events::MESSAGE_DELIVERED, SyncEngine::on_message_delivered),
            (events::MESSAGE_READ, SyncEngine::on_message_read),
            (events::TYPING, SyncEngine::on_typing),
            (events::TYPING_STOPPED, SyncEngine::on_typing_stopped),
            (events::USER_ONLINE, SyncEngine::on_user_online),
            (events::ERROR, SyncEngine::on_error),
        ];
        reducers
            .into_iter()
            .map(|(event, reducer)| self.subscribe_reducer(generation, event, reducer))
            .collect()
    }

    fn subscribe_reducer(&self, generation: u64, event: &'static str, reducer: Reducer) -> Subscription {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.channel.subscribe(
            event,
            Arc::new(move |payload: &Value| {
                if let Some(inner) = weak.upgrade() {
                    reducer(&SyncEngine { inner }, generation, payload);
                }
            }),
        )
    }

    // ------------------------------------------------------------------
    // Read accessors
    // ------------------------------------------------------------------

    pub fn messages(&self) -> Vec<Message> {
        self.lock().store.messages().to_vec()
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.lock().store.get(message_id).cloned()
    }

    pub fn chat_id(&self) -> Option<String> {
        self.lock().chat_id.clone()
    }

    pub fn context(&self) -> Option<ChatContext> {
        self.lock().context.clone()
    }

    pub fn is_joined(&self) -> bool {
        self.lock().joined
    }

    pub fn is_acknowledged(&self, message_id: &str) -> bool {
        self.lock().store.is_acknowledged(message_id)
    }

    pub fn typing_users(&self) -> Vec<String> {
        self.lock().typing_in.typing_users(Instant::now())
    }

    pub fn is_local_typing(&self) -> bool {
        self.lock().typing_out.is_typing()
    }

    /// Record room membership for the active chat; joining may trigger an
    /// automatic mark-read.
    pub fn set_joined(&self, joined: bool) {
        self.lock().joined = joined;
        if joined {
            self.maybe_auto_mark_read();
        }
    }

    /// Track push-channel liveness. Returns true when the channel came back
    /// for an active chat and history must be refetched to close the gap.
    pub fn on_connection_state(&self, state: &ConnectionState) -> bool {
        let mut st = self.lock();
        let was_live = st.push_live;
        st.push_live = state.is_connected();
        if was_live && !st.push_live {
            info!("Push channel left connected ({:?}); events untrusted until resync", state);
            st.joined = false;
        }
        !was_live && st.push_live && st.chat_id.is_some()
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Fetch one page of history and merge it into the store.
    ///
    /// A page that arrives after the active chat changed is returned but
    /// not merged.
    pub async fn history(&self, page: u32, limit: u32) -> ChatResult<MessagePage> {
        let (generation, chat_id) = {
            let st = self.lock();
            (st.generation, st.chat_id.clone())
        };
        let Some(chat_id) = chat_id else {
            debug!("No chat yet; history is empty");
            return Ok(MessagePage::default());
        };
        Ok(self
            .fetch_and_merge(generation, &chat_id, page, limit)
            .await?
            .unwrap_or_else(|page| page))
    }

    /// `Ok(Ok(page))` when merged, `Ok(Err(page))` when dropped as stale.
    async fn fetch_and_merge(
        &self,
        generation: u64,
        chat_id: &str,
        page: u32,
        limit: u32,
    ) -> ChatResult<Result<MessagePage, MessagePage>> {
        let fetched = match self.inner.api.fetch_messages(chat_id, page, limit).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!("Failed to fetch page {} of chat {}: {}", page, chat_id, e);
                self.publish(EngineEvent::Error(e.clone()));
                return Err(e);
            }
        };

        let changed = {
            let mut st = self.lock();
            if !st.is_current(generation, chat_id) {
                debug!("Discarding page {} of chat {}: active chat changed", page, chat_id);
                return Ok(Err(fetched));
            }
            st.store.merge_page(fetched.messages.clone())
        };
        debug!(
            "Merged page {} of chat {}: {} messages, {} changed",
            page,
            chat_id,
            fetched.messages.len(),
            changed
        );
        if changed > 0 {
            self.publish(EngineEvent::MessagesChanged);
            self.maybe_auto_mark_read();
        }
        Ok(Ok(fetched))
    }

    /// Refetch the whole history of the active chat, e.g. after reconnecting.
    /// Returns how many messages were fetched.
    pub async fn resync(&self) -> ChatResult<usize> {
        let (generation, chat_id) = {
            let st = self.lock();
            (st.generation, st.chat_id.clone())
        };
        let Some(chat_id) = chat_id else {
            return Ok(0);
        };

        info!("Resynchronizing chat {}", chat_id);
        let limit = self.inner.config.page_size.max(1);
        let mut fetched = 0;
        for page in 1..=self.inner.config.max_resync_pages.max(1) {
            match self.fetch_and_merge(generation, &chat_id, page, limit).await? {
                Ok(merged) => {
                    fetched += merged.messages.len();
                    if !merged.has_more {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        Ok(fetched)
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Send `content` to the active chat, or to the active context when no
    /// chat exists yet. Resolves once with the server-confirmed message.
    pub async fn send(&self, content: &str) -> ChatResult<Message> {
        let content = validate_content(content, self.inner.config.max_content_chars)?;
        let local = self.local_user_id().to_string();
        let pending_id = format!("pending-{}", Uuid::new_v4());

        let (generation, chat_id, context, stop_typing) = {
            let mut st = self.lock();
            let Some(context) = st.context.clone() else {
                return Err(ChatError::Validation("no active conversation".to_string()));
            };
            let pending_chat = st.chat_id.clone();
            st.store.insert_pending(Message {
                id: pending_id.clone(),
                chat_id: pending_chat,
                sender_id: local.clone(),
                content: content.clone(),
                delivery_status: DeliveryStatus::Sending,
                created_at: Utc::now(),
                read_at: None,
                read_by: None,
                client_message_id: None,
            });
            let stop = st.typing_out.on_send();
            (st.generation, st.chat_id.clone(), context, stop)
        };
        self.publish(EngineEvent::MessagesChanged);

        if let (Some(TypingSignal::Stop), Some(chat_id)) = (stop_typing, chat_id.as_deref()) {
            self.emit_typing(TypingSignal::Stop, chat_id);
        }

        let payload = match chat_id.as_deref() {
            Some(chat_id) => json!({
                "chatId": chat_id,
                "content": content,
                "clientMessageId": pending_id,
            }),
            None => json!({
                "contextType": context.context_type,
                "contextId": context.context_id,
                "content": content,
                "clientMessageId": pending_id,
            }),
        };
        let matcher = {
            let pending_id = pending_id.clone();
            let content = content.clone();
            move |response: &Value| {
                let message = &response["message"];
                match message.get("clientMessageId").and_then(Value::as_str) {
                    Some(client_id) => client_id == pending_id,
                    None => {
                        message["senderId"].as_str() == Some(local.as_str())
                            && message["content"].as_str() == Some(content.as_str())
                    }
                }
            }
        };
        let exchange = Exchange::new(events::SEND_MESSAGE, events::MESSAGE_SENT, payload)
            .matching(matcher)
            .with_timeout(self.inner.config.request_timeout());

        let confirmed = correlation::request(self.inner.channel.as_ref(), exchange)
            .await
            .and_then(|response| Ok(serde_json::from_value::<MessageSentEvent>(response)?));

        match confirmed {
            Ok(event) => {
                let mut message = event.message;
                if message.client_message_id.is_none() {
                    message.client_message_id = Some(pending_id.clone());
                }
                let created = {
                    let mut st = self.lock();
                    if st.generation != generation {
                        debug!("Send of {} completed after the context changed", message.id);
                        return Ok(message);
                    }
                    let created = st.adopt_chat_id(message.chat_id.as_deref());
                    st.store.upsert(message.clone());
                    created
                };
                info!("Message {} confirmed", message.id);
                self.publish(EngineEvent::MessagesChanged);
                if let Some(chat_id) = created {
                    self.publish(EngineEvent::ChatCreated { chat_id });
                }
                Ok(message)
            }
            Err(e) => {
                error!("Failed to send message: {}", e);
                {
                    let mut st = self.lock();
                    if st.generation == generation {
                        st.store.remove_pending(&pending_id);
                    }
                }
                self.publish(EngineEvent::MessagesChanged);
                self.publish(EngineEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Mark read
    // ------------------------------------------------------------------

    /// Ask the server to mark the active chat read. The server answers with
    /// a chat-level read event naming us as the reader.
    ///
    /// While the push channel is down the request/response API is used instead.
    pub async fn mark_read(&self) -> ChatResult<()> {
        let (generation, chat_id, live) = {
            let st = self.lock();
            (st.generation, st.chat_id.clone(), st.push_live)
        };
        let Some(chat_id) = chat_id else {
            return Ok(());
        };
        if !live {
            return self.mark_read_over_api(generation, &chat_id).await;
        }

        let local = self.local_user_id().to_string();
        let matches_chat = correlation::chat_id_is(&chat_id);
        let exchange = Exchange::new(events::MARK_AS_READ, events::MESSAGE_READ, json!({ "chatId": chat_id }))
            .matching(move |response: &Value| {
                matches_chat(response)
                    && response
                        .get("readBy")
                        .and_then(Value::as_str)
                        .map_or(true, |reader| reader == local)
            })
            .with_timeout(self.inner.config.request_timeout());

        match correlation::request(self.inner.channel.as_ref(), exchange).await {
            Ok(_) => {
                let mut st = self.lock();
                if st.is_current(generation, &chat_id) {
                    let acknowledged = st.store.acknowledge_peer_messages(&chat_id);
                    debug!("Marked chat {} read ({} newly acknowledged)", chat_id, acknowledged);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to mark chat {} read: {}", chat_id, e);
                self.publish(EngineEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    async fn mark_read_over_api(&self, generation: u64, chat_id: &str) -> ChatResult<()> {
        match self.inner.api.mark_chat_read(chat_id).await {
            Ok(remaining) => {
                let mut st = self.lock();
                if st.is_current(generation, chat_id) {
                    st.store.acknowledge_peer_messages(chat_id);
                }
                debug!("Marked chat {} read over the API; {} unread remain", chat_id, remaining);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to mark chat {} read: {}", chat_id, e);
                self.publish(EngineEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    fn maybe_auto_mark_read(&self) {
        {
            let mut st = self.lock();
            let due = st.joined
                && st.push_live
                && st.chat_id.is_some()
                && !st.mark_read_in_flight
                && !st.store.is_empty()
                && st.store.has_unacknowledged_peer_messages();
            if !due {
                return;
            }
            st.mark_read_in_flight = true;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; skipping automatic mark-read");
            self.lock().mark_read_in_flight = false;
            return;
        };
        let engine = self.clone();
        runtime.spawn(async move {
            if let Err(e) = engine.mark_read().await {
                debug!("Automatic mark-read failed: {}", e);
            }
            engine.lock().mark_read_in_flight = false;
        });
    }

    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    /// Record a local keystroke. Emits `typing-start` after idle and
    /// schedules `typing-stop` once the idle window passes without input.
    pub fn notify_typing(&self) {
        let (generation, chat_id, signal, idle) = {
            let mut st = self.lock();
            let Some(chat_id) = st.chat_id.clone() else {
                return;
            };
            let signal = st.typing_out.keystroke(Instant::now());
            (st.generation, chat_id, signal, st.typing_out.idle())
        };
        if let Some(signal) = signal {
            self.emit_typing(signal, &chat_id);
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let engine = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(idle).await;
            let signal = {
                let mut st = engine.lock();
                if st.generation != generation {
                    return;
                }
                st.typing_out.poll_idle(Instant::now())
            };
            if let Some(signal) = signal {
                engine.emit_typing(signal, &chat_id);
            }
        });
    }

    fn emit_typing(&self, signal: TypingSignal, chat_id: &str) {
        let event = match signal {
            TypingSignal::Start => events::TYPING_START,
            TypingSignal::Stop => events::TYPING_STOP,
        };
        if let Err(e) = self.inner.channel.emit(event, json!({ "chatId": chat_id })) {
            debug!("Could not emit {}: {}", event, e);
        }
    }

    fn schedule_typing_expiry(&self, generation: u64, after: std::time::Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let engine = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let expired = {
                let mut st = engine.lock();
                if st.generation != generation {
                    return;
                }
                st.typing_in.expire(Instant::now())
            };
            for user_id in expired {
                engine.publish(EngineEvent::Typing { user_id, typing: false });
            }
        });
    }

    // ------------------------------------------------------------------
    // Push-event reducers
    // ------------------------------------------------------------------

    fn decode<T: DeserializeOwned>(&self, event: &str, payload: &Value) -> Option<T> {
        match serde_json::from_value(payload.clone()) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!("Dropping malformed '{}' payload: {}", event, e);
                self.publish(EngineEvent::Error(ChatError::Decode(format!("{}: {}", event, e))));
                None
            }
        }
    }

    fn on_message_sent(&self, generation: u64, payload: &Value) {
        let Some(event) = self.decode::<MessageSentEvent>(events::MESSAGE_SENT, payload) else {
            return;
        };
        let context = event.context();
        let message = event.message;

        let (changed, created) = {
            let mut st = self.lock();
            if !st.accepts_push(generation) {
                return;
            }
            let own_pending_echo = message
                .client_message_id
                .as_deref()
                .and_then(|id| st.store.get(id))
                .map_or(false, |pending| pending.is_pending());

            let belongs = match (st.chat_id.as_deref(), message.chat_id.as_deref()) {
                (Some(active), Some(incoming)) => active == incoming,
                (Some(_), None) => own_pending_echo,
                // Awaiting the first message of this context.
                (None, _) => own_pending_echo || (context.is_some() && context == st.context),
            };
            if !belongs {
                debug!("Ignoring message {} for another chat ({:?})", message.id, message.chat_id);
                return;
            }

            let created = st.adopt_chat_id(message.chat_id.as_deref());
            (st.store.upsert(message), created)
        };

        if changed {
            self.publish(EngineEvent::MessagesChanged);
        }
        if let Some(chat_id) = created {
            self.publish(EngineEvent::ChatCreated { chat_id });
        }
        self.maybe_auto_mark_read();
    }

    fn on_message_delivered(&self, generation: u64, payload: &Value) {
        let Some(event) = self.decode::<MessageDeliveredEvent>(events::MESSAGE_DELIVERED, payload) else {
            return;
        };
        let changed = {
            let mut st = self.lock();
            if !st.accepts_push(generation) {
                return;
            }
            if let (Some(active), Some(incoming)) = (st.chat_id.as_deref(), event.chat_id.as_deref()) {
                if active != incoming {
                    return;
                }
            }
            st.store.apply_delivered(&event.message_id)
        };
        if changed {
            self.publish(EngineEvent::MessagesChanged);
        }
    }

    fn on_message_read(&self, generation: u64, payload: &Value) {
        let Some(event) = self.decode::<MessageReadEvent>(events::MESSAGE_READ, payload) else {
            return;
        };
        let local = self.local_user_id();
        let changed = {
            let mut st = self.lock();
            if !st.accepts_push(generation) || st.chat_id.as_deref() != Some(event.chat_id.as_str()) {
                debug!("Ignoring read event for chat {}", event.chat_id);
                return;
            }
            // A read without a reader is the answer to our own mark-as-read.
            match event.read_by.as_deref() {
                Some(reader) if reader != local => {
                    let read_at = event.read_at.unwrap_or_else(Utc::now);
                    st.store.mark_own_messages_read(&event.chat_id, Some(reader), read_at)
                }
                _ => {
                    st.store.acknowledge_peer_messages(&event.chat_id);
                    0
                }
            }
        };
        if changed > 0 {
            debug!("{} messages in chat {} marked read", changed, event.chat_id);
            self.publish(EngineEvent::MessagesChanged);
        }
    }

    fn on_user_online(&self, generation: u64, payload: &Value) {
        let Some(event) = self.decode::<UserOnlineEvent>(events::USER_ONLINE, payload) else {
            return;
        };
        let promoted = {
            let mut st = self.lock();
            if !st.accepts_push(generation) || event.user_id == self.local_user_id() {
                return;
            }
            if !st.participants.is_empty() && !st.participants.contains(&event.user_id) {
                debug!("Ignoring presence of {}: not in this chat", event.user_id);
                return;
            }
            st.store.promote_on_peer_online(&event.user_id)
        };
        if promoted > 0 {
            debug!("{} came online; {} messages now delivered", event.user_id, promoted);
            self.publish(EngineEvent::MessagesChanged);
        }
    }

    fn on_typing(&self, generation: u64, payload: &Value) {
        let Some(event) = self.decode::<TypingEvent>(events::TYPING, payload) else {
            return;
        };
        let (started, expiry) = {
            let mut st = self.lock();
            if !st.accepts_push(generation)
                || st.chat_id.as_deref() != Some(event.chat_id.as_str())
                || event.user_id == self.local_user_id()
            {
                return;
            }
            let started = st.typing_in.on_typing(&event.user_id, Instant::now());
            (started, st.typing_in.expiry())
        };
        if started {
            self.publish(EngineEvent::Typing {
                user_id: event.user_id,
                typing: true,
            });
        }
        self.schedule_typing_expiry(generation, expiry);
    }

    fn on_typing_stopped(&self, generation: u64, payload: &Value) {
        let Some(event) = self.decode::<TypingEvent>(events::TYPING_STOPPED, payload) else {
            return;
        };
        let stopped = {
            let mut st = self.lock();
            if !st.accepts_push(generation) || st.chat_id.as_deref() != Some(event.chat_id.as_str()) {
                return;
            }
            st.typing_in.on_stopped(&event.user_id, Instant::now())
        };
        if stopped {
            self.publish(EngineEvent::Typing {
                user_id: event.user_id,
                typing: false,
            });
        }
    }

    fn on_error(&self, generation: u64, payload: &Value) {
        let Some(event) = self.decode::<ErrorEvent>(events::ERROR, payload) else {
            return;
        };
        if self.lock().generation != generation {
            return;
        }
        // Correlated errors belong to the operation that issued the request.
        if event.request_id.is_none() && event.event.is_none() {
            warn!("Push channel error: {}", event.message);
            self.publish(EngineEvent::Error(ChatError::socket(events::ERROR, event.message)));
        }
    }
}
