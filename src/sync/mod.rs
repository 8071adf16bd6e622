pub mod api;
pub mod channel;
pub mod connection;
pub mod correlation;
pub mod engine;
pub mod memory;
pub mod session;
pub mod store;
pub mod typing;
pub mod unread;

use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::config::ClientConfig;
use crate::error::ChatResult;
use crate::models::{Chat, ChatContext, ConnectionState, Message};
use api::ChatApi;
use connection::{ConnectionManager, PushTransport};
use engine::{EngineEvent, SyncEngine};
use session::SessionResolver;
use unread::{UnreadCounter, UnreadScope};

/// Push-channel event names.
pub mod events {
    // Server to client
    pub const MESSAGE_SENT: &str = "message-sent";
    pub const MESSAGE_DELIVERED: &str = "message-delivered";
    pub const MESSAGE_READ: &str = "message-read";
    pub const TYPING: &str = "typing";
    pub const TYPING_STOPPED: &str = "typing-stopped";
    pub const USER_ONLINE: &str = "user-online";
    pub const UNREAD_COUNT_UPDATED: &str = "unread-count-updated";
    pub const CHAT_JOINED: &str = "chat-joined";
    pub const CHAT_LEFT: &str = "chat-left";
    pub const ERROR: &str = "error";

    // Client to server
    pub const JOIN_CHAT: &str = "join-chat";
    pub const LEAVE_CHAT: &str = "leave-chat";
    pub const SEND_MESSAGE: &str = "send-message";
    pub const MARK_AS_READ: &str = "mark-as-read";
    pub const TYPING_START: &str = "typing-start";
    pub const TYPING_STOP: &str = "typing-stop";
}

/// One user's chat client: the shared connection plus the conversation
/// currently on screen.
pub struct ChatSession {
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    resolver: SessionResolver,
    engine: SyncEngine,
    api: Arc<dyn ChatApi>,
    global_unread: UnreadCounter,
    chat_unread: Mutex<Option<UnreadCounter>>,
    /// Latest `open` call; an older call that resolves late is not applied.
    open_seq: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn new(
        config: ClientConfig,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn PushTransport>,
    ) -> (Arc<Self>, mpsc::Receiver<EngineEvent>) {
        let connection = ConnectionManager::new(transport);
        let channel = connection.channel();
        let resolver = SessionResolver::new(api.clone(), channel.clone(), config.request_timeout());
        let (engine, events) = SyncEngine::new(config.clone(), api.clone(), channel.clone());
        let global_unread = UnreadCounter::attach(api.clone(), channel.as_ref(), UnreadScope::Global);

        let session = Arc::new(ChatSession {
            config,
            connection,
            resolver,
            engine,
            api,
            global_unread,
            chat_unread: Mutex::new(None),
            open_seq: AtomicU64::new(0),
            watcher: Mutex::new(None),
        });
        (session, events)
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn resolver(&self) -> &SessionResolver {
        &self.resolver
    }

    pub fn global_unread(&self) -> &UnreadCounter {
        &self.global_unread
    }

    pub fn chat_unread(&self) -> Option<u32> {
        self.chat_unread
            .lock()
            .ok()
            .and_then(|counter| counter.as_ref().map(UnreadCounter::count))
    }

    /// Establish the push connection and follow its state.
    pub fn connect(self: &Arc<Self>) {
        // Logout removes every listener, the badge counter's included.
        self.global_unread.reattach(self.connection.channel().as_ref());
        self.connection.init();

        let mut watcher = match self.watcher.lock() {
            Ok(watcher) => watcher,
            Err(poisoned) => poisoned.into_inner(),
        };
        if watcher.is_some() {
            return;
        }

        let session = Arc::downgrade(self);
        let mut states = WatchStream::new(self.connection.watch());
        *watcher = Some(tokio::spawn(async move {
            while let Some(state) = states.next().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.on_connection_state(state).await;
            }
            debug!("Connection watcher finished");
        }));
    }

    async fn on_connection_state(&self, state: ConnectionState) {
        let needs_resync = self.engine.on_connection_state(&state);
        if !state.is_connected() {
            // The server drops room membership with the transport.
            self.resolver.forget_membership();
            return;
        }

        let Some(chat_id) = self.engine.chat_id() else {
            return;
        };
        if let Err(e) = self.enter_room(&chat_id).await {
            warn!("Could not rejoin chat {}: {}", chat_id, e);
        }
        if needs_resync {
            match self.engine.resync().await {
                Ok(fetched) => info!("Resync of chat {} fetched {} messages", chat_id, fetched),
                Err(e) => warn!("Resync of chat {} failed: {}", chat_id, e),
            }
        }
        if let Err(e) = self.refresh_unread().await {
            debug!("Unread refresh after reconnect failed: {}", e);
        }
    }

    async fn enter_room(&self, chat_id: &str) -> ChatResult<bool> {
        if !self.connection.is_connected() {
            debug!("Not connected; joining chat {} after reconnect", chat_id);
            return Ok(false);
        }
        let joined = self.resolver.join(Some(chat_id)).await?;
        if joined && self.engine.chat_id().as_deref() == Some(chat_id) {
            self.engine.set_joined(true);
        }
        Ok(joined)
    }

    fn track_chat_unread(&self, chat_id: Option<&str>) {
        let counter = chat_id.map(|id| {
            UnreadCounter::attach(
                self.api.clone(),
                self.connection.channel().as_ref(),
                UnreadScope::from_chat_id(Some(id)),
            )
        });
        if let Ok(mut current) = self.chat_unread.lock() {
            *current = counter;
        }
    }

    /// Open the conversation attached to `context`: resolve it, join its
    /// room and load the first page of history.
    ///
    /// Returns `None` when no chat exists yet; the first `send` creates it.
    pub async fn open(&self, context: ChatContext) -> ChatResult<Option<Chat>> {
        let seq = self.open_seq.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(e) = self.resolver.leave().await {
            warn!("Leaving the previous chat failed: {}", e);
        }

        let chat = self.resolver.resolve(&context).await?;
        if self.open_seq.load(Ordering::SeqCst) != seq {
            debug!("Discarding resolution of {}: superseded", context);
            return Ok(chat);
        }

        self.engine.open(context, chat.as_ref());
        self.track_chat_unread(chat.as_ref().map(|c| c.chat_id.as_str()));

        if let Some(chat) = &chat {
            if let Err(e) = self.enter_room(&chat.chat_id).await {
                warn!("Could not join chat {}: {}", chat.chat_id, e);
            }
            self.engine.history(1, self.config.page_size).await?;
        }
        Ok(chat)
    }

    /// Send a message. When it created the chat, the room is joined and the
    /// chat metadata fetched before returning.
    pub async fn send(&self, content: &str) -> ChatResult<Message> {
        let message = self.engine.send(content).await?;

        if let Some(chat_id) = self.engine.chat_id() {
            if self.resolver.joined_chat().as_deref() != Some(chat_id.as_str()) {
                if let Some(context) = self.engine.context() {
                    match self.resolver.resolve(&context).await {
                        Ok(Some(chat)) => self.engine.update_chat(&chat),
                        Ok(None) => debug!("Chat {} not visible over the API yet", chat_id),
                        Err(e) => warn!("Could not load metadata for chat {}: {}", chat_id, e),
                    }
                }
                if self.chat_unread().is_none() {
                    self.track_chat_unread(Some(&chat_id));
                }
                if let Err(e) = self.enter_room(&chat_id).await {
                    warn!("Could not join new chat {}: {}", chat_id, e);
                }
            }
        }
        Ok(message)
    }

    pub async fn mark_read(&self) -> ChatResult<()> {
        self.engine.mark_read().await
    }

    pub fn notify_typing(&self) {
        self.engine.notify_typing();
    }

    /// Fetch authoritative unread counts for the global badge and the open chat.
    pub async fn refresh_unread(&self) -> ChatResult<u32> {
        let total = self.global_unread.refresh().await?;
        let chat_id = self.engine.chat_id();
        if let Some(chat_id) = chat_id {
            let count = self.api.unread_count(&chat_id).await?;
            if let Ok(counter) = self.chat_unread.lock() {
                if let Some(counter) = counter.as_ref() {
                    counter.set(count);
                }
            }
        }
        Ok(total)
    }

    /// Leave the open chat and drop its state.
    pub async fn close(&self) -> ChatResult<()> {
        self.open_seq.fetch_add(1, Ordering::SeqCst);
        let left = self.resolver.leave().await;
        self.engine.reset();
        self.track_chat_unread(None);
        left.map(|_| ())
    }

    /// Close everything and tear the connection down.
    pub async fn logout(&self) {
        if let Err(e) = self.close().await {
            debug!("Leave during logout failed: {}", e);
        }
        self.stop_watcher();
        self.connection.teardown();
        self.global_unread.set(0);
        info!("Logged out");
    }

    fn stop_watcher(&self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(handle) = watcher.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}
