//! Long-lived client for the switch management protocol: banner check,
//! login, ActionID-correlated requests, ping keepalive, event fan-out,
//! and reconnect with backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};

mod protocol;
pub use protocol::Message;

pub const BANNER_MAGIC: &str = "Asterisk Call Manager";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub reconnect_interval: Duration,
    pub ping_interval: Duration,
    pub action_timeout: Duration,
    pub connect_timeout: Duration,
    pub event_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5038,
            username: "router".to_string(),
            password: String::new(),
            reconnect_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            action_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            event_buffer_size: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("action timed out")]
    Timeout,
    #[error("not connected to the switch")]
    NotConnected,
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

type EventHandler = Arc<dyn Fn(Message) + Send + Sync>;

enum Pending {
    /// Waiting for the correlated response message.
    Response(oneshot::Sender<Message>),
    /// Streaming fan-out events until the named completion event.
    Collect {
        sender: mpsc::UnboundedSender<Message>,
        complete: String,
    },
}

struct Inner {
    config: Config,
    next_action_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    shutdown: tokio_util::sync::CancellationToken,
}

/// Handle to the switch. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Builds the client and starts its connection supervisor. The first
    /// connection attempt happens in the background; actions issued before
    /// it completes fail with [`Error::NotConnected`].
    pub fn new(config: Config) -> Self {
        let inner = Arc::new(Inner {
            config,
            next_action_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            shutdown: tokio_util::sync::CancellationToken::new(),
        });
        tokio::spawn(supervise(inner.clone()));
        Self { inner }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    /// Waits until the supervisor has a live, authenticated connection.
    pub async fn wait_connected(&self, deadline: Duration) -> Result<(), Error> {
        let wait = async {
            while !self.is_connected() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| Error::Timeout)
    }

    /// Registers a handler for an event type. Handlers run off the reader
    /// hot path; a slow handler delays other handlers, not the reader.
    pub fn on_event(&self, event: &str, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.inner
            .handlers
            .write()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Sends one action and awaits its correlated response.
    pub async fn send_action(&self, mut action: Message) -> Result<Message, Error> {
        let id = self.inner.next_action_id.fetch_add(1, Ordering::SeqCst) + 1;
        action.push("ActionID", &id.to_string());

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(id, Pending::Response(tx));

        if let Err(err) = self.write(&action).await {
            self.inner.pending.lock().unwrap().remove(&id);
            metrics::counter!("ami_actions_failed_total", "reason" => "write").increment(1);
            return Err(err);
        }

        match tokio::time::timeout(self.inner.config.action_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // The connection died and the slot was dropped.
            Ok(Err(_)) => {
                metrics::counter!("ami_actions_failed_total", "reason" => "disconnect")
                    .increment(1);
                Err(Error::Timeout)
            }
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&id);
                metrics::counter!("ami_actions_failed_total", "reason" => "timeout").increment(1);
                Err(Error::Timeout)
            }
        }
    }

    /// Sends an action whose reply fans out as events, collecting them
    /// until `complete_event` arrives with the same ActionID.
    pub async fn collect(
        &self,
        mut action: Message,
        complete_event: &str,
    ) -> Result<Vec<Message>, Error> {
        let id = self.inner.next_action_id.fetch_add(1, Ordering::SeqCst) + 1;
        action.push("ActionID", &id.to_string());

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.pending.lock().unwrap().insert(
            id,
            Pending::Collect {
                sender: tx,
                complete: complete_event.to_string(),
            },
        );

        if let Err(err) = self.write(&action).await {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(err);
        }

        let mut items = Vec::new();
        loop {
            let next = tokio::time::timeout(self.inner.config.action_timeout, rx.recv()).await;
            match next {
                Ok(Some(message)) => {
                    if message.event() == Some(complete_event) {
                        return Ok(items);
                    }
                    items.push(message);
                }
                Ok(None) => {
                    return Err(Error::Protocol(
                        "collection aborted by disconnect or error response".to_string(),
                    ))
                }
                Err(_) => {
                    self.inner.pending.lock().unwrap().remove(&id);
                    return Err(Error::Timeout);
                }
            }
        }
    }

    async fn write(&self, message: &Message) -> Result<(), Error> {
        let mut writer = self.inner.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(Error::NotConnected);
        };
        if let Err(err) = stream.write_all(message.serialize().as_bytes()).await {
            // The reader will notice too; drop the writer now so further
            // actions fail fast.
            *writer = None;
            return Err(err.into());
        }
        Ok(())
    }

    /// Stops the supervisor, attempting a clean logoff first.
    pub async fn close(&self) {
        let _ = self.send_action(Message::action("Logoff")).await;
        self.inner.shutdown.cancel();
    }

    // Typed helpers over the raw action surface.

    pub async fn ping(&self) -> Result<(), Error> {
        let response = self.send_action(Message::action("Ping")).await?;
        if response.is_success() || response.get("Ping").is_some() {
            Ok(())
        } else {
            Err(Error::Protocol("unexpected ping response".to_string()))
        }
    }

    /// Reloads the switch's endpoint configuration after provisioning.
    pub async fn reload_endpoints(&self) -> Result<(), Error> {
        self.command("pjsip reload").await
    }

    pub async fn reload_dialplan(&self) -> Result<(), Error> {
        self.command("dialplan reload").await
    }

    async fn command(&self, command: &str) -> Result<(), Error> {
        let response = self
            .send_action(Message::action("Command").with("Command", command))
            .await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "command '{command}' failed: {}",
                response.get("Message").unwrap_or("no message")
            )))
        }
    }

    /// Force-hangs a channel with the given cause code.
    pub async fn hangup(&self, channel: &str, cause: u32) -> Result<(), Error> {
        let response = self
            .send_action(
                Message::action("Hangup")
                    .with("Channel", channel)
                    .with("Cause", &cause.to_string()),
            )
            .await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "hangup of '{channel}' failed: {}",
                response.get("Message").unwrap_or("no message")
            )))
        }
    }

    pub async fn get_var(&self, channel: &str, variable: &str) -> Result<Option<String>, Error> {
        let response = self
            .send_action(
                Message::action("GetVar")
                    .with("Channel", channel)
                    .with("Variable", variable),
            )
            .await?;
        Ok(response.get("Value").map(str::to_string))
    }

    pub async fn set_var(&self, channel: &str, variable: &str, value: &str) -> Result<(), Error> {
        let response = self
            .send_action(
                Message::action("SetVar")
                    .with("Channel", channel)
                    .with("Variable", variable)
                    .with("Value", value),
            )
            .await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(Error::Protocol(format!("setvar {variable} failed")))
        }
    }

    pub async fn originate(
        &self,
        channel: &str,
        context: &str,
        exten: &str,
        priority: u32,
    ) -> Result<(), Error> {
        let response = self
            .send_action(
                Message::action("Originate")
                    .with("Channel", channel)
                    .with("Context", context)
                    .with("Exten", exten)
                    .with("Priority", &priority.to_string()),
            )
            .await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(Error::Protocol("originate refused".to_string()))
        }
    }

    /// Lists live channels: `CoreShowChannel` events until the matching
    /// `CoreShowChannelsComplete`.
    pub async fn core_show_channels(&self) -> Result<Vec<Message>, Error> {
        self.collect(
            Message::action("CoreShowChannels"),
            "CoreShowChannelsComplete",
        )
        .await
    }

    /// Queue state: QueueParams/QueueMember/QueueEntry events until
    /// `QueueStatusComplete`.
    pub async fn queue_status(&self) -> Result<Vec<Message>, Error> {
        self.collect(Message::action("QueueStatus"), "QueueStatusComplete")
            .await
    }

    pub async fn db_get(&self, family: &str, key: &str) -> Result<Message, Error> {
        self.send_action(
            Message::action("DBGet")
                .with("Family", family)
                .with("Key", key),
        )
        .await
    }

    pub async fn db_put(&self, family: &str, key: &str, value: &str) -> Result<(), Error> {
        self.send_action(
            Message::action("DBPut")
                .with("Family", family)
                .with("Key", key)
                .with("Val", value),
        )
        .await
        .map(|_| ())
    }

    pub async fn db_del(&self, family: &str, key: &str) -> Result<(), Error> {
        self.send_action(
            Message::action("DBDel")
                .with("Family", family)
                .with("Key", key),
        )
        .await
        .map(|_| ())
    }
}

/// Connection supervisor: connects, serves until the connection drops,
/// fails outstanding actions, then waits and reconnects.
async fn supervise(inner: Arc<Inner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }

        match serve_connection(&inner).await {
            Ok(()) => return, // Clean shutdown.
            Err(err) => {
                tracing::warn!(%err, "switch connection lost");
            }
        }

        inner.connected.store(false, Ordering::Relaxed);
        *inner.writer.lock().await = None;
        // Outstanding actions fail with Timeout when their slots drop.
        inner.pending.lock().unwrap().clear();

        metrics::counter!("ami_reconnects_total").increment(1);
        tokio::select! {
            () = tokio::time::sleep(inner.config.reconnect_interval) => (),
            () = inner.shutdown.cancelled() => return,
        }
    }
}

async fn serve_connection(inner: &Arc<Inner>) -> Result<(), Error> {
    let stream = tokio::time::timeout(
        inner.config.connect_timeout,
        tokio::net::TcpStream::connect((inner.config.host.as_str(), inner.config.port)),
    )
    .await
    .map_err(|_| Error::Timeout)??;
    stream.set_nodelay(true).ok();

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Pre-session banner.
    let mut banner = String::new();
    reader.read_line(&mut banner).await?;
    if !banner.contains(BANNER_MAGIC) {
        return Err(Error::Protocol(format!(
            "unexpected banner: {}",
            banner.trim()
        )));
    }

    *inner.writer.lock().await = Some(write_half);

    // Login carries no correlation id; its response is the next response
    // message on the wire.
    let login = Message::action("Login")
        .with("Username", &inner.config.username)
        .with("Secret", &inner.config.password);
    {
        let mut writer = inner.writer.lock().await;
        let stream = writer.as_mut().ok_or(Error::NotConnected)?;
        stream.write_all(login.serialize().as_bytes()).await?;
    }
    let response = loop {
        let message = read_message(&mut reader).await?;
        if message.is_response() {
            break message;
        }
    };
    if !response.is_success() {
        return Err(Error::Auth(
            response.get("Message").unwrap_or("login refused").to_string(),
        ));
    }

    inner.connected.store(true, Ordering::Relaxed);
    tracing::info!(
        host = %inner.config.host,
        port = inner.config.port,
        "connected to switch"
    );

    // Handler dispatch runs on its own task so a slow handler cannot
    // stall the reader.
    let (event_tx, mut event_rx) = mpsc::channel::<Message>(inner.config.event_buffer_size);
    let dispatch_inner = inner.clone();
    let dispatcher = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let Some(name) = event.event().map(str::to_string) else {
                continue;
            };
            let handlers: Vec<EventHandler> = dispatch_inner
                .handlers
                .read()
                .unwrap()
                .get(&name)
                .cloned()
                .unwrap_or_default();
            for handler in handlers {
                handler(event.clone());
            }
        }
    });

    // Keepalive runs on its own task so the reader never races a write:
    // dropping a half-read message on a ping tick would desync framing.
    let ping_inner = inner.clone();
    let ping_stop = inner.shutdown.child_token();
    let keepalive = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = tokio::time::sleep(ping_inner.config.ping_interval) => (),
                () = ping_stop.cancelled() => return,
            }
            // Fire-and-forget with its own ActionID; the response is
            // dropped by routing, its arrival alone rearms the read
            // deadline.
            let id = ping_inner.next_action_id.fetch_add(1, Ordering::SeqCst) + 1;
            let action = Message::action("Ping").with("ActionID", &id.to_string());
            let mut writer = ping_inner.writer.lock().await;
            let Some(stream) = writer.as_mut() else { return };
            if stream
                .write_all(action.serialize().as_bytes())
                .await
                .is_err()
            {
                // The reader hits its deadline and reconnects.
                *writer = None;
                return;
            }
        }
    });

    // A ping response arrives at least once per interval, so a silent
    // wire for two intervals means the connection is dead.
    let read_deadline = inner.config.ping_interval * 2;

    let result = loop {
        tokio::select! {
            read = tokio::time::timeout(read_deadline, read_message(&mut reader)) => {
                match read {
                    Ok(Ok(message)) => route(inner, message, &event_tx),
                    Ok(Err(err)) => break Err(err),
                    Err(_) => break Err(Error::Timeout),
                }
            }
            () = inner.shutdown.cancelled() => break Ok(()),
        }
    };

    drop(event_tx);
    keepalive.abort();
    dispatcher.abort();
    result
}

/// Reads one blank-line-terminated message. EOF is an error: the switch
/// closed on us.
async fn read_message(reader: &mut BufReader<OwnedReadHalf>) -> Result<Message, Error> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "switch closed the connection",
            )));
        }
        let line = line.trim_end().to_string();
        if line.is_empty() {
            if lines.is_empty() {
                continue;
            }
            return Ok(Message::parse(&lines));
        }
        lines.push(line);
    }
}

fn route(inner: &Arc<Inner>, message: Message, event_tx: &mpsc::Sender<Message>) {
    let action_id = message.action_id();

    if message.is_response() {
        if let Some(id) = action_id {
            let mut pending = inner.pending.lock().unwrap();
            match pending.remove(&id) {
                Some(Pending::Response(tx)) => {
                    let _ = tx.send(message);
                }
                Some(Pending::Collect { sender, complete }) => {
                    if message.is_success() {
                        // Events will follow; keep collecting.
                        pending.insert(id, Pending::Collect { sender, complete });
                    }
                    // An error response drops the sender, aborting the
                    // collection.
                }
                None => tracing::debug!(id, "uncorrelated response dropped"),
            }
        }
        return;
    }

    if message.event().is_some() {
        if let Some(id) = action_id {
            let mut pending = inner.pending.lock().unwrap();
            let collected = match pending.get(&id) {
                Some(Pending::Collect { sender, complete }) => {
                    let is_complete = message.event() == Some(complete.as_str());
                    let _ = sender.send(message.clone());
                    Some(is_complete)
                }
                _ => None,
            };
            match collected {
                Some(true) => {
                    pending.remove(&id);
                    return;
                }
                Some(false) => return,
                None => (),
            }
        }

        if let Err(err) = event_tx.try_send(message) {
            metrics::counter!("ami_events_dropped_total").increment(1);
            tracing::warn!(%err, "event buffer full, dropping event");
        }
    }
}
