// Push channel: socket.io over the Engine.IO websocket transport

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::packet::{self, Handshake, Packet};
use crate::downloader::errors::DownloadError;
use crate::downloader::models::ProgressEvent;
use crate::downloader::traits::{ProgressHandler, Subscription};
use crate::downloader::utils::lock;

/// Inbound event carrying job progress
pub const PROGRESS_EVENT: &str = "progress";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

type HandlerSlot = Arc<Mutex<Option<(u64, ProgressHandler)>>>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

pub struct PushChannel {
    url: Url,
    sid: String,
    outgoing: mpsc::UnboundedSender<Message>,
    handler: HandlerSlot,
    next_handler_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl PushChannel {
    /// Open the websocket, run the Engine.IO handshake and join the default namespace
    pub async fn connect(url: Url) -> Result<Self, DownloadError> {
        info!(url = %url, "Connecting push channel");

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut source) = stream.split();

        let session = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut sink, &mut source))
            .await
            .map_err(|_| DownloadError::Transport("socket.io handshake timed out".to_string()))??;
        info!(sid = %session.sid, "Push channel connected");

        let (outgoing, queue) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(write_loop(sink, queue));

        let handler: HandlerSlot = Arc::new(Mutex::new(None));
        let reader = tokio::spawn(read_loop(
            source,
            handler.clone(),
            outgoing.clone(),
            liveness_limit(&session),
        ));

        Ok(Self {
            url,
            sid: session.sid,
            outgoing,
            handler,
            next_handler_id: AtomicU64::new(1),
            reader,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// False once the backend closed the session or stopped pinging
    pub fn is_open(&self) -> bool {
        !self.reader.is_finished() && !self.outgoing.is_closed()
    }

    /// Queue a socket.io event for the backend
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) -> Result<(), DownloadError> {
        if !self.is_open() {
            return Err(DownloadError::Transport("push channel is closed".to_string()));
        }
        let text = packet::encode_event(event, data)?;
        trace!(event, "emit");
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| DownloadError::Transport("push channel is closed".to_string()))
    }

    /// Replace the progress handler. The returned subscription only clears
    /// the slot while its own handler is still installed.
    pub fn subscribe(&self, handler: ProgressHandler) -> Subscription {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        *lock(&self.handler) = Some((id, handler));

        let slot = self.handler.clone();
        Subscription::new(move || {
            let mut current = lock(&slot);
            if matches!(current.as_ref(), Some((installed, _)) if *installed == id) {
                *current = None;
            }
        })
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.reader.abort();
        // The writer drains these and exits on the close frame
        let _ = self.outgoing.send(Message::Text(packet::DISCONNECT.to_string()));
        let _ = self.outgoing.send(Message::Close(None));
    }
}

async fn handshake(sink: &mut WsSink, source: &mut WsSource) -> Result<Handshake, DownloadError> {
    let mut opened: Option<Handshake> = None;

    while let Some(frame) = source.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match packet::decode(&text)? {
            Packet::Open(session) => {
                debug!(sid = %session.sid, ping_interval = session.ping_interval, "engine.io open");
                sink.send(Message::Text(packet::CONNECT.to_string())).await?;
                opened = Some(session);
            }
            Packet::Ping(payload) => sink.send(Message::Text(packet::pong(&payload))).await?,
            Packet::Connect => {
                return opened.ok_or_else(|| {
                    DownloadError::Transport("namespace connected before engine.io open".to_string())
                });
            }
            Packet::ConnectError(message) => {
                return Err(DownloadError::Transport(format!(
                    "socket.io connection refused: {}",
                    message
                )));
            }
            Packet::Close | Packet::Disconnect => break,
            other => trace!(?other, "ignoring packet during handshake"),
        }
    }

    Err(DownloadError::Transport(
        "push channel closed during handshake".to_string(),
    ))
}

/// The server pings every `ping_interval`; silence past interval + timeout means a dead link
fn liveness_limit(session: &Handshake) -> Option<Duration> {
    let millis = session.ping_interval.saturating_add(session.ping_timeout);
    (millis > 0).then(|| Duration::from_millis(millis))
}

async fn write_loop(mut sink: WsSink, mut queue: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = queue.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            warn!(error = %e, "push channel write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut source: WsSource,
    slot: HandlerSlot,
    outgoing: mpsc::UnboundedSender<Message>,
    liveness: Option<Duration>,
) {
    loop {
        let next = match liveness {
            Some(limit) => match tokio::time::timeout(limit, source.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(limit_ms = limit.as_millis() as u64, "backend stopped pinging");
                    break;
                }
            },
            None => source.next().await,
        };

        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "push channel closed by backend");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(error = %e, "push channel read failed");
                break;
            }
            None => break,
        };

        match packet::decode(&text) {
            Ok(Packet::Event { name, data }) => dispatch_event(&name, data, &slot),
            Ok(Packet::Ping(payload)) => {
                let _ = outgoing.send(Message::Text(packet::pong(&payload)));
            }
            Ok(Packet::Close) | Ok(Packet::Disconnect) => {
                info!("Backend ended the socket.io session");
                break;
            }
            Ok(other) => trace!(?other, "ignoring packet"),
            Err(e) => warn!(error = %e, "dropping malformed push frame"),
        }
    }

    let _ = outgoing.send(Message::Close(None));
    info!("Push channel disconnected");
}

/// Route one event to the installed handler. Unknown events and
/// payloads that do not parse are dropped.
fn dispatch_event(name: &str, data: serde_json::Value, slot: &HandlerSlot) {
    if name != PROGRESS_EVENT {
        debug!(event = name, "ignoring push event");
        return;
    }

    let event: ProgressEvent = match serde_json::from_value(data) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "dropping malformed progress event");
            return;
        }
    };

    // Call outside the lock so the handler may subscribe again
    let handler = lock(slot).as_ref().map(|(_, h)| h.clone());
    match handler {
        Some(handler) => handler(event),
        None => trace!(video_id = %event.video_id, "no progress handler installed"),
    }
}
