//! WebSocket transport on tokio-tungstenite.
//!
//! Bridges the async socket to the synchronous [`Connection`] contract
//! through channels: a background task owns the socket, reconnects with a
//! fixed pause, and answers WebSocket pings. Must be constructed inside a
//! tokio runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use super::connection::{Connection, ReceiveCallback};

const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

pub struct WsConnection {
    to_socket: mpsc::UnboundedSender<String>,
    from_socket: std_mpsc::Receiver<String>,
    connected: Arc<AtomicBool>,
    recv_cb: Option<ReceiveCallback>,
    last_recv_tick: u64,
    started: Instant,
}

impl WsConnection {
    /// `url` is the full endpoint including the charge point id path
    /// segment; `subprotocol` is `ocpp1.6` or `ocpp2.0.1`.
    pub fn connect(url: String, subprotocol: &'static str) -> Self {
        let (to_socket, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, from_socket) = std_mpsc::channel::<String>();
        let connected = Arc::new(AtomicBool::new(false));

        let flag = connected.clone();
        tokio::spawn(async move {
            run_socket(url, subprotocol, outbound_rx, inbound_tx, flag).await;
        });

        Self {
            to_socket,
            from_socket,
            connected,
            recv_cb: None,
            last_recv_tick: 0,
            started: Instant::now(),
        }
    }

    fn tick_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Connection for WsConnection {
    fn poll(&mut self) {
        while let Ok(text) = self.from_socket.try_recv() {
            if let Some(cb) = &mut self.recv_cb {
                if cb(text.as_bytes()) {
                    self.last_recv_tick = self.tick_ms();
                }
            }
        }
    }

    fn send_text(&mut self, text: &str) -> bool {
        if !self.connected.load(Ordering::Relaxed) {
            return false;
        }
        self.to_socket.send(text.to_string()).is_ok()
    }

    fn set_receive_cb(&mut self, cb: ReceiveCallback) {
        self.recv_cb = Some(cb);
    }

    fn last_recv_tick_ms(&self) -> u64 {
        self.last_recv_tick
    }

    fn is_open(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

async fn run_socket(
    url: String,
    subprotocol: &'static str,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: std_mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
) {
    loop {
        let request = match url.as_str().into_client_request() {
            Ok(mut request) => {
                match subprotocol.parse() {
                    Ok(value) => {
                        request
                            .headers_mut()
                            .insert("Sec-WebSocket-Protocol", value);
                    }
                    Err(_) => unreachable!("static subprotocol strings are valid header values"),
                }
                request
            }
            Err(e) => {
                error!(%url, "invalid backend url: {e}");
                return;
            }
        };

        match connect_async(request).await {
            Ok((stream, _response)) => {
                info!(%url, "backend connected");
                connected.store(true, Ordering::Relaxed);
                let (mut sink, mut source) = stream.split();

                loop {
                    tokio::select! {
                        outbound = outbound_rx.recv() => {
                            match outbound {
                                Some(text) => {
                                    if let Err(e) = sink.send(Message::Text(text)).await {
                                        warn!("send failed: {e}");
                                        break;
                                    }
                                }
                                // The WsConnection was dropped.
                                None => return,
                            }
                        }
                        inbound = source.next() => {
                            match inbound {
                                Some(Ok(Message::Text(text))) => {
                                    if inbound_tx.send(text).is_err() {
                                        return;
                                    }
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = sink.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Binary(_))) => {
                                    warn!("binary frame ignored");
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!("backend closed connection");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("receive failed: {e}");
                                    break;
                                }
                            }
                        }
                    }
                }
                connected.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(%url, "connect failed: {e}");
            }
        }
        tokio::time::sleep(RECONNECT_PAUSE).await;
    }
}
