//! Bidirectional control transport.
//!
//! A thin ownership wrapper around one WebSocket connection to an Instance.
//! The connection runs on its own task; the owner talks to it through
//! commands and receives [`TransportEvent`]s on the channel it supplied at
//! open time.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Bytes, Message},
};
use tokio_util::task::AbortOnDropHandle;
use url::Url;

/// Events surfaced to the owning supervisor.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Opened,
    Text(String),
    Pong,
    Closed { code: Option<u16> },
    Error(String),
}

enum Command {
    SendText(String),
    Ping,
    Close,
}

/// One control connection.
///
/// Dropping the transport aborts the connection task outright. [`close`]
/// additionally detaches event delivery first, so a close racing an
/// intentional shutdown cannot echo back into reconnect logic; it is safe to
/// call while the connection is still being established.
///
/// [`close`]: Transport::close
#[derive(Debug)]
pub struct Transport {
    commands: mpsc::UnboundedSender<Command>,
    attached: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
    _task: AbortOnDropHandle<()>,
}

impl Transport {
    /// Start connecting. `TransportEvent::Opened` (or an error event) will
    /// arrive on `events`; the attempt is abandoned with an error event if
    /// the connection has not opened within `connect_timeout`.
    pub fn open(
        url: Url,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (commands, cmd_rx) = mpsc::unbounded_channel();
        let attached = Arc::new(AtomicBool::new(true));
        let open = Arc::new(AtomicBool::new(false));
        let sink = EventSink {
            events,
            attached: attached.clone(),
        };
        let task = tokio::spawn(run(url, connect_timeout, sink, cmd_rx, open.clone()));
        Self {
            commands,
            attached,
            open,
            _task: AbortOnDropHandle::new(task),
        }
    }

    /// Queue a text frame. Returns false when the transport is not open.
    pub fn send_text(&self, text: String) -> bool {
        self.open.load(Ordering::SeqCst) && self.commands.send(Command::SendText(text)).is_ok()
    }

    /// Queue an out-of-band ping. Returns false when the transport is not
    /// open.
    pub fn send_ping(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.commands.send(Command::Ping).is_ok()
    }

    /// Detach event delivery and tear the connection down. Idempotent.
    pub fn close(&self) {
        self.attached.store(false, Ordering::SeqCst);
        let _ = self.commands.send(Command::Close);
    }
}

struct EventSink {
    events: mpsc::UnboundedSender<TransportEvent>,
    attached: Arc<AtomicBool>,
}

impl EventSink {
    fn emit(&self, event: TransportEvent) {
        if self.attached.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }
}

async fn run(
    url: Url,
    connect_timeout: Duration,
    sink: EventSink,
    mut commands: mpsc::UnboundedReceiver<Command>,
    open: Arc<AtomicBool>,
) {
    let ws = match timeout(connect_timeout, connect_async(url.as_str())).await {
        Err(_) => {
            sink.emit(TransportEvent::Error(format!(
                "connect deadline of {connect_timeout:?} elapsed"
            )));
            return;
        }
        Ok(Err(err)) => {
            sink.emit(TransportEvent::Error(err.to_string()));
            return;
        }
        Ok(Ok((ws, _response))) => ws,
    };
    open.store(true, Ordering::SeqCst);
    sink.emit(TransportEvent::Opened);

    let (mut tx, mut rx) = ws.split();
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::SendText(text)) => {
                    if let Err(err) = tx.send(Message::text(text)).await {
                        sink.emit(TransportEvent::Error(err.to_string()));
                        break;
                    }
                }
                Some(Command::Ping) => {
                    if let Err(err) = tx.send(Message::Ping(Bytes::new())).await {
                        sink.emit(TransportEvent::Error(err.to_string()));
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = tx.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => sink.emit(TransportEvent::Text(text.to_string())),
                Some(Ok(Message::Pong(_))) => sink.emit(TransportEvent::Pong),
                // Incoming pings are answered by the protocol layer.
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    sink.emit(TransportEvent::Closed {
                        code: frame.map(|f| u16::from(f.code)),
                    });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    sink.emit(TransportEvent::Error(err.to_string()));
                    break;
                }
                None => {
                    sink.emit(TransportEvent::Closed { code: None });
                    break;
                }
            },
        }
    }
    open.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod test {
    use tokio::net::TcpListener;

    use super::*;

    async fn ws_echo_server(listener: TcpListener) {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_text() && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connects_sends_and_receives() {
        bridge_utils::logging::setup_test();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(ws_echo_server(listener));

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let url: Url = format!("ws://{addr}/abc").parse().unwrap();
        let transport = Transport::open(url, Duration::from_secs(5), events_tx);

        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Opened
        ));
        assert!(transport.send_text("hello".into()));
        match events.recv().await.unwrap() {
            TransportEvent::Text(text) => assert_eq!(text, "hello"),
            other => panic!("expected echo, got {other:?}"),
        }

        assert!(transport.send_ping());
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Pong));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_detaches_before_teardown() {
        bridge_utils::logging::setup_test();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(ws_echo_server(listener));

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let url: Url = format!("ws://{addr}/abc").parse().unwrap();
        let transport = Transport::open(url, Duration::from_secs(5), events_tx);
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Opened
        ));

        transport.close();
        // No closed/error event may surface after an intentional close.
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_safe_while_still_connecting() {
        bridge_utils::logging::setup_test();

        // A listener that never accepts: the connection stays half-open.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let url: Url = format!("ws://{addr}/abc").parse().unwrap();
        let transport = Transport::open(url, Duration::from_secs(5), events_tx);
        transport.close();
        drop(transport);
        assert!(events.recv().await.is_none());
        drop(listener);
    }
}
