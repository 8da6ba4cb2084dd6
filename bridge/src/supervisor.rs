//! Per-Instance connection supervisor.
//!
//! One supervisor task per registered Instance. The supervisor exclusively
//! owns its transport and both of its timers (reconnect, pong deadline) and
//! reports connection-state changes and inbound variable updates to the
//! orchestrator over an event channel; it never touches the registry itself.
//! Events carry the supervisor's epoch so the orchestrator can discard
//! anything left over from a torn-down predecessor of the same Instance id.

use std::time::Duration;

use adit_types::ConnState;
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tokio_util::task::AbortOnDropHandle;
use url::Url;

use crate::{
    frames::{self, InboundFrame},
    transport::{Transport, TransportEvent},
};

/// Events a supervisor reports to the orchestrator.
#[derive(Debug)]
pub enum EngineEvent {
    /// The control transport changed state.
    Conn {
        id: String,
        epoch: u64,
        state: ConnState,
    },
    /// The Instance pushed a variable update over the transport.
    VariableUpdate {
        id: String,
        epoch: u64,
        variable_id: String,
        value: String,
    },
}

/// Commands the orchestrator sends a supervisor.
#[derive(Debug)]
pub enum SupervisorCmd {
    /// Heartbeat tick: verify the previous ping was answered and send the
    /// next one.
    Heartbeat,
    /// Queue a raw text frame; replies whether the transport accepted it.
    Send {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    /// The Manager relabelled the Instance's control endpoint. A live
    /// transport is left alone; the new endpoint is used from the next
    /// connection attempt on.
    UpdateEndpoint(Url),
    /// Close the transport without reconnecting and exit.
    Shutdown,
}

/// Timing knobs a supervisor needs.
#[derive(Clone, Copy, Debug)]
pub struct SupervisorTiming {
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub pong_timeout: Duration,
}

/// Handle owned by the registry entry. Dropping it aborts the task.
#[derive(Debug)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<SupervisorCmd>,
    _task: AbortOnDropHandle<()>,
}

impl SupervisorHandle {
    pub fn spawn(
        id: String,
        name: String,
        url: Url,
        timing: SupervisorTiming,
        epoch: u64,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let (commands, cmd_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            id,
            name,
            url,
            timing,
            epoch,
            events,
            cmd_rx,
            transport_tx,
            transport_events,
            transport: None,
            conn: ConnState::Disconnected,
            ever_connected: false,
            pending_pong: false,
            reconnect_at: None,
            pong_deadline: None,
        };
        Self {
            commands,
            _task: AbortOnDropHandle::new(tokio::spawn(supervisor.run())),
        }
    }

    pub fn heartbeat(&self) {
        let _ = self.commands.send(SupervisorCmd::Heartbeat);
    }

    /// Queue a frame for sending. The returned receiver resolves to whether
    /// the transport accepted it; a dead supervisor reads as not-sent.
    pub fn send(&self, text: String) -> oneshot::Receiver<bool> {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(SupervisorCmd::Send { text, reply });
        rx
    }

    pub fn update_endpoint(&self, url: Url) {
        let _ = self.commands.send(SupervisorCmd::UpdateEndpoint(url));
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(SupervisorCmd::Shutdown);
    }
}

struct Supervisor {
    id: String,
    name: String,
    url: Url,
    timing: SupervisorTiming,
    epoch: u64,
    events: mpsc::UnboundedSender<EngineEvent>,
    cmd_rx: mpsc::UnboundedReceiver<SupervisorCmd>,
    /// Cloned into every transport this supervisor opens. Holding one end
    /// here keeps `transport_events` from ever yielding `None`.
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    transport: Option<Transport>,
    conn: ConnState,
    ever_connected: bool,
    pending_pong: bool,
    reconnect_at: Option<Instant>,
    pong_deadline: Option<Instant>,
}

impl Supervisor {
    async fn run(mut self) {
        self.connect();
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SupervisorCmd::Heartbeat) => self.heartbeat(),
                    Some(SupervisorCmd::Send { text, reply }) => {
                        let sent = self.conn == ConnState::Connected
                            && self.transport.as_ref().is_some_and(|t| t.send_text(text));
                        let _ = reply.send(sent);
                    }
                    Some(SupervisorCmd::UpdateEndpoint(url)) => self.url = url,
                    Some(SupervisorCmd::Shutdown) | None => {
                        self.teardown();
                        return;
                    }
                },
                event = self.transport_events.recv() => {
                    if let Some(event) = event {
                        self.on_transport_event(event);
                    }
                },
                _ = sleep_until(self.reconnect_at.unwrap_or_else(Instant::now)),
                    if self.reconnect_at.is_some() =>
                {
                    self.reconnect_at = None;
                    self.connect();
                },
                _ = sleep_until(self.pong_deadline.unwrap_or_else(Instant::now)),
                    if self.pong_deadline.is_some() =>
                {
                    self.pong_deadline = None;
                    self.on_pong_deadline();
                },
            }
        }
    }

    fn connect(&mut self) {
        if self.conn != ConnState::Disconnected {
            return;
        }
        tracing::debug!(instance = %self.name, id = %self.id, url = %self.url, "opening control transport");
        self.transport = Some(Transport::open(
            self.url.clone(),
            self.timing.connect_timeout,
            self.transport_tx.clone(),
        ));
        self.set_conn(ConnState::Connecting);
    }

    fn set_conn(&mut self, state: ConnState) {
        if self.conn == state {
            return;
        }
        self.conn = state;
        let _ = self.events.send(EngineEvent::Conn {
            id: self.id.clone(),
            epoch: self.epoch,
            state,
        });
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.ever_connected {
                    tracing::info!(instance = %self.name, id = %self.id, "control transport reconnected");
                } else {
                    tracing::info!(instance = %self.name, id = %self.id, "control transport connected");
                }
                self.ever_connected = true;
                self.pending_pong = false;
                self.set_conn(ConnState::Connected);
            }
            TransportEvent::Text(text) => self.on_frame(&text),
            TransportEvent::Pong => {
                self.pending_pong = false;
                self.pong_deadline = None;
            }
            TransportEvent::Closed { code } => {
                if self.conn == ConnState::Connected {
                    tracing::warn!(instance = %self.name, id = %self.id, ?code, "control transport closed unexpectedly");
                } else {
                    tracing::debug!(instance = %self.name, id = %self.id, ?code, "control transport closed before opening");
                }
                self.lose_transport();
            }
            TransportEvent::Error(err) => {
                tracing::debug!(instance = %self.name, id = %self.id, %err, "control transport error");
                self.lose_transport();
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        match frames::parse(text) {
            Ok(InboundFrame::Variable { id, value }) => {
                let _ = self.events.send(EngineEvent::VariableUpdate {
                    id: self.id.clone(),
                    epoch: self.epoch,
                    variable_id: id,
                    value,
                });
            }
            Ok(InboundFrame::Unhandled { element }) => {
                tracing::debug!(instance = %self.name, %element, "ignoring unhandled control element");
            }
            Err(err) => {
                tracing::debug!(instance = %self.name, %err, "dropping undecodable control frame");
            }
        }
    }

    /// Common lost-transport handling: report unhealthy, arm the single
    /// pending reconnect.
    fn lose_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.pending_pong = false;
        self.pong_deadline = None;
        self.set_conn(ConnState::Disconnected);
        if self.reconnect_at.is_none() {
            self.reconnect_at = Some(Instant::now() + self.timing.reconnect_delay);
        }
    }

    fn heartbeat(&mut self) {
        if self.conn != ConnState::Connected {
            return;
        }
        if self.pending_pong {
            // The previous ping lived through a whole heartbeat interval
            // unanswered; the pong deadline would fire eventually, but the
            // verdict is already in.
            tracing::warn!(instance = %self.name, id = %self.id, "ping unanswered since last heartbeat; closing transport");
            self.lose_transport();
            return;
        }
        if self.transport.as_ref().is_some_and(|t| t.send_ping()) {
            self.pending_pong = true;
            self.pong_deadline = Some(Instant::now() + self.timing.pong_timeout);
        }
    }

    fn on_pong_deadline(&mut self) {
        if self.conn != ConnState::Connected {
            return;
        }
        tracing::warn!(
            instance = %self.name,
            id = %self.id,
            timeout = ?self.timing.pong_timeout,
            "pong deadline elapsed; closing transport",
        );
        self.lose_transport();
    }

    /// Intentional shutdown: detach and close without scheduling a
    /// reconnect and without reporting a state change (the orchestrator is
    /// deleting this record).
    fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.reconnect_at = None;
        self.pong_deadline = None;
    }
}
