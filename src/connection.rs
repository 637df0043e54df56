//! The connection driver.
//!
//! [`XmppConnection`] is the application's handle. Behind it a single task
//! owns the transport and the [`Negotiator`], and is the only writer to the
//! socket. The handle and the task share the stream manager and the
//! correlator; everything else travels over channels:
//!
//! - outbound stanzas: unbounded mpsc, in submission order
//! - disconnect requests: mpsc with a oneshot acknowledgement
//! - instant shutdown: broadcast, checked in every `select!`
//! - the externally visible state: watch
//!
//! Sequence numbers are assigned when a stanza is submitted, under the stream
//! manager lock, and the stanza is queued under that same lock. The socket
//! therefore sees stanzas in sequence order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ConnectionConfig, CLOSE_HANDSHAKE_TIMEOUT, NEGOTIATION_STEP_TIMEOUT, RESUMPTION_BACKOFF_BASE};
use crate::correlator::{Correlator, IqReplyFilter, PendingRequest, StanzaFilter};
use crate::error::{Error, NegotiationError, RequestError};
use crate::extensions::Ping;
use crate::negotiation::{Action, NegotiationSettings, Negotiator, StateId};
use crate::protocol::{self, Inbound, StreamFeatures, STREAM_END};
use crate::registry::CodecRegistry;
use crate::stanza::{next_stanza_id, Stanza};
use crate::stream_management::{SmSnapshot, StreamManager, Unacked};
use crate::transport::{Connector, TcpConnector, XmlTransport};

/// Target for raw XML traffic logs (`--verbose=xmpp`).
pub const TRAFFIC_TARGET: &str = "fluux_xmpp::traffic";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Something the application should know about.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Negotiation finished. `resumed` is set when a previous session was
    /// resumed rather than a new one bound.
    Connected { jid: Option<String>, resumed: bool },
    /// An inbound stanza nobody was waiting for.
    Stanza(Stanza),
    /// A stanza that was sent but will never be acknowledged. The application
    /// decides whether to send it again.
    StanzaLost(Unacked),
    /// The transport dropped and a resumption attempt is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// The connection is gone for good.
    Disconnected { error: Option<String> },
}

/// Point-in-time view of the session, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub conn_id: u64,
    pub state: StateId,
    pub jid: Option<String>,
    pub secure: bool,
    pub mechanism: Option<&'static str>,
    pub stream_id: Option<String>,
    pub features: StreamFeatures,
    pub stream_management: SmSnapshot,
    pub pending_requests: usize,
    pub resumptions: u32,
    pub failure: Option<String>,
}

#[derive(Debug, Default)]
struct SessionInfo {
    jid: Option<String>,
    secure: bool,
    mechanism: Option<&'static str>,
    stream_id: Option<String>,
    features: StreamFeatures,
    resumptions: u32,
    failure: Option<NegotiationError>,
}

/// A stanza waiting in the outbound queue.
#[derive(Debug)]
struct Outbound {
    xml: String,
    id: Option<String>,
    seq: Option<u32>,
    /// Stream management epoch at submission; stale entries were already
    /// reported lost.
    epoch: u64,
}

enum Control {
    Disconnect(oneshot::Sender<()>),
}

struct Shared {
    conn_id: u64,
    config: ConnectionConfig,
    registry: Arc<CodecRegistry>,
    correlator: Arc<Correlator>,
    sm: Mutex<StreamManager>,
    session: Mutex<SessionInfo>,
    state: watch::Sender<StateId>,
}

impl Shared {
    fn sm(&self) -> MutexGuard<'_, StreamManager> {
        self.sm.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> MutexGuard<'_, SessionInfo> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> StateId {
        *self.state.borrow()
    }

    /// Number the stanza and queue it for the driver.
    fn submit(&self, outbound: &mpsc::UnboundedSender<Outbound>, stanza: &Stanza) -> Result<Option<u32>, RequestError> {
        if matches!(self.state(), StateId::Closed | StateId::Failed | StateId::InstantShutdown) {
            return Err(RequestError::NotConnected);
        }
        let xml = stanza.to_xml();
        let id = stanza.id().map(str::to_string);
        let mut sm = self.sm();
        let seq = sm.on_send(id.as_deref(), &xml);
        let epoch = sm.epoch();
        outbound
            .send(Outbound { xml, id, seq, epoch })
            .map_err(|_| RequestError::NotConnected)?;
        Ok(seq)
    }
}

/// Handle to one XMPP client connection.
///
/// Dropping the handle shuts the connection down instantly.
pub struct XmppConnection {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    control: mpsc::UnboundedSender<Control>,
    shutdown: broadcast::Sender<()>,
}

impl XmppConnection {
    /// Resolve, connect and negotiate using the system resolver and TLS roots.
    pub async fn connect(config: ConnectionConfig) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), Error> {
        let connector = Arc::new(TcpConnector::new(config.insecure_tls));
        let (connection, events) = Self::new(config, connector)?;
        connection.wait_ready().await?;
        Ok((connection, events))
    }

    /// Start the driver task without waiting for negotiation to finish.
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), Error> {
        Self::with_registry(config, connector, Arc::new(CodecRegistry::with_defaults()))
    }

    pub fn with_registry(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<CodecRegistry>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), Error> {
        let settings = NegotiationSettings::from_config(&config)?;
        let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (state, _) = watch::channel(StateId::Disconnected);
        let shared = Arc::new(Shared {
            conn_id,
            config,
            registry,
            correlator: Correlator::new(),
            sm: Mutex::new(StreamManager::new()),
            session: Mutex::new(SessionInfo::default()),
            state,
        });

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            shared: shared.clone(),
            connector,
            negotiator: Negotiator::new(settings),
            outbound_tx: outbound_tx.clone(),
            outbound_rx,
            backlog: VecDeque::new(),
            early: Vec::new(),
            control_rx,
            shutdown_rx,
            events: events_tx,
            connected: false,
            ever_connected: false,
            attempts: 0,
            last_ack_request: Instant::now(),
            ack_deadline: None,
        };
        tokio::spawn(driver.run().instrument(info_span!("xmpp", conn_id)));

        Ok((
            Self {
                shared,
                outbound: outbound_tx,
                control: control_tx,
                shutdown: shutdown_tx,
            },
            events_rx,
        ))
    }

    pub fn conn_id(&self) -> u64 {
        self.shared.conn_id
    }

    pub fn state(&self) -> StateId {
        self.shared.state()
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.shared.registry
    }

    /// Wait until the session is established.
    ///
    /// Returns the negotiation failure if the connection ends first.
    pub async fn wait_ready(&self) -> Result<(), Error> {
        let mut state = self.shared.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                StateId::Connected => return Ok(()),
                StateId::Failed => {
                    let failure = self.shared.session().failure.clone();
                    return Err(failure
                        .unwrap_or_else(|| NegotiationError::Transport("connection failed".to_string()))
                        .into());
                }
                StateId::Closed | StateId::InstantShutdown => return Err(NegotiationError::Shutdown.into()),
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(NegotiationError::Shutdown.into());
            }
        }
    }

    /// Queue a stanza. Returns its stream management sequence number when
    /// acknowledgements are enabled.
    ///
    /// Stanzas submitted while negotiating or resuming are held and written
    /// once the session is up.
    pub fn send(&self, stanza: &Stanza) -> Result<Option<u32>, RequestError> {
        self.shared.submit(&self.outbound, stanza)
    }

    /// Send an IQ request and wait for its `result`. An `error` reply is
    /// returned as [`RequestError::StanzaError`].
    pub async fn send_iq(&self, mut request: Stanza) -> Result<Stanza, RequestError> {
        if request.id().is_none() {
            request.set_attr("id", next_stanza_id());
        }
        let pending = self.create_pending(IqReplyFilter::for_request(&request), self.shared.config.reply_timeout);
        if let Err(e) = self.send(&request) {
            self.shared.correlator.cancel(pending);
            return Err(e);
        }
        let reply = self.wait(pending).await?;
        match reply.error_condition() {
            Some(condition) => Err(RequestError::StanzaError { condition }),
            None if reply.stanza_type() == Some("error") => Err(RequestError::StanzaError {
                condition: "undefined-condition".to_string(),
            }),
            None => Ok(reply),
        }
    }

    /// Register interest in an inbound stanza before sending whatever
    /// provokes it.
    pub fn create_pending(&self, filter: impl StanzaFilter + 'static, timeout: Duration) -> PendingRequest {
        self.shared.correlator.create_pending(filter, timeout)
    }

    pub async fn wait(&self, pending: PendingRequest) -> Result<Stanza, RequestError> {
        self.shared.correlator.wait(pending).await
    }

    pub fn session(&self) -> SessionSnapshot {
        let stream_management = self.shared.sm().snapshot();
        let session = self.shared.session();
        SessionSnapshot {
            conn_id: self.shared.conn_id,
            state: self.shared.state(),
            jid: session.jid.clone(),
            secure: session.secure,
            mechanism: session.mechanism,
            stream_id: session.stream_id.clone(),
            features: session.features.clone(),
            stream_management,
            pending_requests: self.shared.correlator.pending_count(),
            resumptions: session.resumptions,
            failure: session.failure.as_ref().map(ToString::to_string),
        }
    }

    /// Close the stream cleanly: flush queued stanzas, send
    /// `</stream:stream>` and wait briefly for the server's.
    pub async fn disconnect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control.send(Control::Disconnect(ack_tx)).is_err() {
            return;
        }
        // The driver bounds the close handshake itself; an error means it is already gone.
        let _ = ack_rx.await;
    }

    /// Tear everything down now. Pending requests fail immediately and
    /// nothing further is sent.
    pub fn instant_shutdown(&self) {
        info!(conn_id = self.shared.conn_id, "Instant shutdown requested");
        self.shared.correlator.close("instant shutdown");
        let _ = self.shutdown.send(());
    }
}

impl Drop for XmppConnection {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Why a transport session ended.
enum SessionEnd {
    Closed(Option<oneshot::Sender<()>>),
    Shutdown,
    Failed(NegotiationError),
    /// Dropped in a way that resumption may recover from.
    TransportLost(String),
}

struct Driver {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    negotiator: Negotiator,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    /// Stanzas drained from the queue when stream management came up; they
    /// go out before anything still in the channel.
    backlog: VecDeque<Outbound>,
    /// Stanzas that arrived while negotiating; delivered once connected.
    early: Vec<Stanza>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    shutdown_rx: broadcast::Receiver<()>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    connected: bool,
    ever_connected: bool,
    attempts: u32,
    last_ack_request: Instant,
    ack_deadline: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        let conn_id = self.shared.conn_id;
        let mut target = self.shared.config.server.clone();

        let end = loop {
            let reason = match self.run_transport(target.as_deref()).await {
                SessionEnd::TransportLost(reason) => reason,
                end => break end,
            };
            self.connected = false;
            self.ack_deadline = None;

            let lost = self.shared.sm().on_transport_lost();
            self.report_lost(lost);
            let location = self
                .shared
                .sm()
                .resumption()
                .map(|(_, location)| location.map(str::to_string));
            let Some(location) = location else {
                break SessionEnd::Failed(NegotiationError::Transport(reason));
            };

            self.attempts += 1;
            if self.attempts > self.shared.config.resumption_attempts {
                warn!(conn_id, attempts = self.attempts - 1, "Giving up on resumption");
                break SessionEnd::Failed(NegotiationError::Transport(reason));
            }
            let delay = RESUMPTION_BACKOFF_BASE * 2u32.saturating_pow(self.attempts - 1);
            warn!(conn_id, reason = %reason, attempt = self.attempts, delay_ms = delay.as_millis() as u64,
                "Connection lost, will try to resume");
            self.publish(StateId::Disconnected);
            let _ = self.events.send(ConnectionEvent::Reconnecting {
                attempt: self.attempts,
                delay,
            });

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown_rx.recv() => break SessionEnd::Shutdown,
                control = self.control_rx.recv() => break SessionEnd::Closed(control.map(Control::into_ack)),
            }
            if location.is_some() {
                target = location;
            }
        };

        self.finish(end);
    }

    /// Connect, negotiate and pump one transport until it ends.
    async fn run_transport(&mut self, target: Option<&str>) -> SessionEnd {
        let conn_id = self.shared.conn_id;
        let domain = self.negotiator.domain().to_string();
        let connector = self.connector.clone();

        info!(conn_id, domain = %domain, server = ?target, "Connecting");
        let mut transport = tokio::select! {
            result = connector.connect(&domain, target) => match result {
                Ok(transport) => transport,
                Err(e) => {
                    error!(conn_id, error = %e, "Connect failed");
                    return self.transport_failure(e.to_string());
                }
            },
            _ = self.shutdown_rx.recv() => return SessionEnd::Shutdown,
            control = self.control_rx.recv() => return SessionEnd::Closed(control.map(Control::into_ack)),
        };

        let secure = transport.is_secure();
        let can_start_tls = transport.can_start_tls();
        debug!(conn_id, secure, can_start_tls, "Transport open, negotiating");
        let actions = {
            let mut sm = self.shared.sm();
            self.negotiator.start(secure, can_start_tls, &mut sm)
        };
        self.publish_negotiation();
        if let Err(end) = self.execute(actions, transport.as_mut()).await {
            return end;
        }

        let mut step_deadline = Instant::now() + NEGOTIATION_STEP_TIMEOUT;
        loop {
            if self.connected {
                while let Some(outbound) = self.backlog.pop_front() {
                    if let Err(end) = self.write_outbound(outbound, transport.as_mut()).await {
                        return end;
                    }
                }
            }
            let deadline = self.timer_deadline(step_deadline);

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    let mut sm = self.shared.sm();
                    self.negotiator.instant_shutdown(&mut sm);
                    drop(sm);
                    // Best effort only; nobody waits for it.
                    tokio::spawn(async move {
                        let _ = transport.close().await;
                    });
                    return SessionEnd::Shutdown;
                }
                Some(control) = self.control_rx.recv() => {
                    self.close_gracefully(transport).await;
                    return SessionEnd::Closed(Some(control.into_ack()));
                }
                element = transport.next_element() => {
                    let raw = match element {
                        Ok(Some(raw)) => raw,
                        Ok(None) => return self.lost(transport, "connection closed by peer".to_string()).await,
                        Err(e) => return self.lost(transport, e.to_string()).await,
                    };
                    step_deadline = Instant::now() + NEGOTIATION_STEP_TIMEOUT;
                    if let Err(end) = self.on_element(&raw, transport.as_mut()).await {
                        let _ = transport.close().await;
                        return end;
                    }
                }
                Some(outbound) = self.outbound_rx.recv(), if self.connected => {
                    if let Err(end) = self.write_outbound(outbound, transport.as_mut()).await {
                        return end;
                    }
                }
                _ = sleep_until(deadline) => {
                    if let Err(end) = self.on_timer(transport.as_mut(), step_deadline).await {
                        let _ = transport.close().await;
                        return end;
                    }
                }
            }
        }
    }

    async fn on_element(&mut self, raw: &str, transport: &mut dyn XmlTransport) -> Result<(), SessionEnd> {
        let conn_id = self.shared.conn_id;
        debug!(target: TRAFFIC_TARGET, conn_id, xml = %raw, "RECV");
        let inbound = match protocol::classify(raw, &self.shared.registry) {
            Ok(inbound) => inbound,
            Err(e) if self.connected => {
                warn!(conn_id, error = %e, "Dropping undecodable element");
                return Ok(());
            }
            Err(e) => return Err(SessionEnd::Failed(NegotiationError::Violation(e.to_string()))),
        };

        if self.connected {
            return self.on_session_element(inbound, transport).await;
        }

        let (actions, unused) = {
            let mut sm = self.shared.sm();
            let visited = self.negotiator.history().len();
            let actions = self.negotiator.handle(&inbound, &mut sm);
            if self.negotiator.state() == StateId::Connected {
                // Anything queued while negotiating is numbered now, before any
                // concurrent submission can take a lower sequence number.
                adopt_backlog(&mut sm, &mut self.outbound_rx, &mut self.backlog);
            }
            (actions, self.negotiator.history().len() == visited)
        };
        self.publish_negotiation();
        if unused {
            self.on_early_element(inbound, transport).await?;
        }
        self.execute(actions, transport).await?;

        if self.connected && !self.early.is_empty() {
            let early = std::mem::take(&mut self.early);
            debug!(conn_id, count = early.len(), "Delivering stanzas received while negotiating");
            for stanza in early {
                self.dispatch(stanza);
            }
        }
        Ok(())
    }

    /// Session traffic that shows up before negotiation has finished.
    async fn on_early_element(&mut self, inbound: Inbound, transport: &mut dyn XmlTransport) -> Result<(), SessionEnd> {
        let conn_id = self.shared.conn_id;
        match inbound {
            Inbound::Stanza(stanza) => {
                self.shared.sm().on_inbound_stanza();
                debug!(conn_id, kind = stanza.kind().as_str(), id = ?stanza.id(), "Holding stanza until connected");
                self.early.push(stanza);
            }
            Inbound::SmRequest => {
                let ack = {
                    let sm = self.shared.sm();
                    if sm.is_active() {
                        Some(sm.ack_response())
                    } else {
                        None
                    }
                };
                if let Some(ack) = ack {
                    self.write(transport, &ack).await?;
                }
            }
            Inbound::SmAck(h) => {
                let mut sm = self.shared.sm();
                if sm.is_active() {
                    sm.on_ack(h);
                }
            }
            other => debug!(conn_id, element = other.label(), "Ignoring element during negotiation"),
        }
        Ok(())
    }

    /// Hand an inbound stanza to its consumer: a pending request, the automatic
    /// IQ responder, or the application.
    fn dispatch(&self, stanza: Stanza) {
        if self.shared.correlator.offer(&stanza) {
            return;
        }
        if stanza.is_iq_request() {
            let reply = if stanza.find::<Ping>().is_some() {
                stanza.make_result()
            } else {
                stanza.make_error("cancel", "service-unavailable")
            };
            if self.shared.submit(&self.outbound_tx, &reply).is_err() {
                debug!("Could not queue automatic IQ reply");
            }
            return;
        }
        let _ = self.events.send(ConnectionEvent::Stanza(stanza));
    }

    /// Inbound traffic once the session is established.
    async fn on_session_element(&mut self, inbound: Inbound, transport: &mut dyn XmlTransport) -> Result<(), SessionEnd> {
        match inbound {
            Inbound::Stanza(stanza) => {
                self.shared.sm().on_inbound_stanza();
                self.dispatch(stanza);
            }
            Inbound::SmRequest => {
                let ack = self.shared.sm().ack_response();
                self.write(transport, &ack).await?;
            }
            Inbound::SmAck(h) => {
                let removed = self.shared.sm().on_ack(h);
                debug!(h, removed, "Acknowledgement received");
                self.ack_deadline = None;
            }
            Inbound::StreamError { condition, text } => {
                error!(condition = %condition, text = ?text, "Stream error");
                return Err(SessionEnd::Failed(NegotiationError::StreamError { condition, text }));
            }
            Inbound::StreamEnd => {
                let _ = transport.send(STREAM_END).await;
                return Err(self.transport_failure("stream closed by server".to_string()));
            }
            other => debug!(element = other.label(), "Ignoring element on established stream"),
        }
        Ok(())
    }

    /// Carry out what the negotiator asked for, in order.
    async fn execute(&mut self, actions: Vec<Action>, transport: &mut dyn XmlTransport) -> Result<(), SessionEnd> {
        let conn_id = self.shared.conn_id;
        for action in actions {
            match action {
                Action::Send(xml) => self.write(transport, &xml).await?,
                Action::UpgradeTls => {
                    let domain = self.negotiator.domain().to_string();
                    transport.start_tls(&domain).await.map_err(|e| {
                        error!(conn_id, error = %e, "TLS upgrade failed");
                        SessionEnd::Failed(NegotiationError::Transport(e.to_string()))
                    })?;
                    info!(conn_id, "Stream upgraded to TLS");
                }
                Action::Replay(entries) => {
                    info!(conn_id, count = entries.len(), "Replaying unacknowledged stanzas");
                    for entry in entries {
                        self.write(transport, &entry.xml).await?;
                    }
                }
                Action::StanzasLost(entries) => self.report_lost(entries),
                Action::Connected { jid, resumed } => {
                    info!(conn_id, jid = ?jid, resumed, "Session established");
                    self.connected = true;
                    self.ever_connected = true;
                    self.attempts = 0;
                    self.last_ack_request = Instant::now();
                    self.ack_deadline = None;
                    if resumed {
                        self.shared.session().resumptions += 1;
                    }
                    let _ = self.events.send(ConnectionEvent::Connected { jid, resumed });
                }
                Action::Failed(error) => return Err(SessionEnd::Failed(error)),
            }
        }
        Ok(())
    }

    async fn write_outbound(&mut self, outbound: Outbound, transport: &mut dyn XmlTransport) -> Result<(), SessionEnd> {
        let conn_id = self.shared.conn_id;
        if let Some(seq) = outbound.seq {
            let mut sm = self.shared.sm();
            if outbound.epoch != sm.epoch() {
                debug!(conn_id, seq, id = ?outbound.id, "Skipping stanza from a discarded session");
                return Ok(());
            }
            sm.mark_transmitted(seq);
        }
        debug!(target: TRAFFIC_TARGET, conn_id, seq = ?outbound.seq, xml = %outbound.xml, "SEND");
        transport
            .send(&outbound.xml)
            .await
            .map_err(|e| self.transport_failure(format!("write failed: {}", e)))?;

        let unacked = self.shared.sm().unacked_len();
        if outbound.seq.is_some()
            && self.ack_deadline.is_none()
            && unacked >= self.shared.config.ack_request_threshold
        {
            self.request_ack(transport).await?;
        }
        Ok(())
    }

    async fn write(&self, transport: &mut dyn XmlTransport, xml: &str) -> Result<(), SessionEnd> {
        debug!(target: TRAFFIC_TARGET, conn_id = self.shared.conn_id, xml = %xml, "SEND");
        transport
            .send(xml)
            .await
            .map_err(|e| self.transport_failure(format!("write failed: {}", e)))
    }

    async fn request_ack(&mut self, transport: &mut dyn XmlTransport) -> Result<(), SessionEnd> {
        self.write(transport, &protocol::sm_request()).await?;
        let now = Instant::now();
        self.last_ack_request = now;
        self.ack_deadline = Some(now + self.shared.config.ack_timeout);
        Ok(())
    }

    fn timer_deadline(&self, step_deadline: Instant) -> Instant {
        if !self.connected {
            return step_deadline;
        }
        if let Some(deadline) = self.ack_deadline {
            return deadline;
        }
        if self.shared.sm().is_active() {
            return self.last_ack_request + self.shared.config.ack_request_interval;
        }
        Instant::now() + Duration::from_secs(3600)
    }

    async fn on_timer(&mut self, transport: &mut dyn XmlTransport, step_deadline: Instant) -> Result<(), SessionEnd> {
        let now = Instant::now();
        if !self.connected {
            if now >= step_deadline {
                warn!(conn_id = self.shared.conn_id, state = ?self.negotiator.state(), "Negotiation step timed out");
                return Err(self.transport_failure("negotiation step timed out".to_string()));
            }
            return Ok(());
        }
        if let Some(deadline) = self.ack_deadline {
            if now >= deadline {
                warn!(conn_id = self.shared.conn_id, "No acknowledgement from server, treating stream as dead");
                return Err(self.transport_failure("acknowledgement timed out".to_string()));
            }
            return Ok(());
        }
        if now >= self.last_ack_request + self.shared.config.ack_request_interval {
            if self.shared.sm().unacked_len() > 0 {
                return self.request_ack(transport).await;
            }
            self.last_ack_request = now;
        }
        Ok(())
    }

    /// The transport dropped under us.
    async fn lost(&mut self, mut transport: Box<dyn XmlTransport>, reason: String) -> SessionEnd {
        warn!(conn_id = self.shared.conn_id, reason = %reason, connected = self.connected, "Transport lost");
        if !self.connected {
            let mut sm = self.shared.sm();
            self.negotiator.transport_lost(&mut sm);
        }
        let _ = transport.close().await;
        self.transport_failure(reason)
    }

    /// A transport-level failure is recoverable only while a resumable
    /// session from an earlier connect exists.
    fn transport_failure(&self, reason: String) -> SessionEnd {
        if self.ever_connected && self.shared.sm().resumption().is_some() {
            SessionEnd::TransportLost(reason)
        } else {
            SessionEnd::Failed(NegotiationError::Transport(reason))
        }
    }

    async fn close_gracefully(&mut self, mut transport: Box<dyn XmlTransport>) {
        let conn_id = self.shared.conn_id;
        if self.connected {
            while let Ok(outbound) = self.outbound_rx.try_recv() {
                self.backlog.push_back(outbound);
            }
            while let Some(outbound) = self.backlog.pop_front() {
                if self.write_outbound(outbound, transport.as_mut()).await.is_err() {
                    break;
                }
            }
        }
        {
            let mut sm = self.shared.sm();
            self.negotiator.close(&mut sm);
        }

        if transport.send(STREAM_END).await.is_ok() {
            let handshake = timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
                loop {
                    match transport.next_element().await {
                        Ok(Some(raw)) if raw.trim() == STREAM_END => return true,
                        Ok(Some(_)) => continue,
                        _ => return false,
                    }
                }
            })
            .await;
            debug!(conn_id, clean = matches!(handshake, Ok(true)), "Close handshake finished");
        }
        let _ = transport.close().await;
    }

    fn report_lost(&self, entries: Vec<Unacked>) {
        if entries.is_empty() {
            return;
        }
        warn!(conn_id = self.shared.conn_id, count = entries.len(), "Stanzas lost");
        for entry in entries {
            let _ = self.events.send(ConnectionEvent::StanzaLost(entry));
        }
    }

    /// Mirror the negotiator into the shared session info. Terminal failure
    /// states are published by `finish` once the outcome is final.
    fn publish_negotiation(&self) {
        {
            let mut session = self.shared.session();
            session.jid = self.negotiator.jid().map(str::to_string);
            session.secure = self.negotiator.is_secure();
            session.mechanism = self.negotiator.mechanism();
            session.stream_id = self.negotiator.stream_id().map(str::to_string);
            session.features = self.negotiator.features().clone();
        }
        let state = self.negotiator.state();
        if !matches!(state, StateId::Failed | StateId::Closed | StateId::InstantShutdown) {
            self.publish(state);
        }
    }

    fn publish(&self, state: StateId) {
        self.shared.state.send_replace(state);
    }

    fn finish(&mut self, end: SessionEnd) {
        let (state, error, ack) = match end {
            SessionEnd::Closed(ack) => (StateId::Closed, None, ack),
            SessionEnd::Shutdown => (StateId::InstantShutdown, None, None),
            SessionEnd::Failed(error) => (StateId::Failed, Some(error), None),
            SessionEnd::TransportLost(reason) => (StateId::Failed, Some(NegotiationError::Transport(reason)), None),
        };
        self.connected = false;
        if !self.early.is_empty() {
            warn!(conn_id = self.shared.conn_id, count = self.early.len(), "Dropping stanzas received before the session was up");
            self.early.clear();
        }

        let lost = self.shared.sm().reset();
        self.report_lost(lost);

        let reason = error.as_ref().map_or_else(|| "connection closed".to_string(), ToString::to_string);
        self.shared.correlator.close(&reason);
        self.shared.session().failure = error.clone();
        self.publish(state);

        match &error {
            Some(error) => error!(conn_id = self.shared.conn_id, error = %error, "Connection failed"),
            None => info!(conn_id = self.shared.conn_id, state = ?state, "Connection ended"),
        }
        let _ = self.events.send(ConnectionEvent::Disconnected {
            error: error.map(|e| e.to_string()),
        });
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}

impl Control {
    fn into_ack(self) -> oneshot::Sender<()> {
        match self {
            Control::Disconnect(ack) => ack,
        }
    }
}

/// Number everything queued before stream management came up, in queue order.
fn adopt_backlog(
    sm: &mut StreamManager,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    backlog: &mut VecDeque<Outbound>,
) {
    while let Ok(mut outbound) = rx.try_recv() {
        if outbound.seq.is_none() {
            outbound.seq = sm.on_send(outbound.id.as_deref(), &outbound.xml);
            outbound.epoch = sm.epoch();
        }
        backlog.push_back(outbound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityMode;
    use crate::error::TransportError;
    use crate::transport::StreamTransport;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='capulet.lit' id='s-1' version='1.0'>";
    const PLAIN_ONLY: &str = "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>";
    const BIND_AND_SM: &str = "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/><sm xmlns='urn:xmpp:sm:3'/></stream:features>";
    const BIND_ONLY: &str = "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>";
    const SUCCESS: &str = "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>";
    const ENABLED: &str = "<enabled xmlns='urn:xmpp:sm:3' id='sm-1' resume='true' location='resume.capulet.lit:5222'/>";

    /// Hands out pre-made in-memory streams and records where it was asked to connect.
    #[derive(Default)]
    struct TestConnector {
        streams: Mutex<VecDeque<DuplexStream>>,
        targets: Mutex<Vec<Option<String>>>,
    }

    impl TestConnector {
        fn with_streams(count: usize) -> (Arc<Self>, Vec<FakeServer>) {
            let connector = Arc::new(Self::default());
            let mut servers = Vec::new();
            for _ in 0..count {
                let (client, server) = tokio::io::duplex(64 * 1024);
                connector.streams.lock().unwrap().push_back(client);
                servers.push(FakeServer {
                    transport: StreamTransport::new(Box::new(server), true, false),
                });
            }
            (connector, servers)
        }

        fn targets(&self) -> Vec<Option<String>> {
            self.targets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for TestConnector {
        async fn connect(
            &self,
            _domain: &str,
            server: Option<&str>,
        ) -> Result<Box<dyn XmlTransport>, TransportError> {
            self.targets.lock().unwrap().push(server.map(str::to_string));
            let stream = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Dns("no more test streams".to_string()))?;
            Ok(Box::new(StreamTransport::new(Box::new(stream), true, false)))
        }
    }

    /// The server side of one in-memory connection.
    struct FakeServer {
        transport: StreamTransport,
    }

    impl FakeServer {
        async fn recv(&mut self) -> String {
            timeout(Duration::from_secs(5), self.transport.next_element())
                .await
                .expect("timed out waiting for the client")
                .unwrap()
                .expect("client closed the connection")
        }

        async fn expect(&mut self, fragment: &str) -> String {
            let element = self.recv().await;
            assert!(element.contains(fragment), "expected {:?} in {:?}", fragment, element);
            element
        }

        async fn send(&mut self, xml: &str) {
            self.transport.send(xml).await.unwrap();
        }

        /// PLAIN login up to the bind result. Returns after the client's
        /// next element (enable or nothing) is due.
        async fn authenticate_and_bind(&mut self, features: &str) {
            self.expect("<stream:stream").await;
            self.send(HEADER).await;
            self.send(PLAIN_ONLY).await;
            self.expect("mechanism='PLAIN'").await;
            self.send(SUCCESS).await;
            self.expect("<stream:stream").await;
            self.send(HEADER).await;
            self.send(features).await;
            let bind = self.expect("urn:ietf:params:xml:ns:xmpp-bind").await;
            let id = attr(&bind, "id").unwrap();
            self.send(&format!(
                "<iq xmlns='jabber:client' type='result' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>juliet@capulet.lit/balcony</jid></bind></iq>",
                id
            ))
            .await;
        }

        async fn login_with_sm(&mut self) {
            self.authenticate_and_bind(BIND_AND_SM).await;
            self.expect("<enable xmlns='urn:xmpp:sm:3' resume='true'/>").await;
            self.send(ENABLED).await;
        }
    }

    fn attr(xml: &str, name: &str) -> Option<String> {
        let needle = format!(" {}='", name);
        let start = xml.find(&needle)? + needle.len();
        let end = xml[start..].find('\'')? + start;
        Some(xml[start..end].to_string())
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("juliet@capulet.lit", "r0m30")
            .with_resource("balcony")
            .with_security(SecurityMode::Required)
            .with_reply_timeout(Duration::from_secs(2))
            .with_ack_policy(100, Duration::from_secs(60), Duration::from_secs(30))
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    async fn connected(config: ConnectionConfig) -> (XmppConnection, mpsc::UnboundedReceiver<ConnectionEvent>, FakeServer) {
        let (connector, mut servers) = TestConnector::with_streams(1);
        let (connection, mut events) = XmppConnection::new(config, connector).unwrap();
        let mut server = servers.remove(0);
        server.login_with_sm().await;
        connection.wait_ready().await.unwrap();
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connected { resumed: false, .. }));
        (connection, events, server)
    }

    #[tokio::test]
    async fn test_login_with_stream_management() {
        let (connection, _events, _server) = connected(config()).await;
        assert_eq!(connection.state(), StateId::Connected);

        let session = connection.session();
        assert_eq!(session.jid.as_deref(), Some("juliet@capulet.lit/balcony"));
        assert_eq!(session.mechanism, Some("PLAIN"));
        assert_eq!(session.stream_management.session_id.as_deref(), Some("sm-1"));
        assert!(session.secure);
    }

    #[tokio::test]
    async fn test_send_iq_round_trip() {
        let (connection, _events, mut server) = connected(config()).await;
        let connection = Arc::new(connection);

        let request = Stanza::iq("get").with_attr("to", "capulet.lit");
        let id = request.id().unwrap().to_string();
        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send_iq(request).await })
        };

        let sent = server.expect(&format!("id='{}'", id)).await;
        assert!(sent.starts_with("<iq"));
        server
            .send(&format!("<iq xmlns='jabber:client' type='result' id='{}' from='capulet.lit'/>", id))
            .await;
        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply.stanza_type(), Some("result"));
        assert_eq!(connection.session().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_iq_error_reply_is_an_error() {
        let (connection, _events, mut server) = connected(config()).await;
        let connection = Arc::new(connection);
        let request = Stanza::iq("get").with_attr("to", "capulet.lit");
        let id = request.id().unwrap().to_string();
        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send_iq(request).await })
        };
        server.expect(&id).await;
        server
            .send(&format!(
                "<iq xmlns='jabber:client' type='error' id='{}' from='capulet.lit'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
                id
            ))
            .await;
        assert_eq!(
            task.await.unwrap().unwrap_err(),
            RequestError::StanzaError {
                condition: "item-not-found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_ping_and_unknown_iq_are_answered() {
        let (_connection, mut events, mut server) = connected(config()).await;

        server
            .send("<iq xmlns='jabber:client' type='get' id='p1' from='capulet.lit'><ping xmlns='urn:xmpp:ping'/></iq>")
            .await;
        let reply = server.expect("id='p1'").await;
        assert!(reply.contains("type='result'"));

        server
            .send("<iq xmlns='jabber:client' type='get' id='v1' from='capulet.lit'><query xmlns='jabber:iq:version'/></iq>")
            .await;
        let reply = server.expect("id='v1'").await;
        assert!(reply.contains("type='error'"));
        assert!(reply.contains("service-unavailable"));

        server
            .send("<message xmlns='jabber:client' from='romeo@montague.lit'><body>hi</body></message>")
            .await;
        match next_event(&mut events).await {
            ConnectionEvent::Stanza(stanza) => assert_eq!(stanza.body().as_deref(), Some("hi")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ack_request_is_answered_with_inbound_count() {
        let (_connection, _events, mut server) = connected(config()).await;
        server.send("<message xmlns='jabber:client'><body>1</body></message>").await;
        server.send("<message xmlns='jabber:client'><body>2</body></message>").await;
        server.send("<r xmlns='urn:xmpp:sm:3'/>").await;
        server.expect("<a xmlns='urn:xmpp:sm:3' h='2'/>").await;
    }

    #[tokio::test]
    async fn test_ack_requested_at_threshold() {
        let (connection, _events, mut server) =
            connected(config().with_ack_policy(2, Duration::from_secs(60), Duration::from_secs(30))).await;
        assert_eq!(connection.send(&Stanza::message("romeo@montague.lit", "1")).unwrap(), Some(1));
        assert_eq!(connection.send(&Stanza::message("romeo@montague.lit", "2")).unwrap(), Some(2));
        server.expect("<body>1</body>").await;
        server.expect("<body>2</body>").await;
        server.expect("<r xmlns='urn:xmpp:sm:3'/>").await;
        server.send("<a xmlns='urn:xmpp:sm:3' h='2'/>").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connection.session().stream_management.unacked, 0);
    }

    #[tokio::test]
    async fn test_disconnect_closes_cleanly() {
        let (connection, mut events, mut server) = connected(config()).await;
        connection.send(&Stanza::presence()).unwrap();

        let closing = tokio::spawn(async move {
            server.expect("<presence").await;
            server.expect(STREAM_END).await;
            server.send(STREAM_END).await;
        });
        connection.disconnect().await;
        closing.await.unwrap();

        assert_eq!(connection.state(), StateId::Closed);
        assert_eq!(connection.send(&Stanza::presence()), Err(RequestError::NotConnected));
        loop {
            match next_event(&mut events).await {
                ConnectionEvent::Disconnected { error } => {
                    assert_eq!(error, None);
                    break;
                }
                ConnectionEvent::StanzaLost(_) => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_resumption_replays_unacked_stanzas_once() {
        let (connector, mut servers) = TestConnector::with_streams(2);
        let (connection, mut events) = XmppConnection::new(config(), connector.clone()).unwrap();
        let mut second = servers.pop().unwrap();
        let mut first = servers.pop().unwrap();

        first.login_with_sm().await;
        connection.wait_ready().await.unwrap();
        next_event(&mut events).await;

        for body in ["m1", "m2", "m3"] {
            connection.send(&Stanza::message("romeo@montague.lit", body)).unwrap();
        }
        first.expect("<body>m1</body>").await;
        first.expect("<body>m2</body>").await;
        first.expect("<body>m3</body>").await;
        drop(first);

        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Reconnecting { attempt: 1, .. }));

        second.expect("<stream:stream").await;
        second.send(HEADER).await;
        second.send(PLAIN_ONLY).await;
        second.expect("mechanism='PLAIN'").await;
        second.send(SUCCESS).await;
        second.expect("<stream:stream").await;
        second.send(HEADER).await;
        second.send(BIND_AND_SM).await;
        second.expect("<resume xmlns='urn:xmpp:sm:3' previd='sm-1' h='0'/>").await;
        second.send("<resumed xmlns='urn:xmpp:sm:3' previd='sm-1' h='1'/>").await;

        second.expect("<body>m2</body>").await;
        second.expect("<body>m3</body>").await;
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Connected { resumed: true, .. }
        ));

        // Only m2 and m3 were replayed; the next stanza follows them directly.
        assert_eq!(connection.send(&Stanza::message("romeo@montague.lit", "m4")).unwrap(), Some(4));
        second.expect("<body>m4</body>").await;

        assert_eq!(
            connector.targets(),
            vec![None, Some("resume.capulet.lit:5222".to_string())]
        );
        assert_eq!(connection.session().resumptions, 1);
    }

    #[tokio::test]
    async fn test_rejected_resumption_reports_lost_stanzas() {
        let (connector, mut servers) = TestConnector::with_streams(2);
        let (connection, mut events) = XmppConnection::new(config(), connector).unwrap();
        let mut second = servers.pop().unwrap();
        let mut first = servers.pop().unwrap();

        first.login_with_sm().await;
        connection.wait_ready().await.unwrap();
        next_event(&mut events).await;
        for body in ["m1", "m2", "m3"] {
            connection.send(&Stanza::message("romeo@montague.lit", body)).unwrap();
        }
        first.expect("<body>m3</body>").await;
        drop(first);

        second.expect("<stream:stream").await;
        second.send(HEADER).await;
        second.send(PLAIN_ONLY).await;
        second.expect("mechanism='PLAIN'").await;
        second.send(SUCCESS).await;
        second.expect("<stream:stream").await;
        second.send(HEADER).await;
        second.send(BIND_AND_SM).await;
        second.expect("<resume").await;
        second
            .send("<failed xmlns='urn:xmpp:sm:3'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></failed>")
            .await;
        second.expect("urn:ietf:params:xml:ns:xmpp-bind").await;

        let mut lost = Vec::new();
        loop {
            match next_event(&mut events).await {
                ConnectionEvent::StanzaLost(entry) => lost.push(entry.seq),
                ConnectionEvent::Reconnecting { .. } => continue,
                other => panic!("unexpected event {:?}", other),
            }
            if lost.len() == 3 {
                break;
            }
        }
        assert_eq!(lost, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_authentication_failure_fails_wait_ready() {
        let (connector, mut servers) = TestConnector::with_streams(1);
        let (connection, mut events) = XmppConnection::new(config(), connector).unwrap();
        let mut server = servers.remove(0);

        server.expect("<stream:stream").await;
        server.send(HEADER).await;
        server.send(PLAIN_ONLY).await;
        server.expect("mechanism='PLAIN'").await;
        server
            .send("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>")
            .await;

        let error = connection.wait_ready().await.unwrap_err();
        assert!(error.to_string().contains("not-authorized"), "{}", error);
        assert_eq!(connection.state(), StateId::Failed);
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected { error: Some(_) }
        ));
    }

    #[tokio::test]
    async fn test_stanza_during_negotiation_is_delivered_after_connect() {
        let (connector, mut servers) = TestConnector::with_streams(1);
        let (connection, mut events) = XmppConnection::new(config(), connector).unwrap();
        let mut server = servers.remove(0);

        server.expect("<stream:stream").await;
        server.send(HEADER).await;
        server.send(PLAIN_ONLY).await;
        server.expect("mechanism='PLAIN'").await;
        server.send(SUCCESS).await;
        server.expect("<stream:stream").await;
        server.send(HEADER).await;
        server.send(BIND_AND_SM).await;
        let bind = server.expect("urn:ietf:params:xml:ns:xmpp-bind").await;
        server
            .send("<message xmlns='jabber:client' from='romeo@montague.lit'><body>early</body></message>")
            .await;
        server
            .send(&format!(
                "<iq xmlns='jabber:client' type='result' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>juliet@capulet.lit/balcony</jid></bind></iq>",
                attr(&bind, "id").unwrap()
            ))
            .await;
        server.expect("<enable xmlns='urn:xmpp:sm:3' resume='true'/>").await;
        server.send(ENABLED).await;
        connection.wait_ready().await.unwrap();

        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connected { .. }));
        match next_event(&mut events).await {
            ConnectionEvent::Stanza(stanza) => assert_eq!(stanza.body().as_deref(), Some("early")),
            other => panic!("unexpected event {:?}", other),
        }

        // Sent before stream management was enabled, so not part of h.
        server.send("<r xmlns='urn:xmpp:sm:3'/>").await;
        server.expect("<a xmlns='urn:xmpp:sm:3' h='0'/>").await;
    }

    #[tokio::test]
    async fn test_session_without_stream_management() {
        let (connector, mut servers) = TestConnector::with_streams(1);
        let (connection, _events) = XmppConnection::new(config(), connector).unwrap();
        let mut server = servers.remove(0);
        server.authenticate_and_bind(BIND_ONLY).await;
        connection.wait_ready().await.unwrap();

        assert_eq!(connection.send(&Stanza::presence()).unwrap(), None);
        server.expect("<presence").await;
    }

    #[tokio::test]
    async fn test_instant_shutdown_releases_pending_requests() {
        let (connection, mut events, mut server) = connected(config().with_reply_timeout(Duration::from_secs(60))).await;
        let connection = Arc::new(connection);
        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send_iq(Stanza::iq("get")).await })
        };
        server.expect("<iq").await;

        let started = std::time::Instant::now();
        connection.instant_shutdown();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(RequestError::ConnectionClosed(_))));
        assert!(started.elapsed() < Duration::from_secs(1));

        loop {
            if let ConnectionEvent::Disconnected { error } = next_event(&mut events).await {
                assert_eq!(error, None);
                break;
            }
        }
        assert_eq!(connection.state(), StateId::InstantShutdown);
    }

    #[tokio::test]
    async fn test_instant_shutdown_while_connecting() {
        let (connector, mut servers) = TestConnector::with_streams(1);
        let (connection, _events) = XmppConnection::new(config(), connector).unwrap();
        let mut server = servers.remove(0);
        server.expect("<stream:stream").await;

        connection.instant_shutdown();
        let error = connection.wait_ready().await.unwrap_err();
        assert!(matches!(error, Error::Negotiation(NegotiationError::Shutdown)));
    }
}
