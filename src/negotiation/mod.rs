//! Connection negotiation: STARTTLS, SASL, resumption or binding, stream
//! management.
//!
//! [`Negotiator`] holds no I/O. The connection driver feeds it classified
//! inbound elements and executes the [`Action`]s it returns, so every
//! negotiation path can be exercised in tests with scripted server replies.
//! Which edge to take is decided by [`graph::choose`] over the static
//! transition table; this module only evaluates guards and performs the
//! side effects of entering a state.

pub mod graph;

use tracing::{debug, info, warn};

pub use graph::{Guard, Priority, StateId, Transition, TRANSITIONS};

use crate::config::{ConnectionConfig, SecurityMode};
use crate::error::{Error, NegotiationError, SaslError};
use crate::protocol::{self, Inbound, StreamFeatures};
use crate::sasl::{AuthExchange, Credentials, MechanismSelector};
use crate::stream_management::{StreamManager, Unacked};

/// Side effect requested by the negotiator, executed in order by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(String),
    /// Run the TLS handshake on the current transport.
    UpgradeTls,
    /// Retransmit after a successful resumption.
    Replay(Vec<Unacked>),
    /// Unacknowledged stanzas that will never be delivered.
    StanzasLost(Vec<Unacked>),
    Connected { jid: Option<String>, resumed: bool },
    Failed(NegotiationError),
}

/// The parts of [`ConnectionConfig`] negotiation needs.
#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    pub domain: String,
    pub credentials: Credentials,
    pub selector: MechanismSelector,
    pub security: SecurityMode,
    pub resource: Option<String>,
    pub stream_management: bool,
    pub resumption: bool,
    pub preferred_resumption_secs: Option<u32>,
}

impl NegotiationSettings {
    pub fn from_config(config: &ConnectionConfig) -> Result<Self, Error> {
        let account = config.account()?;
        Ok(Self {
            domain: account.domain().to_string(),
            credentials: config.credentials(&account),
            selector: config.mechanism_selector(),
            security: config.security,
            resource: config.resource.clone(),
            stream_management: config.stream_management,
            resumption: config.resumption,
            preferred_resumption_secs: config.preferred_resumption_secs,
        })
    }
}

enum Event<'a> {
    Start,
    Inbound(&'a Inbound),
    TransportLost,
    Close,
    Shutdown,
}

impl Event<'_> {
    /// Whether the event must move the walk forward. Anything else that finds
    /// no transition is ignored.
    fn demands_transition(&self) -> bool {
        match self {
            Event::Inbound(inbound) => !matches!(
                inbound,
                Inbound::StreamHeader { .. }
                    | Inbound::Stanza(_)
                    | Inbound::SmAck(_)
                    | Inbound::SmRequest
                    | Inbound::Unknown(_)
            ),
            _ => true,
        }
    }
}

pub struct Negotiator {
    settings: NegotiationSettings,
    state: StateId,
    history: Vec<StateId>,
    features: StreamFeatures,
    secure: bool,
    can_start_tls: bool,
    authenticated: bool,
    stream_id: Option<String>,
    exchange: Option<AuthExchange>,
    mechanism: Option<&'static str>,
    bind_id: Option<String>,
    jid: Option<String>,
    failure: Option<NegotiationError>,
}

impl Negotiator {
    pub fn new(settings: NegotiationSettings) -> Self {
        Self {
            settings,
            state: StateId::Disconnected,
            history: vec![StateId::Disconnected],
            features: StreamFeatures::default(),
            secure: false,
            can_start_tls: false,
            authenticated: false,
            stream_id: None,
            exchange: None,
            mechanism: None,
            bind_id: None,
            jid: None,
            failure: None,
        }
    }

    pub fn state(&self) -> StateId {
        self.state
    }

    /// States visited since the last [`start`](Self::start).
    pub fn history(&self) -> &[StateId] {
        &self.history
    }

    pub fn features(&self) -> &StreamFeatures {
        &self.features
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn mechanism(&self) -> Option<&'static str> {
        self.mechanism
    }

    /// Full JID bound to the session (kept across resumption).
    pub fn jid(&self) -> Option<&str> {
        self.jid.as_deref()
    }

    pub fn failure(&self) -> Option<&NegotiationError> {
        self.failure.as_ref()
    }

    pub fn domain(&self) -> &str {
        &self.settings.domain
    }

    /// Begin negotiating on a freshly opened transport.
    pub fn start(&mut self, secure: bool, can_start_tls: bool, sm: &mut StreamManager) -> Vec<Action> {
        self.state = StateId::Disconnected;
        self.history = vec![StateId::Disconnected];
        self.features = StreamFeatures::default();
        self.secure = secure;
        self.can_start_tls = can_start_tls;
        self.authenticated = false;
        self.stream_id = None;
        self.exchange = None;
        self.mechanism = None;
        self.bind_id = None;
        self.failure = None;
        self.walk(Event::Start, sm)
    }

    pub fn handle(&mut self, inbound: &Inbound, sm: &mut StreamManager) -> Vec<Action> {
        match inbound {
            Inbound::StreamHeader { id, .. } => {
                debug!(stream_id = ?id, "Stream opened by server");
                self.stream_id = id.clone();
            }
            Inbound::Features(features) => {
                debug!(features = ?features.advertised, "Stream features");
                self.features = features.clone();
            }
            _ => {}
        }
        self.walk(Event::Inbound(inbound), sm)
    }

    /// The transport went away while negotiating.
    pub fn transport_lost(&mut self, sm: &mut StreamManager) -> Vec<Action> {
        self.walk(Event::TransportLost, sm)
    }

    /// Clean close requested by the application.
    pub fn close(&mut self, sm: &mut StreamManager) -> Vec<Action> {
        self.walk(Event::Close, sm)
    }

    /// Immediate teardown; never waits for anything.
    pub fn instant_shutdown(&mut self, sm: &mut StreamManager) -> Vec<Action> {
        self.walk(Event::Shutdown, sm)
    }

    fn walk(&mut self, event: Event<'_>, sm: &mut StreamManager) -> Vec<Action> {
        let from = self.state;
        let view: &StreamManager = sm;
        let chosen = graph::choose(from, |guard| self.holds(guard, &event, view));
        let Some(transition) = chosen else {
            if event.demands_transition() && !from.is_terminal() {
                return self.fail(NegotiationError::NoTransition { state: from });
            }
            if let Event::Inbound(inbound) = &event {
                debug!(state = ?from, element = inbound.label(), "Element is not a negotiation step");
            }
            return Vec::new();
        };

        match self.enter(transition, &event, sm) {
            Ok(actions) => {
                debug!(from = ?from, to = ?transition.to, guard = ?transition.guard, "Negotiation transition");
                self.state = transition.to;
                self.history.push(transition.to);
                actions
            }
            Err(error) => self.fail(error),
        }
    }

    fn fail(&mut self, error: NegotiationError) -> Vec<Action> {
        warn!(state = ?self.state, error = %error, "Negotiation failed");
        let mut actions = Vec::new();
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.abort();
            // A locally failed step leaves the server waiting for a response.
            let local_failure = matches!(
                &error,
                NegotiationError::Authentication(e) if !matches!(e, SaslError::Failure { .. })
            );
            if self.state == StateId::Authenticating && local_failure {
                debug!(mechanism = exchange.mechanism_name(), "Aborting SASL exchange");
                actions.push(Action::Send(protocol::sasl_abort()));
            }
        }
        self.state = StateId::Failed;
        self.history.push(StateId::Failed);
        self.failure = Some(error.clone());
        actions.push(Action::Failed(error));
        actions
    }

    fn bind_reply(&self, event: &Event<'_>) -> Option<bool> {
        let Event::Inbound(Inbound::Stanza(stanza)) = event else {
            return None;
        };
        if self.bind_id.is_none() || stanza.id() != self.bind_id.as_deref() || !stanza.is_iq_response() {
            return None;
        }
        Some(stanza.stanza_type() == Some("result"))
    }

    fn holds(&self, guard: Guard, event: &Event<'_>, sm: &StreamManager) -> bool {
        let inbound = match event {
            Event::Inbound(inbound) => Some(*inbound),
            _ => None,
        };
        let features = matches!(inbound, Some(Inbound::Features(_)));
        let f = &self.features;
        let policy = self.settings.security;
        let tls_possible = f.starttls.is_some() && self.can_start_tls;
        let server_requires_tls = f.starttls == Some(true);
        let sm_failed = matches!(inbound, Some(Inbound::SmFailed { .. }));

        match guard {
            Guard::Start => matches!(event, Event::Start),
            Guard::TlsMandatory => {
                features
                    && !self.secure
                    && tls_possible
                    && (policy == SecurityMode::Required
                        || (server_requires_tls && policy != SecurityMode::Disabled))
            }
            Guard::TlsOffered => features && !self.secure && tls_possible && policy == SecurityMode::IfPossible,
            Guard::TlsUnavailable => {
                features && !self.secure && policy == SecurityMode::Required && !tls_possible
            }
            Guard::TlsProceed => matches!(inbound, Some(Inbound::TlsProceed)),
            Guard::TlsRefused => matches!(inbound, Some(Inbound::TlsFailure)),
            Guard::ReadyToAuthenticate => {
                features
                    && !self.authenticated
                    && !f.mechanisms.is_empty()
                    && (self.secure || !server_requires_tls)
            }
            Guard::SaslChallenge => matches!(inbound, Some(Inbound::SaslChallenge(_))),
            Guard::SaslSuccess => matches!(inbound, Some(Inbound::SaslSuccess(_))),
            Guard::SaslFailure => matches!(inbound, Some(Inbound::SaslFailure { .. })),
            Guard::CanResume => {
                features
                    && self.authenticated
                    && f.stream_management
                    && self.settings.resumption
                    && sm.resumption().is_some()
            }
            Guard::CanBind => features && self.authenticated && f.bind,
            Guard::ResumeSucceeded => matches!(inbound, Some(Inbound::SmResumed { .. })),
            Guard::ResumeRejectedCanBind => sm_failed && f.bind,
            Guard::ResumeRejectedCannotBind => sm_failed && !f.bind,
            Guard::BoundCanEnableSm => {
                self.bind_reply(event) == Some(true) && self.settings.stream_management && f.stream_management
            }
            Guard::Bound => self.bind_reply(event) == Some(true),
            Guard::BindFailed => self.bind_reply(event) == Some(false),
            Guard::SmEnabled => matches!(inbound, Some(Inbound::SmEnabled(_))),
            Guard::SmFailed => sm_failed,
            Guard::StreamError => matches!(inbound, Some(Inbound::StreamError { .. })),
            Guard::StreamEnd => {
                matches!(event, Event::TransportLost) || matches!(inbound, Some(Inbound::StreamEnd))
            }
            Guard::CloseRequested => matches!(event, Event::Close),
            Guard::ShutdownRequested => matches!(event, Event::Shutdown),
        }
    }

    fn stream_header(&self) -> Action {
        Action::Send(protocol::stream_header(&self.settings.domain))
    }

    fn bind(&mut self) -> Action {
        let request = protocol::bind_request(self.settings.resource.as_deref());
        self.bind_id = request.id().map(str::to_string);
        Action::Send(request.to_xml())
    }

    fn enter(
        &mut self,
        transition: &Transition,
        event: &Event<'_>,
        sm: &mut StreamManager,
    ) -> Result<Vec<Action>, NegotiationError> {
        let inbound = match event {
            Event::Inbound(inbound) => Some(*inbound),
            _ => None,
        };

        let actions = match transition.guard {
            Guard::Start => vec![self.stream_header()],
            Guard::TlsMandatory | Guard::TlsOffered => vec![Action::Send(protocol::starttls())],
            Guard::TlsUnavailable => return Err(NegotiationError::TlsUnavailable),
            Guard::TlsProceed => {
                self.secure = true;
                self.features = StreamFeatures::default();
                vec![Action::UpgradeTls, self.stream_header()]
            }
            Guard::TlsRefused => return Err(NegotiationError::TlsRefused),
            Guard::ReadyToAuthenticate => {
                let mut exchange = self
                    .settings
                    .selector
                    .start(&self.features.mechanisms, &self.settings.credentials)?;
                let initial = exchange.start()?;
                let mechanism = exchange.mechanism_name();
                self.mechanism = Some(mechanism);
                self.exchange = Some(exchange);
                vec![Action::Send(protocol::sasl_auth(mechanism, initial.as_deref()))]
            }
            Guard::SaslChallenge => {
                let Some(Inbound::SaslChallenge(data)) = inbound else {
                    return Err(NegotiationError::Violation("challenge expected".to_string()));
                };
                let exchange = self.exchange.as_mut().ok_or(SaslError::UnexpectedStep("challenge"))?;
                let response = exchange.challenge(data)?;
                vec![Action::Send(protocol::sasl_response(&response))]
            }
            Guard::SaslSuccess => {
                let Some(Inbound::SaslSuccess(data)) = inbound else {
                    return Err(NegotiationError::Violation("success expected".to_string()));
                };
                let mut exchange = self.exchange.take().ok_or(SaslError::UnexpectedStep("success"))?;
                exchange.success(data)?;
                self.authenticated = true;
                self.features = StreamFeatures::default();
                vec![self.stream_header()]
            }
            Guard::SaslFailure => {
                let Some(Inbound::SaslFailure { condition, text }) = inbound else {
                    return Err(NegotiationError::Violation("failure expected".to_string()));
                };
                let error = match self.exchange.as_mut() {
                    Some(exchange) => exchange.failure(condition, text.as_deref()),
                    None => SaslError::Failure {
                        condition: condition.clone(),
                        text: text.clone(),
                    },
                };
                return Err(NegotiationError::Authentication(error));
            }
            Guard::CanResume => {
                let request = sm
                    .resume_request()
                    .ok_or_else(|| NegotiationError::Violation("no resumable session".to_string()))?;
                vec![Action::Send(request)]
            }
            Guard::CanBind => {
                let lost = sm.reset();
                let mut actions = Vec::new();
                if !lost.is_empty() {
                    actions.push(Action::StanzasLost(lost));
                }
                actions.push(self.bind());
                actions
            }
            Guard::ResumeSucceeded => {
                let Some(Inbound::SmResumed { previd, h }) = inbound else {
                    return Err(NegotiationError::Violation("resumed expected".to_string()));
                };
                let expected = sm.resumption().map(|(id, _)| id);
                if expected != Some(previd.as_str()) {
                    warn!(previd = %previd, expected = ?expected, "Server resumed a different session");
                    return Err(NegotiationError::Violation(format!("resumed unknown session '{}'", previd)));
                }
                let replay = sm.on_resumed(*h);
                info!(jid = ?self.jid, replay = replay.len(), "Session resumed");
                vec![
                    Action::Replay(replay),
                    Action::Connected {
                        jid: self.jid.clone(),
                        resumed: true,
                    },
                ]
            }
            Guard::ResumeRejectedCanBind => {
                let condition = match inbound {
                    Some(Inbound::SmFailed { condition, .. }) => condition.as_deref(),
                    _ => None,
                };
                let lost = sm.on_resume_failed(condition);
                let mut actions = Vec::new();
                if !lost.is_empty() {
                    actions.push(Action::StanzasLost(lost));
                }
                actions.push(self.bind());
                actions
            }
            Guard::ResumeRejectedCannotBind => {
                return Err(NegotiationError::Violation(
                    "resumption rejected and resource binding not offered".to_string(),
                ))
            }
            Guard::BoundCanEnableSm | Guard::Bound => {
                if let Some(Inbound::Stanza(reply)) = inbound {
                    self.jid = protocol::bound_jid(reply);
                }
                self.bind_id = None;
                info!(jid = ?self.jid, "Resource bound");
                if transition.guard == Guard::BoundCanEnableSm {
                    vec![Action::Send(
                        sm.enable(self.settings.resumption, self.settings.preferred_resumption_secs),
                    )]
                } else {
                    vec![Action::Connected {
                        jid: self.jid.clone(),
                        resumed: false,
                    }]
                }
            }
            Guard::BindFailed => {
                let condition = match inbound {
                    Some(Inbound::Stanza(reply)) => reply.error_condition(),
                    _ => None,
                };
                return Err(NegotiationError::BindFailed(
                    condition.unwrap_or_else(|| "undefined-condition".to_string()),
                ));
            }
            Guard::SmEnabled => {
                if let Some(Inbound::SmEnabled(enabled)) = inbound {
                    sm.on_enabled(enabled);
                }
                vec![Action::Connected {
                    jid: self.jid.clone(),
                    resumed: false,
                }]
            }
            Guard::SmFailed => {
                let condition = match inbound {
                    Some(Inbound::SmFailed { condition, .. }) => condition.as_deref(),
                    _ => None,
                };
                sm.on_enable_failed(condition);
                vec![Action::Connected {
                    jid: self.jid.clone(),
                    resumed: false,
                }]
            }
            Guard::StreamError => {
                let Some(Inbound::StreamError { condition, text }) = inbound else {
                    return Err(NegotiationError::Violation("stream error expected".to_string()));
                };
                return Err(NegotiationError::StreamError {
                    condition: condition.clone(),
                    text: text.clone(),
                });
            }
            Guard::StreamEnd => {
                return Err(NegotiationError::Transport("stream closed during negotiation".to_string()))
            }
            Guard::CloseRequested | Guard::ShutdownRequested => {
                if let Some(exchange) = self.exchange.as_mut() {
                    exchange.abort();
                }
                Vec::new()
            }
        };
        Ok(actions)
    }
}
