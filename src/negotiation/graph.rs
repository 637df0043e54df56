//! The negotiation graph as data.
//!
//! Every edge of the state machine is a row in [`TRANSITIONS`]. A row names
//! the states it leaves from, the state it enters, the guard that must hold and
//! whether it is mandatory. The walk in the parent module only ever consults
//! this table, so the whole graph can be inspected and tested without I/O.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateId {
    Disconnected,
    AwaitingFeatures,
    NegotiatingTls,
    Authenticating,
    Resuming,
    BindingResource,
    EnablingStreamManagement,
    Connected,
    Closed,
    Failed,
    InstantShutdown,
}

impl StateId {
    pub const ALL: [StateId; 11] = [
        StateId::Disconnected,
        StateId::AwaitingFeatures,
        StateId::NegotiatingTls,
        StateId::Authenticating,
        StateId::Resuming,
        StateId::BindingResource,
        StateId::EnablingStreamManagement,
        StateId::Connected,
        StateId::Closed,
        StateId::Failed,
        StateId::InstantShutdown,
    ];

    /// The walk stops in these states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StateId::Connected | StateId::Closed | StateId::Failed | StateId::InstantShutdown
        )
    }
}

/// Precondition of a transition, evaluated against the advertised features,
/// the session flags and the event that triggered the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Guard {
    /// The application asked to connect.
    Start,
    /// STARTTLS must happen before anything else.
    TlsMandatory,
    /// STARTTLS is offered and the policy takes it when possible.
    TlsOffered,
    /// Policy demands TLS but the stream cannot be secured.
    TlsUnavailable,
    TlsProceed,
    TlsRefused,
    ReadyToAuthenticate,
    SaslChallenge,
    SaslSuccess,
    SaslFailure,
    /// Authenticated, the server offers stream management and a resumable
    /// session is on hand.
    CanResume,
    CanBind,
    ResumeSucceeded,
    /// Resumption rejected; fall back to binding a fresh session.
    ResumeRejectedCanBind,
    ResumeRejectedCannotBind,
    /// Bind succeeded and stream management should be enabled.
    BoundCanEnableSm,
    Bound,
    BindFailed,
    SmEnabled,
    SmFailed,
    StreamError,
    StreamEnd,
    CloseRequested,
    ShutdownRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Taken before any optional transition whose guard also holds.
    Mandatory,
    /// Higher wins.
    Optional(u8),
}

#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: &'static [StateId],
    pub to: StateId,
    pub guard: Guard,
    pub priority: Priority,
}

impl Transition {
    pub fn leaves(&self, state: StateId) -> bool {
        self.from.contains(&state)
    }
}

use Guard as G;
use Priority::{Mandatory, Optional};
use StateId as S;

const NEGOTIATING: &[StateId] = &[
    S::Disconnected,
    S::AwaitingFeatures,
    S::NegotiatingTls,
    S::Authenticating,
    S::Resuming,
    S::BindingResource,
    S::EnablingStreamManagement,
];

const STREAM_OPEN: &[StateId] = &[
    S::AwaitingFeatures,
    S::NegotiatingTls,
    S::Authenticating,
    S::Resuming,
    S::BindingResource,
    S::EnablingStreamManagement,
];

const CLOSABLE: &[StateId] = &[
    S::Disconnected,
    S::AwaitingFeatures,
    S::NegotiatingTls,
    S::Authenticating,
    S::Resuming,
    S::BindingResource,
    S::EnablingStreamManagement,
    S::Connected,
];

const fn edge(from: &'static [StateId], to: StateId, guard: Guard, priority: Priority) -> Transition {
    Transition {
        from,
        to,
        guard,
        priority,
    }
}

pub const TRANSITIONS: &[Transition] = &[
    edge(&[S::Disconnected], S::AwaitingFeatures, G::Start, Optional(0)),
    // Features
    edge(&[S::AwaitingFeatures], S::Failed, G::TlsUnavailable, Mandatory),
    edge(&[S::AwaitingFeatures], S::NegotiatingTls, G::TlsMandatory, Mandatory),
    edge(&[S::AwaitingFeatures], S::NegotiatingTls, G::TlsOffered, Optional(30)),
    edge(&[S::AwaitingFeatures], S::Authenticating, G::ReadyToAuthenticate, Optional(20)),
    edge(&[S::AwaitingFeatures], S::Resuming, G::CanResume, Optional(20)),
    edge(&[S::AwaitingFeatures], S::BindingResource, G::CanBind, Optional(10)),
    // STARTTLS
    edge(&[S::NegotiatingTls], S::AwaitingFeatures, G::TlsProceed, Optional(0)),
    edge(&[S::NegotiatingTls], S::Failed, G::TlsRefused, Mandatory),
    // SASL
    edge(&[S::Authenticating], S::Authenticating, G::SaslChallenge, Optional(0)),
    edge(&[S::Authenticating], S::AwaitingFeatures, G::SaslSuccess, Optional(0)),
    edge(&[S::Authenticating], S::Failed, G::SaslFailure, Mandatory),
    // Resumption
    edge(&[S::Resuming], S::Connected, G::ResumeSucceeded, Optional(0)),
    edge(&[S::Resuming], S::BindingResource, G::ResumeRejectedCanBind, Optional(0)),
    edge(&[S::Resuming], S::Failed, G::ResumeRejectedCannotBind, Mandatory),
    // Binding
    edge(&[S::BindingResource], S::EnablingStreamManagement, G::BoundCanEnableSm, Optional(10)),
    edge(&[S::BindingResource], S::Connected, G::Bound, Optional(0)),
    edge(&[S::BindingResource], S::Failed, G::BindFailed, Mandatory),
    // Stream management
    edge(&[S::EnablingStreamManagement], S::Connected, G::SmEnabled, Optional(0)),
    edge(&[S::EnablingStreamManagement], S::Connected, G::SmFailed, Optional(0)),
    // Any time the stream is open
    edge(STREAM_OPEN, S::Failed, G::StreamError, Mandatory),
    edge(STREAM_OPEN, S::Failed, G::StreamEnd, Mandatory),
    edge(CLOSABLE, S::Closed, G::CloseRequested, Mandatory),
    edge(NEGOTIATING, S::InstantShutdown, G::ShutdownRequested, Mandatory),
    edge(&[S::Connected, S::Closed, S::Failed], S::InstantShutdown, G::ShutdownRequested, Mandatory),
];

/// Transitions leaving `state`, in table order.
pub fn outgoing(state: StateId) -> impl Iterator<Item = &'static Transition> {
    TRANSITIONS.iter().filter(move |t| t.leaves(state))
}

/// Pick the transition to take among those whose guard holds: mandatory
/// first, then the highest optional priority. Ties go to table order.
pub fn choose(state: StateId, holds: impl Fn(Guard) -> bool) -> Option<&'static Transition> {
    let mut best: Option<&'static Transition> = None;
    for transition in outgoing(state).filter(|t| holds(t.guard)) {
        best = match best {
            None => Some(transition),
            Some(current) if rank(transition.priority) > rank(current.priority) => Some(transition),
            Some(current) => Some(current),
        };
    }
    best
}

fn rank(priority: Priority) -> u16 {
    match priority {
        Priority::Mandatory => u16::MAX,
        Priority::Optional(p) => u16::from(p),
    }
}
