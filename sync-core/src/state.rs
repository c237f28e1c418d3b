//! Queue link health state machine.
//!
//! A pure, side-effect-free state machine tracking one queue connection. It
//! takes events as input and produces a new state plus a list of actions to
//! execute.
//!
//! Sync failures are not reported per message, but a link that keeps failing
//! must not stay silent: after `alert_after` consecutive failed calls the
//! machine asks the caller to raise an operator alert, once, and to log the
//! recovery when calls succeed again.

/// Link state - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// No connection yet.
    Disconnected,
    /// Credential resolution and health check in progress.
    Connecting,
    /// Last call succeeded.
    Healthy,
    /// Consecutive calls have failed after retries.
    Failing {
        /// Failed calls in a row.
        consecutive: u32,
        /// Whether the operator alert has been raised for this streak.
        alerted: bool,
    },
    /// Shutdown requested; no further calls should start.
    Closed,
}

impl LinkState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller is responsible
    /// for executing the returned actions.
    pub fn on_event(self, event: LinkEvent, alert_after: u32) -> (Self, Vec<LinkAction>) {
        let alert_after = alert_after.max(1);
        match (self, event) {
            // Closed is terminal
            (Self::Closed, _) => (Self::Closed, vec![]),
            (_, LinkEvent::ShutdownRequested) => (Self::Closed, vec![]),

            (Self::Disconnected, LinkEvent::ConnectRequested) => (Self::Connecting, vec![]),
            (Self::Connecting, LinkEvent::ConnectSucceeded) => (Self::Healthy, vec![]),

            // Success after a failure streak
            (Self::Failing { consecutive, alerted }, LinkEvent::CallSucceeded) => {
                let actions = if alerted {
                    vec![LinkAction::Recovered {
                        after_failures: consecutive,
                    }]
                } else {
                    vec![]
                };
                (Self::Healthy, actions)
            }
            (_, LinkEvent::CallSucceeded) => (Self::Healthy, vec![]),

            // Failures
            (Self::Failing { consecutive, alerted }, event @ LinkEvent::CallFailed { .. })
            | (Self::Failing { consecutive, alerted }, event @ LinkEvent::ConnectFailed { .. }) => {
                let consecutive = consecutive.saturating_add(1);
                fail(consecutive, alerted, event, alert_after)
            }
            (_, event @ LinkEvent::CallFailed { .. })
            | (_, event @ LinkEvent::ConnectFailed { .. }) => fail(1, false, event, alert_after),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Whether the link has been shut down.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether the last call succeeded.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Failed calls in a row (0 unless failing).
    pub fn consecutive_failures(&self) -> u32 {
        match self {
            Self::Failing { consecutive, .. } => *consecutive,
            _ => 0,
        }
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

fn fail(
    consecutive: u32,
    alerted: bool,
    event: LinkEvent,
    alert_after: u32,
) -> (LinkState, Vec<LinkAction>) {
    let (error, permanent) = match event {
        LinkEvent::CallFailed { error, permanent } | LinkEvent::ConnectFailed { error, permanent } => {
            (error, permanent)
        }
        _ => (String::new(), false),
    };

    let mut actions = vec![];
    let raise = !alerted && consecutive >= alert_after;
    if raise {
        actions.push(LinkAction::RaiseAlert {
            consecutive,
            permanent,
            error,
        });
    }

    (
        LinkState::Failing {
            consecutive,
            alerted: alerted || raise,
        },
        actions,
    )
}

/// Events that can occur on a queue link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Connection setup started.
    ConnectRequested,
    /// Health check passed.
    ConnectSucceeded,
    /// Connection setup failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
        /// Whether the failure is permanent (not retryable).
        permanent: bool,
    },
    /// A queue call succeeded.
    CallSucceeded,
    /// A queue call failed after exhausting retries (or permanently).
    CallFailed {
        /// Error message describing the failure.
        error: String,
        /// Whether the failure is permanent (not retryable).
        permanent: bool,
    },
    /// Shutdown requested.
    ShutdownRequested,
}

/// Actions to be executed by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Raise an operator-visible alert.
    RaiseAlert {
        /// Failed calls in a row.
        consecutive: u32,
        /// Whether the last failure was permanent.
        permanent: bool,
        /// Last error message.
        error: String,
    },
    /// Log that a previously alerted link works again.
    Recovered {
        /// Length of the failure streak that ended.
        after_failures: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(permanent: bool) -> LinkEvent {
        LinkEvent::CallFailed {
            error: "unauthorized".into(),
            permanent,
        }
    }

    #[test]
    fn starts_disconnected() {
        assert_eq!(LinkState::new(), LinkState::Disconnected);
    }

    #[test]
    fn connect_lifecycle() {
        let (state, _) = LinkState::new().on_event(LinkEvent::ConnectRequested, 3);
        assert_eq!(state, LinkState::Connecting);

        let (state, actions) = state.on_event(LinkEvent::ConnectSucceeded, 3);
        assert!(state.is_healthy());
        assert!(actions.is_empty());
    }

    #[test]
    fn alert_raised_once_at_threshold() {
        let mut state = LinkState::Healthy;
        let mut alerts = 0;

        for _ in 0..6 {
            let (next, actions) = state.on_event(failed(true), 3);
            alerts += actions
                .iter()
                .filter(|a| matches!(a, LinkAction::RaiseAlert { .. }))
                .count();
            state = next;
        }

        assert_eq!(alerts, 1);
        assert_eq!(state.consecutive_failures(), 6);
    }

    #[test]
    fn alert_carries_last_error() {
        let (state, _) = LinkState::Healthy.on_event(failed(false), 2);
        let (_, actions) = state.on_event(failed(true), 2);

        assert_eq!(
            actions,
            vec![LinkAction::RaiseAlert {
                consecutive: 2,
                permanent: true,
                error: "unauthorized".into(),
            }]
        );
    }

    #[test]
    fn recovery_logged_only_after_alert() {
        // Short streak, no alert, no recovery action
        let (state, _) = LinkState::Healthy.on_event(failed(false), 3);
        let (state, actions) = state.on_event(LinkEvent::CallSucceeded, 3);
        assert!(actions.is_empty());
        assert!(state.is_healthy());

        // Long streak, alert, then recovery
        let mut state = state;
        for _ in 0..3 {
            state = state.on_event(failed(true), 3).0;
        }
        let (state, actions) = state.on_event(LinkEvent::CallSucceeded, 3);
        assert_eq!(actions, vec![LinkAction::Recovered { after_failures: 3 }]);
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn connect_failure_counts_toward_streak() {
        let (state, _) = LinkState::Connecting.on_event(
            LinkEvent::ConnectFailed {
                error: "queue not found".into(),
                permanent: true,
            },
            1,
        );
        assert!(matches!(
            state,
            LinkState::Failing {
                consecutive: 1,
                alerted: true
            }
        ));
    }

    #[test]
    fn closed_is_terminal() {
        let (state, _) = LinkState::Healthy.on_event(LinkEvent::ShutdownRequested, 3);
        assert!(state.is_closed());

        let (state, actions) = state.on_event(LinkEvent::CallSucceeded, 3);
        assert!(state.is_closed());
        assert!(actions.is_empty());
    }
}
