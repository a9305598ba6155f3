//! Tenant lifecycle transitions.
//!
//! [`transition`] only computes the next state and what has to happen to the
//! background loops; the caller stores the state and hands the intents to the
//! loop supervisor.

use pageserver_api::models::TenantState;

/// Something that happened to a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Loading finished.
    Activate { has_timelines: bool },
    TimelineAdded,
    LastTimelineRemoved,
    LoadFailed { reason: String },
    /// Detach, ignore or shutdown.
    DetachRequested,
    /// Every background loop of the tenant has exited.
    LoopsStopped,
}

/// What the loop supervisor has to do for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    StartLoops,
    /// Cancel the loops without waiting for them.
    SignalStop,
    /// Cancel the loops and wait until they have exited.
    StopAndWait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub new_state: TenantState,
    pub intents: Vec<Intent>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("tenant is broken: {reason}")]
    Broken { reason: String },

    #[error("tenant in state {state} cannot handle {trigger:?}")]
    Invalid { state: TenantState, trigger: Trigger },
}

pub fn transition(state: &TenantState, trigger: Trigger) -> Result<Transition, TransitionError> {
    use Intent::*;
    use TenantState::*;

    let to = |new_state: TenantState, intents: Vec<Intent>| {
        Ok(Transition { new_state, intents })
    };
    let unchanged = || to(state.clone(), Vec::new());

    match (state, trigger) {
        (Loading, Trigger::Activate { has_timelines }) => to(
            Active {
                background_jobs_running: has_timelines,
            },
            if has_timelines { vec![StartLoops] } else { Vec::new() },
        ),
        (Loading, Trigger::LoadFailed { reason }) => to(Broken { reason }, Vec::new()),
        // timelines are still being loaded, activation decides
        (Loading, Trigger::TimelineAdded) => unchanged(),

        (
            Active {
                background_jobs_running: false,
            },
            Trigger::TimelineAdded,
        ) => to(
            Active {
                background_jobs_running: true,
            },
            vec![StartLoops],
        ),
        (
            Active {
                background_jobs_running: true,
            },
            Trigger::LastTimelineRemoved,
        ) => to(
            Active {
                background_jobs_running: false,
            },
            vec![SignalStop],
        ),
        (
            Active {
                background_jobs_running: true,
            },
            Trigger::TimelineAdded,
        )
        | (
            Active {
                background_jobs_running: false,
            },
            Trigger::LastTimelineRemoved,
        ) => unchanged(),

        (Loading | Active { .. } | Broken { .. }, Trigger::DetachRequested) => {
            to(Stopping, vec![StopAndWait])
        }
        (Stopping | Detached, Trigger::DetachRequested) => unchanged(),
        (Stopping, Trigger::LoopsStopped) => to(Detached, Vec::new()),

        (Broken { reason }, _) => Err(TransitionError::Broken {
            reason: reason.clone(),
        }),
        (state, trigger) => Err(TransitionError::Invalid {
            state: state.clone(),
            trigger,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTIVE_RUNNING: TenantState = TenantState::Active {
        background_jobs_running: true,
    };
    const ACTIVE_IDLE: TenantState = TenantState::Active {
        background_jobs_running: false,
    };

    fn apply(state: &TenantState, trigger: Trigger) -> (TenantState, Vec<Intent>) {
        let t = transition(state, trigger).unwrap();
        (t.new_state, t.intents)
    }

    #[test]
    fn full_lifecycle() {
        let (state, intents) = apply(
            &TenantState::Loading,
            Trigger::Activate {
                has_timelines: true,
            },
        );
        assert_eq!(state, ACTIVE_RUNNING);
        assert_eq!(intents, vec![Intent::StartLoops]);

        let (state, intents) = apply(&state, Trigger::LastTimelineRemoved);
        assert_eq!(state, ACTIVE_IDLE);
        assert_eq!(intents, vec![Intent::SignalStop]);

        let (state, intents) = apply(&state, Trigger::TimelineAdded);
        assert_eq!(state, ACTIVE_RUNNING);
        assert_eq!(intents, vec![Intent::StartLoops]);

        let (state, intents) = apply(&state, Trigger::DetachRequested);
        assert_eq!(state, TenantState::Stopping);
        assert_eq!(intents, vec![Intent::StopAndWait]);

        let (state, intents) = apply(&state, Trigger::LoopsStopped);
        assert_eq!(state, TenantState::Detached);
        assert!(intents.is_empty());
    }

    #[test]
    fn no_op_triggers_have_no_intents() {
        for (state, trigger) in [
            (ACTIVE_RUNNING, Trigger::TimelineAdded),
            (ACTIVE_IDLE, Trigger::LastTimelineRemoved),
            (TenantState::Loading, Trigger::TimelineAdded),
            (TenantState::Stopping, Trigger::DetachRequested),
            (TenantState::Detached, Trigger::DetachRequested),
        ] {
            let t = transition(&state, trigger).unwrap();
            assert_eq!(t.new_state, state);
            assert!(t.intents.is_empty(), "{state:?}");
        }
    }

    #[test]
    fn activation_without_timelines_starts_nothing() {
        let (state, intents) = apply(
            &TenantState::Loading,
            Trigger::Activate {
                has_timelines: false,
            },
        );
        assert_eq!(state, ACTIVE_IDLE);
        assert!(intents.is_empty());
    }

    #[test]
    fn broken_tenant_can_only_be_detached() {
        let (state, _) = apply(
            &TenantState::Loading,
            Trigger::LoadFailed {
                reason: "bad metadata".to_string(),
            },
        );
        assert_eq!(
            state,
            TenantState::Broken {
                reason: "bad metadata".to_string()
            }
        );
        assert_eq!(
            transition(&state, Trigger::TimelineAdded),
            Err(TransitionError::Broken {
                reason: "bad metadata".to_string()
            })
        );
        let (state, intents) = apply(&state, Trigger::DetachRequested);
        assert_eq!(state, TenantState::Stopping);
        assert_eq!(intents, vec![Intent::StopAndWait]);
    }

    #[test]
    fn states_are_not_skipped() {
        // Detached is only reachable through Stopping.
        for state in [TenantState::Loading, ACTIVE_RUNNING, ACTIVE_IDLE] {
            assert!(matches!(
                transition(&state, Trigger::LoopsStopped),
                Err(TransitionError::Invalid { .. })
            ));
        }
        // a second activation is a bug
        assert!(transition(&ACTIVE_IDLE, Trigger::Activate { has_timelines: true }).is_err());
        assert!(transition(&TenantState::Detached, Trigger::TimelineAdded).is_err());
        assert!(transition(&TenantState::Stopping, Trigger::TimelineAdded).is_err());
    }
}
