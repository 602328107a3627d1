//! CIS lifecycle state machine
//!
//! Raw link events are remapped to a small canonical event set, then a
//! pure function maps `(state, event)` to the next state and the action
//! the caller must perform. Pairs outside the table leave the state
//! untouched and perform nothing beyond a trace line.

use crate::LinkEvent;
use crate::cis::TerminateReason;
use crate::cis::registry::CisContext;

/// Lifecycle states of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CisState {
    /// No establishment attempt active; initial and post-teardown state
    Idle,
    /// Stream established and exchanging isochronous data
    Established,
    /// Local termination signalled, waiting for the stream to close
    Shutdown,
}

/// Canonical events driving the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CisEvent {
    /// Establishment succeeded
    Est,
    /// Establishment failed
    EstFail,
    /// Host asked to disconnect
    Disc,
    /// Underlying connection failed
    ConnFail,
    /// Stream fully closed
    Closed,
}

/// Actions the caller performs on a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CisAction {
    /// Mark the stream live and notify the host it is established
    Establish,
    /// Release attempt resources and notify the host of the failure
    EstablishFail,
    /// Send the terminate indication and start teardown
    BeginTerm,
    /// Tear down immediately without notifying the peer
    AbruptEnd,
    /// Release stream resources after an orderly close
    Cleanup,
}

/// Translate a raw link event into its canonical form, capturing the
/// terminate reason as a side effect where the table requires it. Events
/// with no canonical form return `None` and must not reach the table.
pub fn remap(ctx: &mut CisContext, event: &LinkEvent) -> Option<CisEvent> {
    match event {
        LinkEvent::HostDisconnect { reason, .. } => {
            ctx.term_reason = Some(TerminateReason::LocalHost(*reason));
            Some(CisEvent::Disc)
        }
        LinkEvent::SupervisionTimeout { .. } => {
            ctx.term_reason = Some(TerminateReason::ConnTimeout);
            Some(CisEvent::ConnFail)
        }
        LinkEvent::MicFailure { .. } => {
            ctx.term_reason = Some(TerminateReason::MicFailure);
            Some(CisEvent::ConnFail)
        }
        LinkEvent::EstDone { .. } => Some(CisEvent::Est),
        LinkEvent::EstFailed { .. } => Some(CisEvent::EstFail),
        LinkEvent::Closed { .. } => Some(CisEvent::Closed),
        _ => None,
    }
}

/// The transition table. Unlisted pairs return the input state and no
/// action.
#[must_use]
pub fn transition(state: CisState, event: CisEvent) -> (CisState, Option<CisAction>) {
    match (state, event) {
        (CisState::Idle, CisEvent::Est) => (CisState::Established, Some(CisAction::Establish)),
        (CisState::Idle, CisEvent::EstFail) => (CisState::Idle, Some(CisAction::EstablishFail)),
        (CisState::Established, CisEvent::Disc) => {
            (CisState::Shutdown, Some(CisAction::BeginTerm))
        }
        (CisState::Established, CisEvent::ConnFail) => {
            (CisState::Idle, Some(CisAction::AbruptEnd))
        }
        (CisState::Established, CisEvent::Closed) => (CisState::Idle, Some(CisAction::Cleanup)),
        (CisState::Shutdown, CisEvent::Closed) => (CisState::Idle, Some(CisAction::Cleanup)),
        (state, _) => (state, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IsoOptions;
    use crate::cis::registry::IsoRegistry;
    use crate::cis::{CigParams, CisParams};
    use heapless::Vec;

    const ALL_STATES: [CisState; 3] = [CisState::Idle, CisState::Established, CisState::Shutdown];
    const ALL_EVENTS: [CisEvent; 5] = [
        CisEvent::Est,
        CisEvent::EstFail,
        CisEvent::Disc,
        CisEvent::ConnFail,
        CisEvent::Closed,
    ];

    fn listed(state: CisState, event: CisEvent) -> Option<(CisState, CisAction)> {
        match (state, event) {
            (CisState::Idle, CisEvent::Est) => {
                Some((CisState::Established, CisAction::Establish))
            }
            (CisState::Idle, CisEvent::EstFail) => Some((CisState::Idle, CisAction::EstablishFail)),
            (CisState::Established, CisEvent::Disc) => {
                Some((CisState::Shutdown, CisAction::BeginTerm))
            }
            (CisState::Established, CisEvent::ConnFail) => {
                Some((CisState::Idle, CisAction::AbruptEnd))
            }
            (CisState::Established, CisEvent::Closed) => Some((CisState::Idle, CisAction::Cleanup)),
            (CisState::Shutdown, CisEvent::Closed) => Some((CisState::Idle, CisAction::Cleanup)),
            _ => None,
        }
    }

    #[test]
    fn test_table_closure() {
        for state in ALL_STATES {
            for event in ALL_EVENTS {
                let (next, action) = transition(state, event);
                match listed(state, event) {
                    Some((want_state, want_action)) => {
                        assert_eq!(next, want_state, "{state:?} + {event:?}");
                        assert_eq!(action, Some(want_action), "{state:?} + {event:?}");
                    }
                    None => {
                        assert_eq!(next, state, "{state:?} + {event:?} must not move");
                        assert_eq!(action, None, "{state:?} + {event:?} must not act");
                    }
                }
            }
        }
    }

    fn a_stream() -> (IsoRegistry, u16) {
        let opts = IsoOptions::default();
        let mut reg = IsoRegistry::new(&opts);
        let mut cis = Vec::new();
        cis.push(CisParams {
            cis_id: 0,
            phy_m_to_s: 0x01,
            phy_s_to_m: 0x01,
            max_sdu_m_to_s: 40,
            max_sdu_s_to_m: 40,
            sdu_interval_m_to_s: 10_000,
            sdu_interval_s_to_m: 10_000,
            framed: false,
            max_tx_len: 40,
            max_rx_len: 40,
            nse: 2,
            sub_interval_usec: 1_000,
            bn_m_to_s: 1,
            bn_s_to_m: 1,
            ft_m_to_s: 1,
            ft_s_to_m: 1,
        })
        .unwrap();
        let params = CigParams {
            cig_id: 1,
            packing: 0x00,
            iso_interval: 8,
            cis,
        };
        let handles = reg.admit_cig(&params, &opts).unwrap();
        (reg, handles[0])
    }

    #[test]
    fn test_remap_captures_reasons() {
        let (mut reg, handle) = a_stream();
        let ctx = reg.cis_mut(handle).unwrap();

        let ev = LinkEvent::HostDisconnect {
            cis_handle: handle,
            reason: 0x13,
        };
        assert_eq!(remap(ctx, &ev), Some(CisEvent::Disc));
        assert_eq!(ctx.term_reason, Some(TerminateReason::LocalHost(0x13)));

        let ev = LinkEvent::SupervisionTimeout { acl_handle: 0 };
        assert_eq!(remap(ctx, &ev), Some(CisEvent::ConnFail));
        assert_eq!(ctx.term_reason, Some(TerminateReason::ConnTimeout));

        let ev = LinkEvent::MicFailure { cis_handle: handle };
        assert_eq!(remap(ctx, &ev), Some(CisEvent::ConnFail));
        assert_eq!(ctx.term_reason, Some(TerminateReason::MicFailure));
    }

    #[test]
    fn test_remap_passthrough_events() {
        let (mut reg, handle) = a_stream();
        let ctx = reg.cis_mut(handle).unwrap();

        assert_eq!(
            remap(ctx, &LinkEvent::EstDone { cis_handle: handle }),
            Some(CisEvent::Est)
        );
        assert_eq!(
            remap(ctx, &LinkEvent::EstFailed { cis_handle: handle }),
            Some(CisEvent::EstFail)
        );
        assert_eq!(
            remap(ctx, &LinkEvent::Closed { cis_handle: handle }),
            Some(CisEvent::Closed)
        );
        assert!(ctx.term_reason.is_none());
    }

    #[test]
    fn test_remap_rejects_noncanonical() {
        let (mut reg, handle) = a_stream();
        let ctx = reg.cis_mut(handle).unwrap();

        let ev = LinkEvent::ConnEvent {
            acl_handle: 0,
            event_counter: 1,
            due_usec: 0,
            now_usec: 0,
        };
        assert_eq!(remap(ctx, &ev), None);
        assert_eq!(remap(ctx, &LinkEvent::LlcpTimeout { cis_handle: handle }), None);
        assert_eq!(ctx.state, CisState::Idle);
    }
}
