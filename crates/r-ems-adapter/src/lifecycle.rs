//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Adapter runtime, lifecycle and plugin capability contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Adapter lifecycle transitions.
//!
//! ```text
//!            setting ok            start              stop
//!   Init ---------------> Ready ----------> Running ---------> Stopped
//!                                              ^                  |
//!                                              +------ start -----+
//! ```

use r_ems_msg::{AdapterState, ErrorCode, NodeCtlKind};

/// State reached by `ctl` from `state`, or the code to reply with.
///
/// Single and system nodes (`relaxed`) may start straight from `Init`.
pub fn check_ctl(state: AdapterState, ctl: NodeCtlKind, relaxed: bool) -> Result<AdapterState, ErrorCode> {
    match (ctl, state) {
        (NodeCtlKind::Start, AdapterState::Init) if relaxed => Ok(AdapterState::Running),
        (NodeCtlKind::Start, AdapterState::Init) => Err(ErrorCode::NodeNotReady),
        (NodeCtlKind::Start, AdapterState::Running) => Err(ErrorCode::NodeIsRunning),
        (NodeCtlKind::Start, AdapterState::Ready | AdapterState::Stopped) => Ok(AdapterState::Running),
        (NodeCtlKind::Stop, AdapterState::Init | AdapterState::Ready) => Err(ErrorCode::NodeNotRunning),
        (NodeCtlKind::Stop, AdapterState::Stopped) => Err(ErrorCode::NodeIsStopped),
        (NodeCtlKind::Stop, AdapterState::Running) => Ok(AdapterState::Stopped),
    }
}

/// State after the plugin accepted a setting.
pub fn on_setting_accepted(state: AdapterState) -> AdapterState {
    match state {
        AdapterState::Init => AdapterState::Ready,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AdapterState::*;

    #[test]
    fn start_transitions() {
        let table = [
            (Init, Err(ErrorCode::NodeNotReady)),
            (Ready, Ok(Running)),
            (Running, Err(ErrorCode::NodeIsRunning)),
            (Stopped, Ok(Running)),
        ];
        for (from, expected) in table {
            assert_eq!(check_ctl(from, NodeCtlKind::Start, false), expected, "start from {from:?}");
        }
    }

    #[test]
    fn stop_transitions() {
        let table = [
            (Init, Err(ErrorCode::NodeNotRunning)),
            (Ready, Err(ErrorCode::NodeNotRunning)),
            (Running, Ok(Stopped)),
            (Stopped, Err(ErrorCode::NodeIsStopped)),
        ];
        for (from, expected) in table {
            assert_eq!(check_ctl(from, NodeCtlKind::Stop, false), expected, "stop from {from:?}");
        }
    }

    #[test]
    fn single_nodes_start_without_setting() {
        assert_eq!(check_ctl(Init, NodeCtlKind::Start, true), Ok(Running));
        assert_eq!(
            check_ctl(Running, NodeCtlKind::Start, true),
            Err(ErrorCode::NodeIsRunning)
        );
    }

    #[test]
    fn setting_only_promotes_init() {
        assert_eq!(on_setting_accepted(Init), Ready);
        assert_eq!(on_setting_accepted(Ready), Ready);
        assert_eq!(on_setting_accepted(Running), Running);
        assert_eq!(on_setting_accepted(Stopped), Stopped);
    }
}
