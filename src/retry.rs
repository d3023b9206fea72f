use crate::{
    Error, ErrorKind,
    status::{ConditionType, Conditions, ManagedStatus, Phase},
};

/// What the router decided to do with a failed pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Mark the object progressing and look again shortly.
    Requeue,
    /// Mark the object invalid and wait for an outside change.
    Invalid,
    /// Leave status alone and hand the error back to the caller.
    Propagate,
}

impl Decision {
    pub fn requeue(&self) -> bool {
        matches!(self, Decision::Requeue)
    }
}

pub fn route(kind: ErrorKind) -> Decision {
    match kind {
        ErrorKind::SpecUpdate
        | ErrorKind::ResourceCreate
        | ErrorKind::ResourceUpdate
        | ErrorKind::ResourceWaiting => Decision::Requeue,
        ErrorKind::SpecInvalid | ErrorKind::ResourceInvalid => Decision::Invalid,
        ErrorKind::Unknown => Decision::Propagate,
    }
}

/// Applies the routing decision for `error` to `status`.
pub fn apply<St: ManagedStatus>(status: &mut St, error: &Error) -> Decision {
    let kind = error.kind();
    let decision = route(kind);
    let message = error.message();
    match decision {
        Decision::Requeue => {
            let conditions = status.conditions_mut();
            conditions.set(ConditionType::Progressing, true, kind.as_str(), &message);
            if conditions.is_true(ConditionType::Invalid) {
                conditions.set(ConditionType::Invalid, false, "", "");
            }
            status.set_phase(Phase::Progressing, Some(message));
        }
        Decision::Invalid => {
            let conditions = status.conditions_mut();
            conditions.set(ConditionType::Invalid, true, kind.as_str(), &message);
            if conditions.is_true(ConditionType::Progressing) {
                conditions.set(ConditionType::Progressing, false, "", "");
            }
            status.set_phase(Phase::Invalid, Some(message));
        }
        Decision::Propagate => {}
    }
    decision
}

/// Clears every transient condition after a fully successful pass.
pub fn converged<St: ManagedStatus>(status: &mut St) {
    let conditions = status.conditions_mut();
    for type_ in [
        ConditionType::Invalid,
        ConditionType::Progressing,
        ConditionType::Pending,
    ] {
        conditions.set(type_, false, "", "");
    }
    status.set_phase(Phase::Running, None);
}
