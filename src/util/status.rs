use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

use crate::api::v1alpha1::NonAdminPhase;

/// Sets the corresponding condition in conditions to new_condition, in place,
/// and returns whether anything was changed.
///
/// 1. If a condition of the specified type already exists, its fields are
///    updated from new_condition. LastTransitionTime is reset only when the
///    status value actually flips.
/// 2. If no condition of the specified type exists, LastTransitionTime is set
///    to now and new_condition is appended.
pub fn set_status_condition(conditions: &mut Vec<Condition>, mut new_condition: Condition) -> bool {
    let mut changed = false;

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new_condition.type_) {
        if existing.status != new_condition.status {
            existing.status = new_condition.status;
            existing.last_transition_time = Time(Utc::now());
            changed = true;
        }
        if existing.reason != new_condition.reason {
            existing.reason = new_condition.reason;
            changed = true;
        }
        if existing.message != new_condition.message {
            existing.message = new_condition.message;
            changed = true;
        }
        if existing.observed_generation != new_condition.observed_generation {
            existing.observed_generation = new_condition.observed_generation;
            changed = true;
        }
    } else {
        new_condition.last_transition_time = Time(Utc::now());
        conditions.push(new_condition);
        changed = true;
    }

    changed
}

/// Builds a condition for [`set_status_condition`]. The transition time is
/// stamped here and only kept by the setter when the status value flips.
pub fn new_condition(condition_type: &str, status: bool, reason: &str, message: &str) -> Condition {
    Condition {
        type_: condition_type.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

/// Finds the condition_type in conditions.
pub fn find_status_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.type_ == condition_type)
}

/// Returns true when the condition_type is present and set to `True`
pub fn is_status_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .any(|condition| condition.type_ == condition_type && condition.status == "True")
}

/// Applies a phase transition in place, returning whether the phase changed.
///
/// Transitions follow a one-way lifecycle:
///
/// ```text
/// (unset) -> New -> Created -> Deleting
///               \-> BackingOff -> Deleting
/// ```
///
/// A transition not on this graph leaves the phase untouched. The surrounding
/// condition carries the failure signal in that case.
pub fn update_phase(phase: &mut Option<NonAdminPhase>, new_phase: NonAdminPhase) -> bool {
    if !phase_transition_allowed(*phase, new_phase) {
        return false;
    }
    *phase = Some(new_phase);
    true
}

fn phase_transition_allowed(from: Option<NonAdminPhase>, to: NonAdminPhase) -> bool {
    use NonAdminPhase::*;
    match (from, to) {
        (None, _) => true,
        (Some(current), next) if current == next => false,
        (Some(New), Created) | (Some(New), BackingOff) => true,
        (Some(New), Deleting) => true,
        (Some(Created), Deleting) | (Some(BackingOff), Deleting) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(type_: &str, status: &str, reason: &str, message: &str) -> Condition {
        Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Time(Utc::now()),
            observed_generation: None,
        }
    }

    #[test]
    fn set_condition_appends_and_updates() {
        let mut conditions = Vec::new();

        assert!(set_status_condition(
            &mut conditions,
            condition("Accepted", "True", "BackupAccepted", "backup accepted"),
        ));
        assert_eq!(conditions.len(), 1);

        // same content again is a no-op
        assert!(!set_status_condition(
            &mut conditions,
            condition("Accepted", "True", "BackupAccepted", "backup accepted"),
        ));

        let before = conditions[0].last_transition_time.clone();
        assert!(set_status_condition(
            &mut conditions,
            condition("Accepted", "False", "InvalidBackupSpec", "bad spec"),
        ));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "False");
        assert!(conditions[0].last_transition_time.0 >= before.0);
    }

    #[test]
    fn transition_time_kept_when_only_message_changes() {
        let mut conditions = vec![condition("Queued", "True", "BackupScheduled", "queued")];
        let before = conditions[0].last_transition_time.clone();

        assert!(set_status_condition(
            &mut conditions,
            condition("Queued", "True", "BackupScheduled", "still queued"),
        ));
        assert_eq!(conditions[0].last_transition_time, before);
    }

    #[test]
    fn condition_lookups() {
        let conditions = vec![
            condition("Accepted", "True", "BackupAccepted", "ok"),
            condition("Queued", "False", "Pending", "not yet"),
        ];
        assert!(is_status_condition_true(&conditions, "Accepted"));
        assert!(!is_status_condition_true(&conditions, "Queued"));
        assert!(find_status_condition(&conditions, "Deleting").is_none());
    }

    #[test]
    fn phase_lifecycle_is_one_way() {
        use NonAdminPhase::*;

        let mut phase = None;
        assert!(update_phase(&mut phase, New));
        assert_eq!(phase, Some(New));

        // same phase is a no-op
        assert!(!update_phase(&mut phase, New));

        assert!(update_phase(&mut phase, Created));
        // no going backwards once created
        assert!(!update_phase(&mut phase, New));
        assert!(!update_phase(&mut phase, BackingOff));

        assert!(update_phase(&mut phase, Deleting));
        assert!(!update_phase(&mut phase, Created));
        assert_eq!(phase, Some(Deleting));
    }

    #[test]
    fn backing_off_only_proceeds_to_deleting() {
        use NonAdminPhase::*;

        let mut phase = Some(New);
        assert!(update_phase(&mut phase, BackingOff));
        assert!(!update_phase(&mut phase, Created));
        assert!(update_phase(&mut phase, Deleting));
    }
}
