//! Pure decision logic for the transfer state machine.
//!
//! Holds no state and performs no I/O: given a transfer, an action, the actor
//! and the current time, decides whether the transition is legal and what the
//! target status is. Expiry lives here too, so every read path and every
//! mutating guard evaluates the same predicate.
use super::error::TransferError;
use super::transfer::{TimeStamp, Transfer, TransferStatus, TransferType};
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAction {
    Accept,
    Decline,
    Cancel,
    Complete,
}

/// Who is asking. `System` is the orchestrator itself, e.g. completing an
/// outside-platform transfer once its grace window has lapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor<'a> {
    User(&'a str),
    System,
}

/// A pending member transfer past its acceptance cutoff is expired. The
/// deadline is an upper bound: acceptance needs `now <= accept_deadline`,
/// expiry needs `now > accept_deadline`, so the two never both hold.
pub fn is_expired(transfer: &Transfer, now: &TimeStamp<Utc>) -> bool {
    transfer.status == TransferStatus::Pending
        && transfer.transfer_type == TransferType::ToMember
        && transfer
            .accept_deadline
            .as_ref()
            .is_some_and(|deadline| now > deadline)
}

/// Whether an outside-platform or delete transfer is past its cancel window.
pub fn grace_elapsed(transfer: &Transfer, now: &TimeStamp<Utc>) -> bool {
    transfer
        .cancel_deadline
        .as_ref()
        .is_some_and(|deadline| now > deadline)
}

/// Decide a single transition. Returns the target status on success; any
/// guard failure (wrong actor, wrong type, terminal status, deadline passed)
/// is a [`TransferError::StateConflict`].
pub fn authorize(
    transfer: &Transfer,
    action: TransferAction,
    actor: Actor<'_>,
    now: &TimeStamp<Utc>,
) -> Result<TransferStatus, TransferError> {
    if transfer.status.is_terminal() {
        return Err(conflict(transfer));
    }
    if is_expired(transfer, now) {
        return Err(conflict(transfer));
    }

    match action {
        TransferAction::Accept | TransferAction::Decline => {
            if transfer.transfer_type != TransferType::ToMember
                || transfer.status != TransferStatus::Pending
                || !actor_is(actor, transfer.to_owner.as_deref())
            {
                return Err(conflict(transfer));
            }
            Ok(match action {
                TransferAction::Accept => TransferStatus::Accepted,
                _ => TransferStatus::Declined,
            })
        }
        TransferAction::Cancel => {
            if transfer.status != TransferStatus::Pending
                || !actor_is(actor, Some(&transfer.from_owner))
            {
                return Err(conflict(transfer));
            }
            // Outside/delete transfers are only cancellable inside the grace window.
            if grace_elapsed(transfer, now) {
                return Err(conflict(transfer));
            }
            Ok(TransferStatus::Cancelled)
        }
        TransferAction::Complete => {
            match transfer.transfer_type {
                TransferType::ToMember => {
                    if transfer.status != TransferStatus::Accepted {
                        return Err(conflict(transfer));
                    }
                    let allowed = matches!(actor, Actor::System)
                        || actor_is(actor, transfer.to_owner.as_deref());
                    if !allowed {
                        return Err(conflict(transfer));
                    }
                }
                TransferType::OutsideTwng | TransferType::Delete => {
                    // Unilateral transfers complete once the grace window lapses.
                    if transfer.status != TransferStatus::Pending || !grace_elapsed(transfer, now)
                    {
                        return Err(conflict(transfer));
                    }
                }
            }
            Ok(TransferStatus::Completed)
        }
    }
}

/// Actions the given actor could take on the transfer right now.
pub fn legal_actions(
    transfer: &Transfer,
    actor: Actor<'_>,
    now: &TimeStamp<Utc>,
) -> Vec<TransferAction> {
    [
        TransferAction::Accept,
        TransferAction::Decline,
        TransferAction::Cancel,
        TransferAction::Complete,
    ]
    .into_iter()
    .filter(|action| authorize(transfer, *action, actor, now).is_ok())
    .collect()
}

fn actor_is(actor: Actor<'_>, user: Option<&str>) -> bool {
    match (actor, user) {
        (Actor::User(a), Some(u)) => a == u,
        _ => false,
    }
}

fn conflict(transfer: &Transfer) -> TransferError {
    TransferError::StateConflict {
        transfer_id: transfer.transfer_id.clone(),
        status: transfer.status,
    }
}
