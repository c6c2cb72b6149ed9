use anyhow::Context;
use chrono::Utc;
use sled::open;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use twng_transfers::error::TransferError;
use twng_transfers::notify::{NotificationKind, NotificationStore};
use twng_transfers::ownership::InstrumentStore;
use twng_transfers::repository::Direction;
use twng_transfers::service::TransferService;
use twng_transfers::transfer::{
    Clock, Disposition, PrivacyOverrides, TimeStamp, TransferRequest, TransferStatus, TransferType,
};
use twng_transfers::utils;

/// Controllable time source so deadline-sensitive flows can be replayed.
struct ManualClock(Mutex<TimeStamp<Utc>>);

impl ManualClock {
    fn starting_at(now: TimeStamp<Utc>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(now)))
    }
    fn set(&self, now: TimeStamp<Utc>) {
        *self.0.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp<Utc> {
        self.0.lock().unwrap().clone()
    }
}

struct Fixture {
    // Held so the temp dir outlives the sled db.
    _temp_dir: TempDir,
    service: TransferService,
    instruments: Arc<InstrumentStore>,
    notifications: Arc<NotificationStore>,
    clock: Arc<ManualClock>,
}

/// Sled uses file-based locking to prevent concurrent access, so each test
/// gets its own database under a temp dir, same as the teacher of this
/// pattern: cleanup is free and tests stay independent.
fn fixture(db_name: &str, now: TimeStamp<Utc>) -> anyhow::Result<Fixture> {
    let temp_dir = tempfile::tempdir()?;
    let db = open(temp_dir.path().join(db_name))?;
    let db = Arc::new(db);
    db.clear()?;

    let instruments = Arc::new(InstrumentStore::open(&db)?);
    let notifications = Arc::new(NotificationStore::open(&db)?);
    let clock = ManualClock::starting_at(now);
    let service = TransferService::with_clock(
        db,
        instruments.clone(),
        notifications.clone(),
        clock.clone(),
    )?;

    Ok(Fixture {
        _temp_dir: temp_dir,
        service,
        instruments,
        notifications,
        clock,
    })
}

fn member_request(instrument_id: &str, recipient: &str) -> TransferRequest {
    TransferRequest::new()
        .set_instrument(instrument_id)
        .set_transfer_type(TransferType::ToMember)
        .set_recipient(recipient)
}

#[test]
fn member_transfer_roundtrip() -> anyhow::Result<()> {
    let now = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
    let fx = fixture("member_roundtrip.db", now.clone())?;

    let sender = utils::new_uuid_to_bech32("user")?;
    let recipient = utils::new_uuid_to_bech32("user")?;
    let instrument_id = utils::new_uuid_to_bech32("instr")?;
    fx.instruments.create(&instrument_id, &sender)?;

    let transfer = fx
        .service
        .initiate(member_request(&instrument_id, &recipient), &sender)
        .context("Transfer failed on initiate: ")?;

    assert_eq!(transfer.status, TransferStatus::Pending);
    assert_eq!(transfer.accept_deadline, Some(now.plus_days(7)));
    assert_eq!(transfer.cancel_deadline, None);

    // The recipient is told there is something to accept.
    let offered = fx.notifications.for_user(&recipient)?;
    assert_eq!(offered.len(), 1);
    assert_eq!(offered[0].kind, NotificationKind::TransferOffered);

    // Accepting on day 3 completes in the same caller-visible action.
    fx.clock.set(now.plus_days(3));
    let completed = fx
        .service
        .accept(&transfer.transfer_id, &recipient)
        .context("Transfer failed on accept: ")?;

    assert_eq!(completed.status, TransferStatus::Completed);
    assert!(completed.resolved_at.is_some());
    assert_eq!(
        fx.instruments.get(&instrument_id)?.current_owner.as_deref(),
        Some(recipient.as_str())
    );

    let sender_feed = fx.notifications.for_user(&sender)?;
    assert_eq!(sender_feed.len(), 1);
    assert_eq!(sender_feed[0].kind, NotificationKind::TransferCompleted);

    // The previous owner no longer owns the instrument and cannot re-initiate.
    let err = fx
        .service
        .initiate(member_request(&instrument_id, &recipient), &sender)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TransferError>(),
        Some(TransferError::NotOwner { .. })
    ));

    Ok(())
}

#[test]
fn outside_transfer_cancel_within_grace_window() -> anyhow::Result<()> {
    let now = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
    let fx = fixture("outside_cancel.db", now.clone())?;

    let sender = utils::new_uuid_to_bech32("user")?;
    let instrument_id = utils::new_uuid_to_bech32("instr")?;
    fx.instruments.create(&instrument_id, &sender)?;

    let transfer = fx.service.initiate(
        TransferRequest::new()
            .set_instrument(&instrument_id)
            .set_transfer_type(TransferType::OutsideTwng),
        &sender,
    )?;
    assert_eq!(transfer.cancel_deadline, Some(now.plus_days(1)));
    assert_eq!(transfer.accept_deadline, None);

    // Two hours in, still inside the 24h window.
    fx.clock.set(now.plus_seconds(2 * 60 * 60));
    let cancelled = fx
        .service
        .cancel(&transfer.transfer_id, &sender, Some("changed my mind"))?;

    assert_eq!(cancelled.status, TransferStatus::Cancelled);
    assert_eq!(cancelled.reason.as_deref(), Some("changed my mind"));
    assert_eq!(
        fx.instruments.get(&instrument_id)?.current_owner.as_deref(),
        Some(sender.as_str())
    );

    // Terminal transfers are immutable; a second cancel is a conflict.
    let err = fx
        .service
        .cancel(&transfer.transfer_id, &sender, None)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TransferError>(),
        Some(TransferError::StateConflict { .. })
    ));

    Ok(())
}

#[test]
fn outside_transfer_completes_after_grace_window() -> anyhow::Result<()> {
    let now = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
    let fx = fixture("outside_complete.db", now.clone())?;

    let sender = utils::new_uuid_to_bech32("user")?;
    let instrument_id = utils::new_uuid_to_bech32("instr")?;
    fx.instruments.create(&instrument_id, &sender)?;

    let transfer = fx.service.initiate(
        TransferRequest::new()
            .set_instrument(&instrument_id)
            .set_transfer_type(TransferType::OutsideTwng)
            .set_privacy_overrides(PrivacyOverrides {
                identity: Disposition::Anonymize,
                story: Disposition::Remove,
                ..PrivacyOverrides::default()
            }),
        &sender,
    )?;

    // Completion is not legal inside the window.
    let err = fx.service.complete(&transfer.transfer_id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TransferError>(),
        Some(TransferError::StateConflict { .. })
    ));

    fx.clock.set(now.plus_days(1).plus_seconds(1));

    // The sender missed the window.
    let err = fx
        .service
        .cancel(&transfer.transfer_id, &sender, None)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TransferError>(),
        Some(TransferError::StateConflict { .. })
    ));

    let completed = fx.service.complete(&transfer.transfer_id)?;
    assert_eq!(completed.status, TransferStatus::Completed);

    let instrument = fx.instruments.get(&instrument_id)?;
    assert_eq!(instrument.current_owner, None);
    assert!(!instrument.archived);
    assert_eq!(
        instrument.applied_overrides.map(|o| o.identity),
        Some(Disposition::Anonymize)
    );

    Ok(())
}

#[test]
fn delete_transfer_archives_instrument() -> anyhow::Result<()> {
    let now = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
    let fx = fixture("delete_archive.db", now.clone())?;

    let sender = utils::new_uuid_to_bech32("user")?;
    let instrument_id = utils::new_uuid_to_bech32("instr")?;
    fx.instruments.create(&instrument_id, &sender)?;

    let transfer = fx.service.initiate(
        TransferRequest::new()
            .set_instrument(&instrument_id)
            .set_transfer_type(TransferType::Delete),
        &sender,
    )?;

    fx.clock.set(now.plus_days(1).plus_seconds(1));
    let completed = fx.service.complete(&transfer.transfer_id)?;
    assert_eq!(completed.status, TransferStatus::Completed);

    let instrument = fx.instruments.get(&instrument_id)?;
    assert!(instrument.archived);
    assert_eq!(instrument.current_owner, None);

    Ok(())
}

#[test]
fn decline_with_reason_notifies_sender() -> anyhow::Result<()> {
    let now = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
    let fx = fixture("decline_reason.db", now)?;

    let sender = utils::new_uuid_to_bech32("user")?;
    let recipient = utils::new_uuid_to_bech32("user")?;
    let instrument_id = utils::new_uuid_to_bech32("instr")?;
    fx.instruments.create(&instrument_id, &sender)?;

    let transfer = fx
        .service
        .initiate(member_request(&instrument_id, &recipient), &sender)?;

    let declined = fx
        .service
        .decline(&transfer.transfer_id, &recipient, Some("not my guitar"))?;

    assert_eq!(declined.status, TransferStatus::Declined);
    assert_eq!(declined.reason.as_deref(), Some("not my guitar"));
    assert_eq!(
        fx.instruments.get(&instrument_id)?.current_owner.as_deref(),
        Some(sender.as_str())
    );

    let sender_feed = fx.notifications.for_user(&sender)?;
    assert_eq!(sender_feed.len(), 1);
    assert_eq!(sender_feed[0].kind, NotificationKind::TransferDeclined);
    assert_eq!(sender_feed[0].reason.as_deref(), Some("not my guitar"));

    Ok(())
}

#[test]
fn second_initiation_blocked_while_one_is_outstanding() -> anyhow::Result<()> {
    let now = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
    let fx = fixture("in_progress.db", now)?;

    let sender = utils::new_uuid_to_bech32("user")?;
    let recipient = utils::new_uuid_to_bech32("user")?;
    let other_recipient = utils::new_uuid_to_bech32("user")?;
    let instrument_id = utils::new_uuid_to_bech32("instr")?;
    fx.instruments.create(&instrument_id, &sender)?;

    fx.service
        .initiate(member_request(&instrument_id, &recipient), &sender)?;

    let err = fx
        .service
        .initiate(member_request(&instrument_id, &other_recipient), &sender)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TransferError>(),
        Some(TransferError::TransferInProgress(_))
    ));

    Ok(())
}

#[test]
fn participant_listings_split_by_direction() -> anyhow::Result<()> {
    let now = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
    let fx = fixture("listings.db", now)?;

    let sender = utils::new_uuid_to_bech32("user")?;
    let recipient = utils::new_uuid_to_bech32("user")?;
    let instrument_id = utils::new_uuid_to_bech32("instr")?;
    fx.instruments.create(&instrument_id, &sender)?;

    let transfer = fx
        .service
        .initiate(member_request(&instrument_id, &recipient), &sender)?;

    let outgoing = fx.service.transfers_for(&sender, Direction::Outgoing)?;
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].transfer_id, transfer.transfer_id);

    let incoming = fx.service.transfers_for(&recipient, Direction::Incoming)?;
    assert_eq!(incoming.len(), 1);

    assert!(fx.service.transfers_for(&sender, Direction::Incoming)?.is_empty());
    assert!(fx.service.transfers_for(&recipient, Direction::Outgoing)?.is_empty());

    let history = fx.service.transfer_history(&instrument_id)?;
    assert_eq!(history.len(), 1);

    Ok(())
}
