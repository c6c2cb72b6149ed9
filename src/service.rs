//! Service layer API for the ownership-transfer workflow.
//!
//! Each operation is a single unit of work: ask the policy engine whether the
//! transition is legal for the acting user at the current time, commit the new
//! status through the store's compare-and-set, then issue ownership-mutation
//! and notification requests. Nothing here retries; transient failures are
//! the caller's call.
use super::error::TransferError;
use super::notify::{Notification, NotificationEmitter, NotificationKind};
use super::ownership::OwnershipMutator;
use super::policy::{self, Actor, TransferAction};
use super::repository::{Direction, TransferStore};
use super::transfer::{Clock, SystemClock, TimeStamp, Transfer, TransferRequest, TransferStatus, TransferType};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TransferService {
    transfers: TransferStore,
    instruments: Arc<dyn OwnershipMutator>,
    notifier: Arc<dyn NotificationEmitter>,
    clock: Arc<dyn Clock>,
}

impl TransferService {
    pub fn new(
        db: Arc<sled::Db>,
        instruments: Arc<dyn OwnershipMutator>,
        notifier: Arc<dyn NotificationEmitter>,
    ) -> anyhow::Result<Self> {
        Self::with_clock(db, instruments, notifier, Arc::new(SystemClock))
    }

    /// Same as [`new`](Self::new) with an explicit time source, so deadline
    /// boundaries can be pinned in tests.
    pub fn with_clock(
        db: Arc<sled::Db>,
        instruments: Arc<dyn OwnershipMutator>,
        notifier: Arc<dyn NotificationEmitter>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let transfers = TransferStore::open(&db)?;
        Ok(Self {
            transfers,
            instruments,
            notifier,
            clock,
        })
    }

    /// Open a new transfer for an instrument the initiator currently owns.
    ///
    /// At most one non-terminal transfer may exist per instrument: the store
    /// takes a per-instrument reservation on insert, so of two racing
    /// initiations exactly one commits and the other fails with
    /// `TransferInProgress`.
    pub fn initiate(
        &self,
        request: TransferRequest,
        initiator: &str,
    ) -> anyhow::Result<Transfer> {
        let now = self.clock.now();

        // Expired holds must not block a new initiation.
        self.expire_overdue_transfers();

        let transfer = request.validate_and_finalise(initiator, now)?;

        let owner = self.instruments.owner_of(&transfer.instrument_id)?;
        if owner.as_deref() != Some(initiator) {
            return Err(TransferError::NotOwner {
                instrument_id: transfer.instrument_id,
                user_id: initiator.to_owned(),
            }
            .into());
        }

        self.transfers.insert(&transfer)?;
        debug!(transfer_id = %transfer.transfer_id, "transfer initiated");

        if let Some(recipient) = transfer.to_owner.as_deref() {
            self.emit(recipient, NotificationKind::TransferOffered, &transfer, None);
        }

        Ok(transfer)
    }

    /// Recipient accepts a pending member transfer. Acceptance and completion
    /// are one caller-visible action; the two transitions stay separate in
    /// the store so completion can become asynchronous later.
    pub fn accept(&self, transfer_id: &str, actor: &str) -> anyhow::Result<Transfer> {
        let now = self.clock.now();
        let transfer = self.transfers.get(transfer_id)?;

        self.guard(&transfer, TransferAction::Accept, Actor::User(actor), &now)?;

        let accepted = self
            .transfers
            .update_status(transfer_id, TransferStatus::Pending, |t| {
                t.status = TransferStatus::Accepted;
            })?;
        debug!(transfer_id, "transfer accepted");

        self.finish(accepted, now)
    }

    /// Recipient declines a pending member transfer, optionally with a reason
    /// shown to the sender.
    pub fn decline(
        &self,
        transfer_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> anyhow::Result<Transfer> {
        let now = self.clock.now();
        let transfer = self.transfers.get(transfer_id)?;

        self.guard(&transfer, TransferAction::Decline, Actor::User(actor), &now)?;

        let reason_owned = reason.map(str::to_owned);
        let resolved_at = now;
        let declined = self
            .transfers
            .update_status(transfer_id, TransferStatus::Pending, |t| {
                t.status = TransferStatus::Declined;
                t.reason = reason_owned;
                t.resolved_at = Some(resolved_at);
            })?;
        debug!(transfer_id, "transfer declined");

        self.emit(
            &declined.from_owner,
            NotificationKind::TransferDeclined,
            &declined,
            reason,
        );

        Ok(declined)
    }

    /// Sender withdraws a pending transfer; for outside-platform and delete
    /// transfers only within the grace window.
    pub fn cancel(
        &self,
        transfer_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> anyhow::Result<Transfer> {
        let now = self.clock.now();
        let transfer = self.transfers.get(transfer_id)?;

        self.guard(&transfer, TransferAction::Cancel, Actor::User(actor), &now)?;

        let reason_owned = reason.map(str::to_owned);
        let resolved_at = now;
        let cancelled = self
            .transfers
            .update_status(transfer_id, TransferStatus::Pending, |t| {
                t.status = TransferStatus::Cancelled;
                t.reason = reason_owned;
                t.resolved_at = Some(resolved_at);
            })?;
        debug!(transfer_id, "transfer cancelled");

        Ok(cancelled)
    }

    /// Apply the ownership mutation and mark the transfer completed. Legal
    /// for accepted member transfers, and for outside-platform/delete
    /// transfers once their grace window has lapsed.
    pub fn complete(&self, transfer_id: &str) -> anyhow::Result<Transfer> {
        let now = self.clock.now();
        let transfer = self.transfers.get(transfer_id)?;

        self.guard(&transfer, TransferAction::Complete, Actor::System, &now)?;

        self.finish(transfer, now)
    }

    /// Best-effort hygiene pass: rewrite every pending transfer past its
    /// acceptance cutoff to expired. Runs on every list fetch; failures are
    /// logged and swallowed so they never block the caller's primary task.
    pub fn expire_overdue_transfers(&self) -> Vec<Transfer> {
        let now = self.clock.now();
        match self.transfers.bulk_expire(&now) {
            Ok(expired) => {
                if !expired.is_empty() {
                    debug!(count = expired.len(), "expired overdue transfers");
                }
                expired
            }
            Err(e) => {
                warn!(error = %e, "overdue-transfer sweep failed");
                Vec::new()
            }
        }
    }

    /// Transfers where the user is sender or recipient, newest first, after
    /// the expiry sweep.
    pub fn transfers_for(
        &self,
        user_id: &str,
        direction: Direction,
    ) -> anyhow::Result<Vec<Transfer>> {
        self.expire_overdue_transfers();
        Ok(self.transfers.find_by_participant(user_id, direction)?)
    }

    /// Full transfer history of an instrument, newest first.
    pub fn transfer_history(&self, instrument_id: &str) -> anyhow::Result<Vec<Transfer>> {
        self.expire_overdue_transfers();
        Ok(self.transfers.find_by_instrument(instrument_id)?)
    }

    /// Fetch one transfer, persisting its expiry first if the deadline has
    /// silently passed since the last read.
    pub fn get(&self, transfer_id: &str) -> anyhow::Result<Transfer> {
        let now = self.clock.now();
        let transfer = self.transfers.get(transfer_id)?;
        Ok(self.persist_expiry(transfer, &now))
    }

    /// Policy check shared by the mutating operations. An overdue transfer is
    /// persisted as expired before the check, so the conflict the caller sees
    /// matches what the next read will show.
    fn guard(
        &self,
        transfer: &Transfer,
        action: TransferAction,
        actor: Actor<'_>,
        now: &TimeStamp<Utc>,
    ) -> Result<(), TransferError> {
        if policy::is_expired(transfer, now) {
            self.persist_expiry(transfer.clone(), now);
        }
        policy::authorize(transfer, action, actor, now)?;
        Ok(())
    }

    /// Ownership mutation first, status flip second: a mutation failure must
    /// not leave the transfer marked completed.
    fn finish(&self, transfer: Transfer, now: TimeStamp<Utc>) -> anyhow::Result<Transfer> {
        self.instruments
            .apply_privacy_overrides(&transfer.instrument_id, &transfer.privacy_overrides)?;

        match transfer.transfer_type {
            TransferType::ToMember => {
                let recipient = transfer.to_owner.as_deref().ok_or_else(|| {
                    TransferError::InvalidRecipient("member transfer without a recipient".into())
                })?;
                self.instruments
                    .reassign_owner(&transfer.instrument_id, Some(recipient))?;
            }
            TransferType::OutsideTwng => {
                self.instruments
                    .reassign_owner(&transfer.instrument_id, None)?;
            }
            TransferType::Delete => {
                self.instruments.archive_instrument(&transfer.instrument_id)?;
            }
        }

        let expected = match transfer.transfer_type {
            TransferType::ToMember => TransferStatus::Accepted,
            TransferType::OutsideTwng | TransferType::Delete => TransferStatus::Pending,
        };
        let resolved_at = now;
        let completed = self
            .transfers
            .update_status(&transfer.transfer_id, expected, |t| {
                t.status = TransferStatus::Completed;
                t.resolved_at = Some(resolved_at);
            })?;
        debug!(transfer_id = %completed.transfer_id, "transfer completed");

        if completed.transfer_type == TransferType::ToMember {
            self.emit(
                &completed.from_owner,
                NotificationKind::TransferCompleted,
                &completed,
                None,
            );
        }

        Ok(completed)
    }

    fn persist_expiry(&self, transfer: Transfer, now: &TimeStamp<Utc>) -> Transfer {
        if !policy::is_expired(&transfer, now) {
            return transfer;
        }
        let resolved_at = now.clone();
        match self
            .transfers
            .update_status(&transfer.transfer_id, TransferStatus::Pending, |t| {
                t.status = TransferStatus::Expired;
                t.resolved_at = Some(resolved_at);
            }) {
            Ok(expired) => expired,
            // A racing writer already resolved it; the stored record wins.
            Err(_) => self.transfers.get(&transfer.transfer_id).unwrap_or(transfer),
        }
    }

    fn emit(
        &self,
        user_id: &str,
        kind: NotificationKind,
        transfer: &Transfer,
        reason: Option<&str>,
    ) {
        let notification = Notification {
            user_id: user_id.to_owned(),
            kind,
            transfer_id: transfer.transfer_id.clone(),
            instrument_id: transfer.instrument_id.clone(),
            reason: reason.map(str::to_owned),
            created_at: self.clock.now(),
        };
        if let Err(e) = self.notifier.notify(notification) {
            warn!(error = %e, "notification emission failed");
        }
    }
}
