//! Sled-backed persistence for transfer records.
//!
//! Status mutations go through [`TransferStore::update_status`], a
//! compare-and-set against the expected current status: two racing callers
//! resolve deterministically, the first to commit wins and the second gets a
//! `StateConflict`. Blind overwrites are never performed.
use super::error::TransferError;
use super::policy;
use super::transfer::{TimeStamp, Transfer, TransferStatus};
use chrono::Utc;

const TRANSFERS_TREE: &str = "transfers";
const HOLDS_TREE: &str = "transfer_holds";

/// Which side of a transfer a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

pub struct TransferStore {
    tree: sled::Tree,
    // One slot per instrument, held by the id of its open transfer.
    holds: sled::Tree,
}

impl TransferStore {
    pub fn open(db: &sled::Db) -> Result<Self, TransferError> {
        let tree = db.open_tree(TRANSFERS_TREE)?;
        let holds = db.open_tree(HOLDS_TREE)?;
        Ok(Self { tree, holds })
    }

    /// Persist a freshly initiated transfer, reserving its instrument first.
    /// Fails with `TransferInProgress` while another non-terminal transfer
    /// holds the reservation, so of two racing initiations exactly one wins.
    pub fn insert(&self, transfer: &Transfer) -> Result<(), TransferError> {
        let bytes = minicbor::to_vec(transfer)?;
        self.reserve_instrument(&transfer.instrument_id, &transfer.transfer_id)?;
        if let Err(e) = self.tree.insert(transfer.transfer_id.as_bytes(), bytes) {
            let _ = self.release_instrument(&transfer.instrument_id, &transfer.transfer_id);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn find_by_id(&self, transfer_id: &str) -> Result<Option<Transfer>, TransferError> {
        match self.tree.get(transfer_id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Like [`find_by_id`](Self::find_by_id) but missing records are an error.
    pub fn get(&self, transfer_id: &str) -> Result<Transfer, TransferError> {
        self.find_by_id(transfer_id)?
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_owned()))
    }

    /// Transfers where the user is sender (outgoing) or recipient (incoming),
    /// newest first.
    pub fn find_by_participant(
        &self,
        user_id: &str,
        direction: Direction,
    ) -> Result<Vec<Transfer>, TransferError> {
        self.scan(|transfer| match direction {
            Direction::Outgoing => transfer.from_owner == user_id,
            Direction::Incoming => transfer.to_owner.as_deref() == Some(user_id),
        })
    }

    /// Full transfer history of one instrument, newest first.
    pub fn find_by_instrument(&self, instrument_id: &str) -> Result<Vec<Transfer>, TransferError> {
        self.scan(|transfer| transfer.instrument_id == instrument_id)
    }

    /// Compare-and-set status mutation. Fails with `StateConflict` when the
    /// stored status is not `expected`, or when another writer committed
    /// between our read and the swap.
    pub fn update_status<F>(
        &self,
        transfer_id: &str,
        expected: TransferStatus,
        apply: F,
    ) -> Result<Transfer, TransferError>
    where
        F: FnOnce(&mut Transfer),
    {
        let key = transfer_id.as_bytes();
        let old_bytes = self
            .tree
            .get(key)?
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_owned()))?;
        let mut transfer: Transfer = minicbor::decode(old_bytes.as_ref())?;

        if transfer.status != expected {
            return Err(TransferError::StateConflict {
                transfer_id: transfer_id.to_owned(),
                status: transfer.status,
            });
        }

        apply(&mut transfer);
        let new_bytes = minicbor::to_vec(&transfer)?;

        self.tree
            .compare_and_swap(key, Some(&old_bytes), Some(new_bytes))?
            .map_err(|_| TransferError::StateConflict {
                transfer_id: transfer_id.to_owned(),
                status: expected,
            })?;

        // A transfer leaving the non-terminal states gives the instrument back.
        if transfer.status.is_terminal() {
            self.release_instrument(&transfer.instrument_id, &transfer.transfer_id)?;
        }

        Ok(transfer)
    }

    /// Claim the instrument's reservation slot for one open transfer. Taken
    /// with a compare-and-swap against an empty slot, the same discipline as
    /// [`update_status`](Self::update_status).
    fn reserve_instrument(
        &self,
        instrument_id: &str,
        transfer_id: &str,
    ) -> Result<(), TransferError> {
        self.holds
            .compare_and_swap(
                instrument_id.as_bytes(),
                None::<&[u8]>,
                Some(transfer_id.as_bytes()),
            )?
            .map_err(|_| TransferError::TransferInProgress(instrument_id.to_owned()))
    }

    /// Clear the reservation when its transfer goes terminal. Guarded by the
    /// holder's id; a mismatch means another transfer owns the slot and is
    /// left alone.
    fn release_instrument(
        &self,
        instrument_id: &str,
        transfer_id: &str,
    ) -> Result<(), TransferError> {
        let _ = self.holds.compare_and_swap(
            instrument_id.as_bytes(),
            Some(transfer_id.as_bytes()),
            None::<&[u8]>,
        )?;
        Ok(())
    }

    /// Rewrite every pending transfer past its acceptance cutoff to expired.
    /// Idempotent; a record another writer resolved in the meantime is skipped.
    pub fn bulk_expire(&self, now: &TimeStamp<Utc>) -> Result<Vec<Transfer>, TransferError> {
        let overdue = self.scan(|transfer| policy::is_expired(transfer, now))?;

        let mut expired = Vec::with_capacity(overdue.len());
        for transfer in overdue {
            let resolved_at = now.clone();
            match self.update_status(&transfer.transfer_id, TransferStatus::Pending, |t| {
                t.status = TransferStatus::Expired;
                t.resolved_at = Some(resolved_at);
            }) {
                Ok(updated) => expired.push(updated),
                Err(TransferError::StateConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    fn scan<P>(&self, predicate: P) -> Result<Vec<Transfer>, TransferError>
    where
        P: Fn(&Transfer) -> bool,
    {
        let mut matches = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let transfer: Transfer = minicbor::decode(bytes.as_ref())?;
            if predicate(&transfer) {
                matches.push(transfer);
            }
        }
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches)
    }
}
