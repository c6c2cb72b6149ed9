//! User-facing notification requests emitted on transfer state changes.
use super::error::TransferError;
use super::transfer::TimeStamp;
use super::utils;
use chrono::Utc;

const NOTIFICATIONS_TREE: &str = "notifications";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum NotificationKind {
    #[n(0)]
    TransferOffered,
    #[n(1)]
    TransferCompleted,
    #[n(2)]
    TransferDeclined,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Notification {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub kind: NotificationKind,
    #[n(2)]
    pub transfer_id: String,
    #[n(3)]
    pub instrument_id: String,
    /// Decline reason, when the counterparty gave one.
    #[n(4)]
    pub reason: Option<String>,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
}

/// Fire-and-forget delivery seam. The orchestrator logs and swallows
/// emission failures; they never abort the calling operation.
pub trait NotificationEmitter: Send + Sync {
    fn notify(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Sled-backed notification feed.
pub struct NotificationStore {
    tree: sled::Tree,
}

impl NotificationStore {
    pub fn open(db: &sled::Db) -> Result<Self, TransferError> {
        let tree = db.open_tree(NOTIFICATIONS_TREE)?;
        Ok(Self { tree })
    }

    /// All notifications addressed to a user, newest first.
    pub fn for_user(&self, user_id: &str) -> Result<Vec<Notification>, TransferError> {
        let mut matches = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let notification: Notification = minicbor::decode(bytes.as_ref())?;
            if notification.user_id == user_id {
                matches.push(notification);
            }
        }
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches)
    }
}

impl NotificationEmitter for NotificationStore {
    fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        let key = utils::new_uuid_to_bech32("notif")?;
        let bytes = minicbor::to_vec(&notification)?;
        self.tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }
}
