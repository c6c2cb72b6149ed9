//! Instrument ownership records and the mutation seam the orchestrator
//! drives when a transfer completes.
use super::error::TransferError;
use super::transfer::PrivacyOverrides;

const INSTRUMENTS_TREE: &str = "instruments";

/// Applies the actual ownership change and the per-category privacy
/// dispositions. The content stores themselves (timeline, media, story) live
/// outside this crate, so implementations decide what anonymize/remove mean
/// for each category.
pub trait OwnershipMutator: Send + Sync {
    fn owner_of(&self, instrument_id: &str) -> anyhow::Result<Option<String>>;
    /// `None` marks the instrument as owned outside the platform.
    fn reassign_owner(&self, instrument_id: &str, new_owner: Option<&str>) -> anyhow::Result<()>;
    fn archive_instrument(&self, instrument_id: &str) -> anyhow::Result<()>;
    fn apply_privacy_overrides(
        &self,
        instrument_id: &str,
        overrides: &PrivacyOverrides,
    ) -> anyhow::Result<()>;
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Instrument {
    #[n(0)]
    pub instrument_id: String,
    /// `None` once the instrument has left the platform.
    #[n(1)]
    pub current_owner: Option<String>,
    #[n(2)]
    pub archived: bool,
    /// Dispositions applied at the most recent completed transfer.
    #[n(3)]
    pub applied_overrides: Option<PrivacyOverrides>,
}

pub struct InstrumentStore {
    tree: sled::Tree,
}

impl InstrumentStore {
    pub fn open(db: &sled::Db) -> Result<Self, TransferError> {
        let tree = db.open_tree(INSTRUMENTS_TREE)?;
        Ok(Self { tree })
    }

    pub fn create(&self, instrument_id: &str, owner: &str) -> Result<Instrument, TransferError> {
        let instrument = Instrument {
            instrument_id: instrument_id.to_owned(),
            current_owner: Some(owner.to_owned()),
            archived: false,
            applied_overrides: None,
        };
        self.put(&instrument)?;
        Ok(instrument)
    }

    pub fn get(&self, instrument_id: &str) -> Result<Instrument, TransferError> {
        match self.tree.get(instrument_id.as_bytes())? {
            Some(bytes) => Ok(minicbor::decode(bytes.as_ref())?),
            None => Err(TransferError::NotFound(instrument_id.to_owned())),
        }
    }

    fn put(&self, instrument: &Instrument) -> Result<(), TransferError> {
        let bytes = minicbor::to_vec(instrument)?;
        self.tree.insert(instrument.instrument_id.as_bytes(), bytes)?;
        Ok(())
    }
}

impl OwnershipMutator for InstrumentStore {
    fn owner_of(&self, instrument_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.get(instrument_id)?.current_owner)
    }

    fn reassign_owner(&self, instrument_id: &str, new_owner: Option<&str>) -> anyhow::Result<()> {
        let mut instrument = self.get(instrument_id)?;
        instrument.current_owner = new_owner.map(str::to_owned);
        self.put(&instrument)?;
        Ok(())
    }

    fn archive_instrument(&self, instrument_id: &str) -> anyhow::Result<()> {
        let mut instrument = self.get(instrument_id)?;
        instrument.current_owner = None;
        instrument.archived = true;
        self.put(&instrument)?;
        Ok(())
    }

    fn apply_privacy_overrides(
        &self,
        instrument_id: &str,
        overrides: &PrivacyOverrides,
    ) -> anyhow::Result<()> {
        let mut instrument = self.get(instrument_id)?;
        instrument.applied_overrides = Some(*overrides);
        self.put(&instrument)?;
        Ok(())
    }
}
