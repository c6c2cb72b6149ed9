//! Core transfer record, timestamps and the initiation draft
use super::error::TransferError;
use super::utils;
use chrono::{DateTime, TimeZone, Utc};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransferType {
    /// Hand the instrument to another TWNG member; they must accept.
    #[n(0)]
    ToMember,
    /// Instrument left the platform; unilateral, cancellable within a grace window.
    #[n(1)]
    OutsideTwng,
    /// Archive the instrument; unilateral, same grace window as OutsideTwng.
    #[n(2)]
    Delete,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransferStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Accepted,
    #[n(2)]
    Completed,
    #[n(3)]
    Declined,
    #[n(4)]
    Cancelled,
    #[n(5)]
    Expired,
}

impl TransferStatus {
    /// Terminal transfers are immutable; kept as an audit trail, never deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Declined
                | TransferStatus::Cancelled
                | TransferStatus::Expired
        )
    }
}

/// What happens to one category of the instrument's content when ownership changes.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum Disposition {
    /// Carry the content over as-is (identity stays visible).
    #[n(0)]
    Transfer,
    /// Carry over with the previous owner's identity stripped.
    #[n(1)]
    Anonymize,
    #[n(2)]
    Remove,
}

/// Per-category dispositions chosen by the sender at initiation time and
/// applied by the ownership mutator when the transfer completes.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub struct PrivacyOverrides {
    #[n(0)]
    pub identity: Disposition,
    #[n(1)]
    pub timeline_events: Disposition,
    #[n(2)]
    pub images: Disposition,
    #[n(3)]
    pub videos: Disposition,
    #[n(4)]
    pub story: Disposition,
}

impl Default for PrivacyOverrides {
    fn default() -> Self {
        Self {
            identity: Disposition::Transfer,
            timeline_events: Disposition::Transfer,
            images: Disposition::Transfer,
            videos: Disposition::Transfer,
            story: Disposition::Transfer,
        }
    }
}

/// A proposed or executed change of an instrument's ownership.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Transfer {
    #[n(0)]
    pub transfer_id: String,
    #[n(1)]
    pub instrument_id: String,
    #[n(2)]
    pub from_owner: String,
    /// Recipient; set exactly when `transfer_type` is [`TransferType::ToMember`].
    #[n(3)]
    pub to_owner: Option<String>,
    #[n(4)]
    pub transfer_type: TransferType,
    #[n(5)]
    pub status: TransferStatus,
    #[n(6)]
    pub privacy_overrides: PrivacyOverrides,
    /// Acceptance cutoff; set exactly when `transfer_type` is `ToMember`.
    #[n(7)]
    pub accept_deadline: Option<TimeStamp<Utc>>,
    /// Grace-window cutoff; set exactly when `transfer_type` is `OutsideTwng` or `Delete`.
    #[n(8)]
    pub cancel_deadline: Option<TimeStamp<Utc>>,
    /// Free text captured when a party declines or cancels.
    #[n(9)]
    pub reason: Option<String>,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    /// Set when the transfer reaches a terminal state.
    #[n(11)]
    pub resolved_at: Option<TimeStamp<Utc>>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// `Utc` itself carries no ordering, so these cannot be derived; timestamps
// order by their instant.
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_datetime_utc().cmp(&other.to_datetime_utc())
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn plus_days(&self, days: i64) -> Self {
        Self(self.0 + chrono::Duration::days(days))
    }
    pub fn plus_seconds(&self, secs: i64) -> Self {
        Self(self.0 + chrono::Duration::seconds(secs))
    }
}

/// Source of "now" for deadline computation and expiry checks. Injected into
/// the service so boundary behavior is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp<Utc> {
        TimeStamp::new()
    }
}

/// Draft for initiating a transfer. Built up by the caller, then finalised
/// into a pending [`Transfer`] once the field checks pass.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    instrument_id: Option<String>,
    transfer_type: Option<TransferType>,
    recipient: Option<String>,
    privacy_overrides: PrivacyOverrides,
    accept_deadline_days: i64,
    cancel_deadline_days: i64,
}

impl Default for TransferRequest {
    fn default() -> Self {
        Self {
            instrument_id: None,
            transfer_type: None,
            recipient: None,
            privacy_overrides: PrivacyOverrides::default(),
            accept_deadline_days: 7,
            cancel_deadline_days: 1,
        }
    }
}

impl TransferRequest {
    /// Construct a new draft with the default deadline offsets (7 days to
    /// accept, 24 hours to cancel).
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_instrument(mut self, instrument_id: &str) -> Self {
        self.instrument_id = Some(instrument_id.to_owned());
        self
    }
    pub fn set_transfer_type(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = Some(transfer_type);
        self
    }
    pub fn set_recipient(mut self, user_id: &str) -> Self {
        self.recipient = Some(user_id.to_owned());
        self
    }
    pub fn set_privacy_overrides(mut self, overrides: PrivacyOverrides) -> Self {
        self.privacy_overrides = overrides;
        self
    }
    pub fn set_accept_deadline_days(mut self, days: i64) -> Self {
        self.accept_deadline_days = days;
        self
    }
    pub fn set_cancel_deadline_days(mut self, days: i64) -> Self {
        self.cancel_deadline_days = days;
        self
    }

    /// Checks fields and recipient rules, then mints a pending transfer with
    /// the deadline matching its type.
    pub fn validate_and_finalise(
        &self,
        from_owner: &str,
        now: TimeStamp<Utc>,
    ) -> anyhow::Result<Transfer> {
        let Some(instrument_id) = self.instrument_id.clone() else {
            return Err(anyhow::Error::msg("Instrument is not set"));
        };
        let Some(transfer_type) = self.transfer_type else {
            return Err(anyhow::Error::msg("Transfer type is not set"));
        };
        if self.accept_deadline_days < 1 || self.cancel_deadline_days < 1 {
            return Err(anyhow::Error::msg("Deadline offsets must be at least one day"));
        }

        let to_owner = match transfer_type {
            TransferType::ToMember => match self.recipient.as_deref() {
                None => {
                    return Err(TransferError::InvalidRecipient(
                        "member transfers require a recipient".into(),
                    )
                    .into());
                }
                Some(recipient) if recipient == from_owner => {
                    return Err(TransferError::InvalidRecipient(
                        "recipient must differ from the sender".into(),
                    )
                    .into());
                }
                Some(recipient) => Some(recipient.to_owned()),
            },
            TransferType::OutsideTwng | TransferType::Delete => {
                if self.recipient.is_some() {
                    return Err(TransferError::InvalidRecipient(
                        "only member transfers take a recipient".into(),
                    )
                    .into());
                }
                None
            }
        };

        // Exactly one deadline is set, determined by the transfer type.
        let (accept_deadline, cancel_deadline) = match transfer_type {
            TransferType::ToMember => (Some(now.plus_days(self.accept_deadline_days)), None),
            TransferType::OutsideTwng | TransferType::Delete => {
                (None, Some(now.plus_days(self.cancel_deadline_days)))
            }
        };

        Ok(Transfer {
            transfer_id: utils::new_uuid_to_bech32("transfer")?,
            instrument_id,
            from_owner: from_owner.to_owned(),
            to_owner,
            transfer_type,
            status: TransferStatus::Pending,
            privacy_overrides: self.privacy_overrides,
            accept_deadline,
            cancel_deadline,
            reason: None,
            created_at: now,
            resolved_at: None,
        })
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn timestamps_order_by_instant() {
        let earlier = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
        let later = earlier.plus_seconds(1);

        assert!(later > earlier);
        assert!(earlier < later);
        assert!(earlier >= earlier.clone());
        assert_eq!(earlier.plus_seconds(1), later);

        let mut stamps = vec![later.clone(), earlier.clone()];
        stamps.sort();
        assert_eq!(stamps, vec![earlier, later]);
    }

    #[test]
    fn transfer_encoding() {
        let now = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
        let original = TransferRequest::new()
            .set_instrument("instr_x")
            .set_transfer_type(TransferType::ToMember)
            .set_recipient("user_b")
            .validate_and_finalise("user_a", now)
            .unwrap();

        let encoding = minicbor::to_vec(&original).unwrap();
        let decode: Transfer = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn member_request_requires_distinct_recipient() {
        let now = TimeStamp::new();

        let missing = TransferRequest::new()
            .set_instrument("instr_x")
            .set_transfer_type(TransferType::ToMember)
            .validate_and_finalise("user_a", now.clone());
        assert!(missing.is_err());

        let self_transfer = TransferRequest::new()
            .set_instrument("instr_x")
            .set_transfer_type(TransferType::ToMember)
            .set_recipient("user_a")
            .validate_and_finalise("user_a", now);
        assert!(self_transfer.is_err());
    }

    #[test]
    fn deadline_matches_transfer_type() {
        let now = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);

        let member = TransferRequest::new()
            .set_instrument("instr_x")
            .set_transfer_type(TransferType::ToMember)
            .set_recipient("user_b")
            .validate_and_finalise("user_a", now.clone())
            .unwrap();
        assert_eq!(member.accept_deadline, Some(now.plus_days(7)));
        assert_eq!(member.cancel_deadline, None);

        let outside = TransferRequest::new()
            .set_instrument("instr_x")
            .set_transfer_type(TransferType::OutsideTwng)
            .validate_and_finalise("user_a", now.clone())
            .unwrap();
        assert_eq!(outside.accept_deadline, None);
        assert_eq!(outside.cancel_deadline, Some(now.plus_days(1)));
    }
}
