use super::transfer::TransferStatus;

#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("user {user_id} does not currently own instrument {instrument_id}")]
    NotOwner {
        instrument_id: String,
        user_id: String,
    },
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("instrument {0} already has a transfer in progress")]
    TransferInProgress(String),
    #[error("transfer {transfer_id} does not allow this action in status {status:?}")]
    StateConflict {
        transfer_id: String,
        status: TransferStatus,
    },
    #[error("record {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Repository(#[from] sled::Error),
    #[error(transparent)]
    Decode(#[from] minicbor::decode::Error),
    #[error(transparent)]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
}
