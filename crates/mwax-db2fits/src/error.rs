use mwax_db2fits_common::{ascii_header::HeaderError, protocol::RingError};
use thiserror::Error;

/// Everything that can abort a sub-observation (and, for most variants,
/// the process). See the propagation rules on each variant.
#[derive(Error, Debug)]
pub enum DbfitsError {
    #[error("startup error: {0}")]
    Startup(String),

    #[error("required header key {0} is missing")]
    MissingHeaderKey(String),

    #[error("header key {0} has an invalid value")]
    InvalidHeaderValue(String),

    #[error("header invariant violated: {name} = {value}")]
    InvariantViolated { name: &'static str, value: String },

    #[error(
        "OBS_OFFSET is not contiguous: expected {expected}, got {got} \
         (obs {obs_id}, secs_per_subobs {secs_per_subobs})"
    )]
    OffsetNotContiguous {
        obs_id: u64,
        expected: i32,
        got: i32,
        secs_per_subobs: i32,
    },

    #[error("HDU size mismatch: wrote {wrote} bytes, expected {expected}")]
    HduSizeMismatch { wrote: u64, expected: u64 },

    #[error("FITS I/O error: {0}")]
    FitsIo(#[from] fitsio::errors::Error),

    #[error("ring buffer error: {0}")]
    RingBuffer(#[from] RingError),

    #[error("ring protocol violation: expected {expected}, found {found}")]
    RingProtocol { expected: String, found: String },

    #[error("block of {got} bytes is smaller than one integration ({needed} bytes)")]
    BlockTooSmall { got: u64, needed: u64 },

    #[error("sub-observation closed mid integration set: {duration}s is not a multiple of {secs_per_subobs}s")]
    SubobsIncomplete { duration: i32, secs_per_subobs: i32 },

    #[error("could not resolve an IPv4 address for interface {0}")]
    NoInterfaceAddress(String),

    #[error("health socket error: {0}")]
    HealthSocket(#[source] std::io::Error),

    #[error("could not send health datagram: {0}")]
    HealthSendFailed(#[source] std::io::Error),
}

impl From<HeaderError> for DbfitsError {
    fn from(e: HeaderError) -> Self {
        match e {
            HeaderError::MissingKey { key } => DbfitsError::MissingHeaderKey(key),
            HeaderError::InvalidValue { key, .. } => DbfitsError::InvalidHeaderValue(key),
            HeaderError::NotText => DbfitsError::InvalidHeaderValue("<header page>".into()),
        }
    }
}
