use std::fmt;

#[cfg(unix)]
use tracing::{debug, warn};

#[cfg(unix)]
use crate::ring_reader::RingReader;
use crate::protocol::{Kind, RingError};

/// What the client wants done with the sub-observation that was just opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Dispatch every data block to the client.
    Accept,
    /// Voltage capture mode: consume the transfer without dispatching.
    SkipBlockDuringVcs,
    /// Idle mode: consume the transfer without dispatching.
    SkipBlockDuringNoCapture,
    /// Stop reading entirely; the process is shutting down.
    Quit,
}

/// The callback contract between the ring buffer and the FITS writer.
/// One `on_open`, then one `on_block` per integration, then one `on_close`
/// per sub-observation transfer. All state lives on the implementor.
pub trait RingClient {
    type Error: std::error::Error + Send + Sync + 'static;

    fn on_open(&mut self, header: &[u8]) -> Result<Acceptance, Self::Error>;

    /// Returns the number of bytes written (or consumed, for skipped
    /// observations). The block is borrowed only for this call.
    fn on_block(&mut self, block: &[u8], block_id: u64) -> Result<u64, Self::Error>;

    fn on_close(&mut self, total_bytes: u64) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The whole sub-observation was dispatched and closed.
    Completed { bytes_written: u64 },
    /// The transfer was consumed without writes (VCS / NO_CAPTURE).
    Skimmed,
    /// The client asked to stop (MODE=QUIT).
    Quit,
    /// The quit flag fired while waiting for data.
    Interrupted,
}

#[derive(Debug)]
pub enum SessionError<E> {
    Ring(RingError),
    Client(E),
    /// The producer broke the header / data / end-of-data sequence.
    Protocol { expected: Kind, found: Kind },
}

impl<E: fmt::Display> fmt::Display for SessionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Ring(e) => write!(f, "ring buffer error: {e}"),
            SessionError::Client(e) => write!(f, "client error: {e}"),
            SessionError::Protocol { expected, found } => {
                write!(f, "ring protocol error: expected {expected:?}, found {found:?}")
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for SessionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Ring(e) => Some(e),
            SessionError::Client(e) => Some(e),
            SessionError::Protocol { .. } => None,
        }
    }
}

impl<E> From<RingError> for SessionError<E> {
    fn from(e: RingError) -> Self {
        SessionError::Ring(e)
    }
}

/// Drive one sub-observation transfer through the client callbacks.
///
/// Blocks (bounded poll) until the producer publishes the header record;
/// `should_quit` is checked between records so shutdown never waits on the
/// upstream correlator.
#[cfg(unix)]
pub fn run_transfer<C: RingClient>(
    reader: &mut RingReader,
    client: &mut C,
    should_quit: &mut dyn FnMut() -> bool,
) -> Result<TransferOutcome, SessionError<C::Error>> {
    let Some(meta) = reader.wait_next(should_quit)? else {
        return Ok(TransferOutcome::Interrupted);
    };

    if meta.kind != Kind::SubobsHeader {
        return Err(SessionError::Protocol {
            expected: Kind::SubobsHeader,
            found: meta.kind,
        });
    }

    let acceptance = {
        let header = reader.payload(&meta);
        client.on_open(header).map_err(SessionError::Client)
    };
    reader.release(&meta);
    let acceptance = acceptance?;

    if acceptance == Acceptance::Quit {
        debug!("transfer: client requested quit at open");
        return Ok(TransferOutcome::Quit);
    }
    let dispatch = acceptance == Acceptance::Accept;

    let mut bytes_written: u64 = 0;
    let mut block_id: u64 = 0;

    loop {
        let Some(meta) = reader.wait_next(should_quit)? else {
            warn!("transfer: interrupted mid sub-observation (block {block_id})");
            return Ok(TransferOutcome::Interrupted);
        };

        match meta.kind {
            Kind::Data => {
                if dispatch {
                    let written = {
                        let block = reader.payload(&meta);
                        client.on_block(block, block_id).map_err(SessionError::Client)
                    };
                    // free the frame before surfacing any client error
                    reader.release(&meta);
                    bytes_written += written?;
                } else {
                    reader.release(&meta);
                }
                block_id += 1;
            }
            Kind::Eod => {
                reader.release(&meta);
                client.on_close(bytes_written).map_err(SessionError::Client)?;
                return Ok(if dispatch {
                    TransferOutcome::Completed { bytes_written }
                } else {
                    TransferOutcome::Skimmed
                });
            }
            other => {
                return Err(SessionError::Protocol {
                    expected: Kind::Data,
                    found: other,
                });
            }
        }
    }
}
