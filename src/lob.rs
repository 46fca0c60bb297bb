//! Large-object entry points. Reads and writes move `LOB_IO_LENGTH`-sized
//! chunks, each wrapped in the failover driver; reads never run past the
//! size the server reported for the locator.

use bytes::{Bytes, BytesMut};

use crate::connection::with_conn;
use crate::errors::{Error, Result};
use crate::handle::ConnId;
use crate::retry;
use crate::wire::{LobKind, LobLocator};

pub const LOB_IO_LENGTH: usize = 128 * 1024;

/// A client-side large-object handle. The locator stays valid as long as
/// the row it was read from (or the transaction that created it).
#[derive(Debug, Clone)]
pub struct Lob {
    locator: LobLocator,
}

impl Lob {
    pub(crate) fn new(locator: LobLocator) -> Self {
        Lob { locator }
    }

    /// Wraps a locator received from a result column.
    pub fn from_locator(locator: LobLocator) -> Self {
        Lob { locator }
    }

    pub fn kind(&self) -> LobKind {
        self.locator.kind
    }

    pub fn size(&self) -> u64 {
        self.locator.size
    }
}

/// Creates a fresh, empty LOB on the server.
pub async fn lob_new(conn: ConnId, kind: LobKind) -> Result<Lob> {
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let result = retry::retryable(session, state, None, |state| {
                Box::pin(async move {
                    let timeout = state.remaining_time()?;
                    state.wire()?.lob_new(kind, timeout).await
                })
            })
            .await;
            state.clear_deadline();
            result.map(Lob::new)
        })
    })
    .await
}

/// Writes `data` at `offset`, in chunks. Returns the number of bytes
/// written and grows the client-side size accordingly.
pub async fn lob_write(conn: ConnId, lob: &mut Lob, offset: u64, data: &[u8]) -> Result<usize> {
    if lob.locator.locator.is_empty() {
        return Err(Error::InvalidLobHandle);
    }
    let data = data.to_vec();
    let locator = lob.locator.clone();
    let written = with_conn(conn, move |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let mut written = 0usize;
            let result = loop {
                if written >= data.len() {
                    break Ok(written);
                }
                let chunk_end = (written + LOB_IO_LENGTH).min(data.len());
                let chunk = data[written..chunk_end].to_vec();
                let chunk_offset = offset + written as u64;
                let locator = locator.clone();
                match retry::retryable(session, state, None, move |state| {
                    let chunk = chunk.clone();
                    let locator = locator.clone();
                    Box::pin(async move {
                        let timeout = state.remaining_time()?;
                        state
                            .wire()?
                            .lob_write(&locator, chunk_offset, &chunk, timeout)
                            .await
                    })
                })
                .await
                {
                    Ok(0) => break Ok(written),
                    Ok(n) => written += n,
                    Err(err) => break Err(err),
                }
            };
            state.clear_deadline();
            result
        })
    })
    .await?;
    lob.locator.size = lob.locator.size.max(offset + written as u64);
    Ok(written)
}

/// Reads up to `length` bytes from `offset`, bounded by the LOB's size.
pub async fn lob_read(conn: ConnId, lob: &Lob, offset: u64, length: usize) -> Result<Bytes> {
    if lob.locator.locator.is_empty() {
        return Err(Error::InvalidLobHandle);
    }
    if offset > lob.locator.size {
        return Err(Error::InvalidLobReadPos);
    }
    let length = length.min((lob.locator.size - offset) as usize);
    let locator = lob.locator.clone();
    with_conn(conn, move |session, state| {
        Box::pin(async move {
            state.set_query_deadline(None);
            let mut out = BytesMut::with_capacity(length);
            let result = loop {
                if out.len() >= length {
                    break Ok(());
                }
                let chunk_len = (length - out.len()).min(LOB_IO_LENGTH);
                let chunk_offset = offset + out.len() as u64;
                let locator = locator.clone();
                match retry::retryable(session, state, None, move |state| {
                    let locator = locator.clone();
                    Box::pin(async move {
                        let timeout = state.remaining_time()?;
                        state
                            .wire()?
                            .lob_read(&locator, chunk_offset, chunk_len, timeout)
                            .await
                    })
                })
                .await
                {
                    Ok(chunk) if chunk.is_empty() => break Ok(()),
                    Ok(chunk) => out.extend_from_slice(&chunk),
                    Err(err) => break Err(err),
                }
            };
            state.clear_deadline();
            result.map(|()| out.freeze())
        })
    })
    .await
}
