//! Ranged chunk reader
//!
//! Presents a `[start, end]` byte range over a media object as a read-once
//! byte stream of exactly `end - start + 1` bytes, issuing aligned chunk
//! reads to the upstream session. The platform only accepts power-of-two
//! read sizes with offsets aligned to them, so the first chunk is sliced
//! from `start - aligned_offset` and the last is trimmed to the range end.

use bytes::Bytes;
use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::models::UpstreamLocator;
use crate::upstream::{UpstreamError, UpstreamSession, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Chunk size for a request of `request_len` bytes: the largest power of two
/// not exceeding the request length, clamped to the platform's allowed set.
#[must_use]
pub fn chunk_size_for(request_len: i64) -> i64 {
    let len = request_len.max(1) as u64;
    let pow2 = if len.is_power_of_two() {
        len
    } else {
        (len + 1).next_power_of_two() / 2
    };
    (pow2 as i64).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

struct ReadState {
    session: Arc<UpstreamSession>,
    locator: UpstreamLocator,
    chunk_size: i64,
    offset: i64,
    /// Bytes to drop from the front of the first chunk.
    head_skip: usize,
    /// Bytes still owed to the caller.
    remaining: i64,
    /// Set when the upstream returned a short read; the stream ends here.
    upstream_eof: bool,
    cancel: CancellationToken,
}

/// Stream the bytes of `[start, end]` (inclusive) for a locator.
///
/// The stream ends after delivering `end - start + 1` bytes, or earlier on a
/// short upstream read that cannot be extended. Upstream errors pass through
/// with their kind intact so the caller can recognize reference expiry. The
/// reader never reads past the requested range and holds no locks while
/// blocked on the upstream.
pub fn chunked_read(
    session: Arc<UpstreamSession>,
    locator: UpstreamLocator,
    start: i64,
    end: i64,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Bytes, UpstreamError>> {
    let request_len = end - start + 1;
    let chunk_size = chunk_size_for(request_len);
    let offset = start / chunk_size * chunk_size;

    let state = ReadState {
        session,
        locator,
        chunk_size,
        offset,
        head_skip: (start - offset) as usize,
        remaining: request_len.max(0),
        upstream_eof: false,
        cancel,
    };

    stream::try_unfold(state, |mut st| async move {
        if st.remaining <= 0 || st.upstream_eof {
            return Ok(None);
        }

        if st.cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }
        let read = tokio::select! {
            biased;
            () = st.cancel.cancelled() => return Err(UpstreamError::Cancelled),
            read = st.session.read_file(&st.locator, st.offset, st.chunk_size) => read,
        };
        let chunk = read?;

        // A read shorter than the requested limit is the upstream's
        // end-of-file signal.
        if (chunk.len() as i64) < st.chunk_size {
            st.upstream_eof = true;
        }

        let head = st.head_skip.min(chunk.len());
        let deliverable = chunk.len() - head;
        let take = (st.remaining.min(deliverable as i64)) as usize;
        let slice = chunk.slice(head..head + take);

        st.offset += st.chunk_size;
        st.head_skip = 0;
        st.remaining -= take as i64;

        if slice.is_empty() {
            return Ok(None);
        }
        Ok(Some((slice, st)))
    })
}
