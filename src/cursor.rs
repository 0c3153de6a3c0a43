//! Client-side iteration over a server-side result cursor.

use bson::{RawDocument, RawDocumentBuf};
use serde::de::DeserializeOwned;

use crate::{
    conn::{Batch, Connection, Namespace},
    error::{Error, Result},
    pool::ConnectionPool,
    single::SingleHostTransport,
};

/// Where a cursor's connection goes back to when iteration finishes.
#[derive(Debug)]
#[non_exhaustive]
pub enum CursorOwner {
    /// Return the connection to a pool.
    Pool(ConnectionPool),
    /// Return the connection to a single-host transport.
    Single(SingleHostTransport),
    /// No owner; the connection is simply dropped (and thereby closed) on release.
    Detached,
}

impl CursorOwner {
    fn return_connection(&self, conn: Connection) {
        match self {
            CursorOwner::Pool(pool) => pool.check_in(conn),
            CursorOwner::Single(transport) => transport.check_in(conn),
            CursorOwner::Detached => drop(conn),
        }
    }
}

/// An iterator over a server-side result cursor.
///
/// The cursor holds its connection for as long as continuation batches may still be fetched and
/// returns it to its owner exactly once, at exhaustion or on [`close`](Self::close). Documents
/// are yielded in server order; continuation fetches are only issued once the in-memory batch
/// is drained, so order within the stream is stable.
#[derive(Debug)]
pub struct BatchCursor {
    owner: CursorOwner,
    conn: Option<Connection>,
    ns: Namespace,
    /// The remote handle; 0 means the server has nothing further.
    cursor_id: i64,
    batch: Vec<RawDocumentBuf>,
    /// Read position within `batch`; never exceeds its length.
    pos: usize,
    batch_size: Option<u32>,
}

impl BatchCursor {
    /// Builds a cursor from the first batch a cursor-bearing command returned.
    pub fn from_batch(
        owner: CursorOwner,
        conn: Connection,
        batch: Batch,
        batch_size: Option<u32>,
    ) -> Self {
        Self {
            owner,
            conn: Some(conn),
            ns: batch.ns,
            cursor_id: batch.cursor_id,
            batch: batch.documents,
            pos: 0,
            batch_size,
        }
    }

    /// Awaits the reply to an already-sent cursor-bearing command (by its request id) and
    /// builds a cursor from it. The connection is returned to `owner` if the reply is an
    /// error.
    pub async fn open(
        owner: CursorOwner,
        conn: Connection,
        request_id: i32,
        batch_size: Option<u32>,
    ) -> Result<Self> {
        let timeout = conn.reply_timeout();
        let batch = async {
            let response = conn.await_reply(request_id, timeout).await?;
            response.ok()?;
            response.body::<crate::conn::CursorBody>()?.cursor.into_batch()
        }
        .await;

        match batch {
            Ok(batch) => Ok(Self::from_batch(owner, conn, batch, batch_size)),
            Err(err) => {
                owner.return_connection(conn);
                Err(err)
            }
        }
    }

    /// The namespace this cursor reads from.
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// The remote cursor handle; 0 once the server side is exhausted.
    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    /// Whether another document is available, fetching a continuation batch if the local one
    /// is drained and the remote cursor is still open. Returns `false` exactly once the remote
    /// handle is 0 and every buffered document has been read, releasing the connection at that
    /// point.
    pub async fn has_next(&mut self) -> Result<bool> {
        loop {
            if self.pos < self.batch.len() {
                return Ok(true);
            }
            if self.cursor_id == 0 {
                self.release_connection();
                return Ok(false);
            }

            let conn = self
                .conn
                .as_ref()
                .ok_or_else(|| Error::invalid_argument("the cursor has been closed"))?;
            let batch = conn
                .get_more(&self.ns, self.cursor_id, self.batch_size)
                .await?;
            self.cursor_id = batch.cursor_id;
            self.batch = batch.documents;
            self.pos = 0;
        }
    }

    /// Yields the next document, or `None` at the end of the stream.
    pub async fn next(&mut self) -> Result<Option<RawDocumentBuf>> {
        if !self.has_next().await? {
            return Ok(None);
        }
        let document = self.batch[self.pos].clone();
        self.pos += 1;
        Ok(Some(document))
    }

    /// The next unread document, without advancing.
    pub fn current(&self) -> Option<&RawDocument> {
        self.batch.get(self.pos).map(|document| document.as_ref())
    }

    /// Deserializes the next unread document without advancing.
    pub fn deserialize_current<T: DeserializeOwned>(&self) -> Result<T> {
        let current = self
            .current()
            .ok_or_else(|| Error::invalid_argument("no current document"))?;
        bson::from_slice(current.as_bytes()).map_err(Error::from)
    }

    /// Skips forward `n` documents, fetching continuation batches as needed. Skipping past the
    /// end of the stream is not an error; the cursor is simply exhausted.
    pub async fn advance(&mut self, n: usize) -> Result<()> {
        let mut remaining = n;
        while remaining > 0 {
            if !self.has_next().await? {
                return Ok(());
            }
            let available = self.batch.len() - self.pos;
            let step = std::cmp::min(available, remaining);
            self.pos += step;
            remaining -= step;
        }
        Ok(())
    }

    /// Moves the read position back `n` documents within the current batch. Batch boundaries
    /// are not reversible: rewinding past the start of the current batch is an error.
    pub fn rewind(&mut self, n: usize) -> Result<()> {
        if n > self.pos {
            return Err(Error::invalid_argument(format!(
                "cannot rewind {} documents: only {} before the start of the current batch",
                n, self.pos
            )));
        }
        self.pos -= n;
        Ok(())
    }

    /// Releases the remote cursor (best-effort) and returns the connection to its owner. Safe
    /// to call more than once.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.as_ref() {
            if self.cursor_id != 0 {
                conn.kill_cursors(&self.ns, &[self.cursor_id]).await;
                self.cursor_id = 0;
            }
        }
        self.release_connection();
    }

    fn release_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.owner.return_connection(conn);
        }
    }
}

impl Drop for BatchCursor {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let owner = std::mem::replace(&mut self.owner, CursorOwner::Detached);
        let ns = self.ns.clone();
        let cursor_id = self.cursor_id;

        // Dropping without closing leaks the remote cursor until the server expires it; tell
        // the server when there's still a runtime to do it on.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if cursor_id != 0 {
                        conn.kill_cursors(&ns, &[cursor_id]).await;
                    }
                    owner.return_connection(conn);
                });
            }
            Err(_) => owner.return_connection(conn),
        }
    }
}
