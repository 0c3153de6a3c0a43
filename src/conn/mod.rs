mod command;
mod stats;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bson::RawDocument;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    task::JoinHandle,
};

pub use command::{Batch, Command, Namespace, RawCommandResponse};
pub(crate) use command::{get_more_command, kill_cursors_command, CursorBody};
pub use stats::{ConnectionStats, RatioCounter};

use crate::{
    auth::{Authenticate, Credential},
    error::{Error, Result},
    handshake::{run_hello, HelloReply, ServerType},
    options::{ClientOptions, ServerAddress},
    runtime::{AsyncStream, TlsConnect},
    wire::Message,
};

const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

const CONNECTION_TRACING_EVENT_TARGET: &str = "docwire::connection";

/// Options consumed when establishing a single connection.
#[derive(Clone)]
pub(crate) struct ConnectionOptions {
    pub(crate) connect_timeout: Duration,
    pub(crate) reply_timeout: Duration,
    pub(crate) tls: Option<Arc<dyn TlsConnect>>,
    pub(crate) credential: Option<Credential>,
    pub(crate) authenticator: Option<Arc<dyn Authenticate>>,
}

impl From<&ClientOptions> for ConnectionOptions {
    fn from(options: &ClientOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout,
            reply_timeout: options.reply_timeout,
            tls: options.tls.clone(),
            credential: options.credential.clone(),
            authenticator: options.authenticator.clone(),
        }
    }
}

/// What the handshake taught us about the server on the other end.
#[derive(Clone, Debug)]
pub(crate) struct StreamDescription {
    pub(crate) server_type: ServerType,
    pub(crate) hello: HelloReply,
    pub(crate) initial_round_trip: Duration,
}

/// A single connection to a single server.
///
/// The connection owns its socket and its background reader task for its whole lifetime. The
/// reader continuously parses incoming frames and files them by the id of the request they
/// respond to; any number of callers may wait on distinct ids concurrently. A connection is
/// used by one borrower at a time by pool contract, but that discipline is the pool's, not
/// enforced here.
///
/// Once closed (explicitly or by an unrecoverable socket error) a connection is never reused;
/// pool bookkeeping is restored when the closed connection is checked back in or discarded via
/// its owning transport.
#[derive(Debug)]
pub struct Connection {
    pub(crate) id: u32,
    pub(crate) generation: u32,
    created_at: Instant,

    /// When the connection last became idle in its pool, for idle-expiry checks.
    ready_and_available_time: Option<Instant>,

    pub(crate) description: Option<StreamDescription>,

    inner: Arc<ConnectionInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct ConnectionInner {
    address: ServerAddress,
    reply_timeout: Duration,
    max_message_size: AtomicI32,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    replies: Mutex<ReplyTable>,
    wakeup: tokio::sync::Notify,
    writer: tokio::sync::Mutex<WriteHalf<AsyncStream>>,
    stats: ConnectionStats,
}

/// Correlation state shared between the reader task and waiters. All check-then-modify
/// sequences on this table happen under its mutex.
#[derive(Debug, Default)]
struct ReplyTable {
    /// Ids of requests that have been written and may still receive a reply.
    outstanding: HashMap<i32, Instant>,
    /// Replies that have arrived and await their waiter.
    arrived: HashMap<i32, PendingReply>,
}

#[derive(Debug)]
struct PendingReply {
    message: Message,
    received_at: Instant,
}

impl Connection {
    /// Dials `address`, negotiates capabilities, and authenticates if a credential is
    /// configured. The reader task is started before the handshake is sent so the handshake
    /// reply flows through the same correlation path as everything else.
    pub(crate) async fn connect(
        id: u32,
        generation: u32,
        address: ServerAddress,
        options: ConnectionOptions,
    ) -> Result<Connection> {
        let stream = AsyncStream::connect(&address, options.connect_timeout, options.tls.as_ref())
            .await?;
        let (read_half, write_half) = tokio::io::split(stream);

        let inner = Arc::new(ConnectionInner {
            address,
            reply_timeout: options.reply_timeout,
            max_message_size: AtomicI32::new(DEFAULT_MAX_MESSAGE_SIZE_BYTES),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            replies: Mutex::new(ReplyTable::default()),
            wakeup: tokio::sync::Notify::new(),
            writer: tokio::sync::Mutex::new(write_half),
            stats: ConnectionStats::default(),
        });

        let reader = tokio::spawn(reader_loop(Arc::clone(&inner), read_half));

        let mut conn = Connection {
            id,
            generation,
            created_at: Instant::now(),
            ready_and_available_time: None,
            description: None,
            inner,
            reader: Mutex::new(Some(reader)),
        };

        match conn.establish(&options).await {
            Ok(()) => Ok(conn),
            Err(err) => {
                conn.close().await;
                Err(err)
            }
        }
    }

    async fn establish(&mut self, options: &ConnectionOptions) -> Result<()> {
        let (hello, round_trip) = run_hello(self).await?;

        if let Some(max) = hello.max_message_size_bytes {
            self.inner.max_message_size.store(max, Ordering::Relaxed);
        }
        self.description = Some(StreamDescription {
            server_type: hello.server_type(),
            hello,
            initial_round_trip: round_trip,
        });

        if let Some(ref credential) = options.credential {
            let authenticator = options.authenticator.as_ref().ok_or_else(|| {
                Error::authentication("a credential is configured but no authenticator is")
            })?;
            authenticator.authenticate(self, credential).await?;
        }

        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            address = %self.inner.address,
            id = self.id,
            "connection established"
        );
        Ok(())
    }

    /// The address this connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    /// The driver-generated id of this connection.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Counters for this connection.
    pub fn stats(&self) -> &ConnectionStats {
        &self.inner.stats
    }

    /// Whether this connection has been closed and must not be reused.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn reply_timeout(&self) -> Duration {
        self.inner.reply_timeout
    }

    pub(crate) fn server_type(&self) -> Option<ServerType> {
        self.description.as_ref().map(|description| description.server_type)
    }

    /// Marks the time the connection became ready and available in its pool, for idle
    /// detection. A health-check pass re-queuing the connection does not count as use, so an
    /// existing mark is preserved.
    pub(crate) fn mark_checked_in(&mut self) {
        if self.ready_and_available_time.is_none() {
            self.ready_and_available_time = Some(Instant::now());
        }
    }

    pub(crate) fn mark_checked_out(&mut self) {
        self.ready_and_available_time = None;
    }

    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    pub(crate) fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        max_lifetime
            .map(|max_lifetime| self.created_at.elapsed() >= max_lifetime)
            .unwrap_or(false)
    }

    pub(crate) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    /// Serializes `command` and writes it to the socket, returning the request id the caller
    /// can wait on.
    pub async fn send_command(&self, command: Command) -> Result<i32> {
        self.fail_if_closed()?;

        tracing::trace!(
            target: "docwire::command",
            command = %command.name,
            target_db = %command.target_db,
            address = %self.inner.address,
            "sending command"
        );
        let mut message = command.into_message();
        let request_id = crate::wire::next_request_id();
        message.request_id = Some(request_id);

        {
            let mut table = self.inner.replies.lock().unwrap();
            table.outstanding.insert(request_id, Instant::now());
        }

        let mut writer = self.inner.writer.lock().await;
        match message.write_to(&mut *writer).await {
            Ok(_) => {
                self.inner.stats.record_sent();
                Ok(request_id)
            }
            Err(err) => {
                self.inner.replies.lock().unwrap().outstanding.remove(&request_id);
                if err.is_transport() {
                    self.inner
                        .mark_closed(format!("write failed: {}", err));
                }
                Err(err)
            }
        }
    }

    /// Waits until the reader delivers the reply to `request_id`.
    ///
    /// Any single wait step is bounded by `timeout`; the whole wait gives up after twice that,
    /// tolerating scheduling jitter without hanging forever. Safe to call concurrently with
    /// other waiters on other ids; each gets exactly the frame correlated to its own id.
    pub async fn await_reply(
        &self,
        request_id: i32,
        timeout: Duration,
    ) -> Result<RawCommandResponse> {
        match self.await_reply_opt(request_id, timeout).await? {
            Some(response) => Ok(response),
            None => Err(Error::timed_out(format!(
                "no reply to request {} from {} within {:?}",
                request_id,
                self.inner.address,
                timeout * 2,
            ))),
        }
    }

    /// Timeout-tolerant variant of [`await_reply`](Self::await_reply): a missing reply is
    /// `Ok(None)` instead of an error. Transport failures still surface.
    pub async fn await_reply_opt(
        &self,
        request_id: i32,
        timeout: Duration,
    ) -> Result<Option<RawCommandResponse>> {
        let deadline = Instant::now() + timeout * 2;

        loop {
            let mut notified = std::pin::pin!(self.inner.wakeup.notified());
            notified.as_mut().enable();

            if let Some(pending) = {
                let mut table = self.inner.replies.lock().unwrap();
                table.arrived.remove(&request_id)
            } {
                return Ok(Some(RawCommandResponse::new(
                    self.inner.address.clone(),
                    pending.message,
                )));
            }

            if self.is_closed() {
                self.inner.replies.lock().unwrap().outstanding.remove(&request_id);
                return Err(self.inner.closed_error());
            }

            let now = Instant::now();
            if now >= deadline {
                self.inner.replies.lock().unwrap().outstanding.remove(&request_id);
                return Ok(None);
            }

            let step = std::cmp::min(timeout, deadline - now);
            let _ = tokio::time::timeout(step, notified).await;
        }
    }

    /// Sends `command` and waits for its correlated reply, failing if the server reported a
    /// non-ok status.
    pub async fn run_command(&self, command: Command) -> Result<RawCommandResponse> {
        let start = Instant::now();
        let request_id = self.send_command(command).await?;
        let response = self.await_reply(request_id, self.inner.reply_timeout).await?;
        self.inner
            .stats
            .round_trip_micros
            .observe(start.elapsed().as_micros() as u64);

        response.ok()?;
        Ok(response)
    }

    /// Issues a continuation for an open server cursor and returns the next batch.
    pub async fn get_more(
        &self,
        ns: &Namespace,
        cursor_id: i64,
        batch_size: Option<u32>,
    ) -> Result<Batch> {
        let response = self
            .run_command(get_more_command(ns, cursor_id, batch_size))
            .await?;
        response.body::<CursorBody>()?.cursor.into_batch()
    }

    /// Tells the server it may discard the given cursors. Best-effort: failures are logged and
    /// swallowed, since abandoned cursors also expire server-side.
    pub async fn kill_cursors(&self, ns: &Namespace, cursor_ids: &[i64]) {
        if cursor_ids.is_empty() {
            return;
        }
        if let Err(err) = self.run_command(kill_cursors_command(ns, cursor_ids)).await {
            tracing::warn!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                address = %self.inner.address,
                error = %err,
                "failed to release server cursors"
            );
        }
    }

    /// Drives a long-lived streaming read.
    ///
    /// Sends `start`, then dispatches every document of every reply batch to `on_event`.
    /// After each batch: if `is_done` reports the caller has what it needs, the remote cursor
    /// is released and the loop returns; otherwise the stream continues from the live cursor,
    /// or restarts from `start` when the server reports the cursor gone (a resumable gap, not
    /// an error). A reply timeout resends the same outstanding payload under a fresh request
    /// id — on a streaming read it means "no new data yet", not a dead connection.
    pub async fn watch<F, D>(&self, start: Command, mut on_event: F, mut is_done: D) -> Result<()>
    where
        F: FnMut(&RawDocument) -> Result<()>,
        D: FnMut() -> bool,
    {
        let mut current = start.clone();
        let mut request_id = self.send_command(current.clone()).await?;

        loop {
            let response = match self.await_reply(request_id, self.inner.reply_timeout).await {
                Ok(response) => response,
                Err(err) if err.is_timeout() => {
                    tracing::trace!(
                        target: CONNECTION_TRACING_EVENT_TARGET,
                        address = %self.inner.address,
                        "streaming read idle, resending outstanding request"
                    );
                    request_id = self.send_command(current.clone()).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            response.ok()?;
            let batch = response.body::<CursorBody>()?.cursor.into_batch()?;

            for document in &batch.documents {
                on_event(document)?;
            }

            if is_done() {
                if batch.cursor_id != 0 {
                    self.kill_cursors(&batch.ns, &[batch.cursor_id]).await;
                }
                return Ok(());
            }

            current = if batch.cursor_id != 0 {
                get_more_command(&batch.ns, batch.cursor_id, None)
            } else {
                // The server dropped the cursor out from under us; resume from the top.
                start.clone()
            };
            request_id = self.send_command(current.clone()).await?;
        }
    }

    /// Closes the connection: stops the reader, shuts the socket down, and wakes every waiter
    /// so they fail fast instead of hanging. Idempotent.
    pub async fn close(&self) {
        self.inner.mark_closed("connection closed".to_string());
        self.abort_reader();
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn abort_reader(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn fail_if_closed(&self) -> Result<()> {
        if self.is_closed() {
            Err(self.inner.closed_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.mark_closed("connection dropped".to_string());
        self.abort_reader();
    }
}

impl ConnectionInner {
    fn mark_closed(&self, reason: String) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.close_reason.lock().unwrap() = Some(reason);
        }
        self.wakeup.notify_waiters();
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .close_reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        Error::connection_closed(format!("{} ({})", reason, self.address))
    }

    /// Files an incoming frame under the id it responds to, or discards it when nothing is
    /// waiting on that id.
    fn deliver(&self, message: Message) {
        let response_to = message.response_to;
        let mut table = self.replies.lock().unwrap();

        if table.outstanding.remove(&response_to).is_some() {
            table.arrived.insert(
                response_to,
                PendingReply {
                    message,
                    received_at: Instant::now(),
                },
            );
            drop(table);
            self.stats.record_received();
            self.wakeup.notify_waiters();
        } else {
            drop(table);
            self.stats.record_discarded();
            tracing::warn!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                address = %self.address,
                response_to,
                "discarding reply that matches no awaited request"
            );
        }
    }

    /// Drops reply-table entries nobody claimed within the wait window, so replies whose
    /// waiters gave up (or never existed) cannot accumulate.
    fn sweep(&self) {
        let horizon = self.reply_timeout * 2;
        let mut table = self.replies.lock().unwrap();

        table.arrived.retain(|request_id, pending| {
            let keep = pending.received_at.elapsed() < horizon;
            if !keep {
                self.stats.record_discarded();
                tracing::warn!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    address = %self.address,
                    request_id,
                    "dropping unclaimed reply"
                );
            }
            keep
        });
        table
            .outstanding
            .retain(|_, sent_at| sent_at.elapsed() < horizon);
    }
}

/// The background reader: assembles frames off the socket and files them by correlation id
/// until the connection dies. Frame assembly buffers partial reads so the periodic sweep tick
/// can never corrupt a frame in flight.
async fn reader_loop(inner: Arc<ConnectionInner>, mut read_half: ReadHalf<AsyncStream>) {
    let mut sweep = tokio::time::interval(inner.reply_timeout);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut buf: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8 * 1024];

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            read = read_half.read(&mut chunk) => match read {
                Ok(0) => {
                    inner.mark_closed("connection closed by server".to_string());
                    break;
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Err(err) = drain_frames(&inner, &mut buf).await {
                        inner.mark_closed(format!("reader failed: {}", err));
                        break;
                    }
                }
                Err(err) => {
                    inner.mark_closed(format!("read failed: {}", err));
                    break;
                }
            },
            _ = sweep.tick() => inner.sweep(),
        }
    }

    inner.wakeup.notify_waiters();
}

/// Parses every complete frame currently buffered and delivers it.
async fn drain_frames(inner: &ConnectionInner, buf: &mut Vec<u8>) -> Result<()> {
    loop {
        if buf.len() < 4 {
            return Ok(());
        }
        let declared = i32::from_le_bytes(buf[..4].try_into().unwrap());
        let max = inner.max_message_size.load(Ordering::Relaxed);
        if declared < crate::wire::Header::LENGTH as i32 || declared > max {
            return Err(Error::invalid_response(format!(
                "frame length {} outside the valid range",
                declared
            )));
        }
        let declared = declared as usize;
        if buf.len() < declared {
            return Ok(());
        }

        let frame: Vec<u8> = buf.drain(..declared).collect();
        let message = Message::read_from(&mut frame.as_slice(), Some(max)).await?;
        inner.deliver(message);
    }
}
