//! In-process test support: a scriptable mock server that speaks the frame protocol over a
//! real TCP socket.

mod pool;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bson::{rawdoc, RawDocumentBuf};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    task::JoinHandle,
};

use crate::{options::ServerAddress, wire::Message};

/// What a scripted handler decided to do with a request.
#[allow(dead_code)]
pub(crate) enum HandlerAction {
    /// Reply immediately.
    Reply(RawDocumentBuf),
    /// Reply after a pause, without blocking other requests on the same connection.
    DelayedReply(Duration, RawDocumentBuf),
    /// Never reply.
    Silent,
    /// Drop the connection.
    CloseConnection,
    /// Fall through to the built-in behavior (`hello` by role, `{ok: 1}` otherwise).
    Unhandled,
}

type Handler = Arc<dyn Fn(&RequestRecord) -> HandlerAction + Send + Sync>;

/// One request as the server saw it.
#[derive(Clone, Debug)]
pub(crate) struct RequestRecord {
    pub(crate) request_id: i32,
    pub(crate) body: RawDocumentBuf,
}

impl RequestRecord {
    /// The command name: the first key of the payload document.
    pub(crate) fn command_name(&self) -> String {
        self.body
            .iter()
            .next()
            .and_then(|element| element.ok())
            .map(|(key, _)| key.to_string())
            .unwrap_or_default()
    }
}

/// The role a mock server answers `hello` with.
#[derive(Clone, Debug)]
pub(crate) enum ServerRole {
    Standalone,
    Primary {
        set_name: String,
        hosts: Vec<String>,
    },
    Secondary {
        set_name: String,
        hosts: Vec<String>,
        primary: Option<String>,
    },
}

impl ServerRole {
    fn hello_reply(&self) -> RawDocumentBuf {
        let mut reply = rawdoc! {
            "ok": 1.0,
            "maxMessageSizeBytes": 48 * 1024 * 1024,
            "logicalSessionTimeoutMinutes": 30_i64,
        };
        match self {
            ServerRole::Standalone => {
                reply.append("isWritablePrimary", true);
            }
            ServerRole::Primary { set_name, hosts } => {
                reply.append("isWritablePrimary", true);
                reply.append("setName", set_name.as_str());
                reply.append("hosts", string_array(hosts));
            }
            ServerRole::Secondary {
                set_name,
                hosts,
                primary,
            } => {
                reply.append("isWritablePrimary", false);
                reply.append("secondary", true);
                reply.append("setName", set_name.as_str());
                reply.append("hosts", string_array(hosts));
                if let Some(primary) = primary {
                    reply.append("primary", primary.as_str());
                }
            }
        }
        reply
    }
}

fn string_array(values: &[String]) -> bson::raw::RawArrayBuf {
    let mut array = bson::raw::RawArrayBuf::new();
    for value in values {
        array.push(value.as_str());
    }
    array
}

struct ServerState {
    role: Mutex<ServerRole>,
    handler: Mutex<Option<Handler>>,
    requests: Mutex<Vec<RequestRecord>>,
    accepted: AtomicUsize,
}

/// A mock server on a real local socket. Each accepted connection reads frames and answers
/// them per the scripted handler (or the built-in `hello`/ok defaults); replies are written
/// from their own tasks, so a delayed reply does not block later requests on the connection.
pub(crate) struct MockServer {
    address: ServerAddress,
    state: Arc<ServerState>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start(role: ServerRole) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(ServerState {
            role: Mutex::new(role),
            handler: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(stream, Arc::clone(&accept_state)));
            }
        });

        MockServer {
            address: ServerAddress::new("127.0.0.1", port),
            state,
            accept_task,
        }
    }

    pub(crate) fn address(&self) -> ServerAddress {
        self.address.clone()
    }

    pub(crate) fn address_string(&self) -> String {
        self.address.to_string()
    }

    pub(crate) fn set_role(&self, role: ServerRole) {
        *self.state.role.lock().unwrap() = role;
    }

    pub(crate) fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&RequestRecord) -> HandlerAction + Send + Sync + 'static,
    {
        *self.state.handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Every request received so far, in arrival order.
    pub(crate) fn requests(&self) -> Vec<RequestRecord> {
        self.state.requests.lock().unwrap().clone()
    }

    /// The requests for one command name.
    pub(crate) fn requests_named(&self, name: &str) -> Vec<RequestRecord> {
        self.requests()
            .into_iter()
            .filter(|record| record.command_name() == name)
            .collect()
    }

    /// How many TCP connections the server has accepted.
    pub(crate) fn accepted_connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<ServerState>) {
    let (mut read_half, write_half) = stream.into_split();
    let write_half = Arc::new(tokio::sync::Mutex::new(write_half));

    loop {
        let message = match read_message(&mut read_half).await {
            Some(message) => message,
            None => return,
        };

        let record = RequestRecord {
            request_id: message.request_id.unwrap_or(0),
            body: message.document_payload.clone(),
        };
        state.requests.lock().unwrap().push(record.clone());

        let handler = state.handler.lock().unwrap().clone();
        let action = match handler {
            Some(handler) => handler(&record),
            None => HandlerAction::Unhandled,
        };
        let action = match action {
            HandlerAction::Unhandled => default_action(&state, &record),
            other => other,
        };

        match action {
            HandlerAction::Reply(body) => {
                write_reply(Arc::clone(&write_half), record.request_id, body).await;
            }
            HandlerAction::DelayedReply(delay, body) => {
                let write_half = Arc::clone(&write_half);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    write_reply(write_half, record.request_id, body).await;
                });
            }
            HandlerAction::Silent => {}
            HandlerAction::CloseConnection => {
                let mut writer = write_half.lock().await;
                let _ = writer.shutdown().await;
                return;
            }
            HandlerAction::Unhandled => unreachable!(),
        }
    }
}

fn default_action(state: &ServerState, record: &RequestRecord) -> HandlerAction {
    match record.command_name().as_str() {
        "hello" => HandlerAction::Reply(state.role.lock().unwrap().hello_reply()),
        _ => HandlerAction::Reply(rawdoc! { "ok": 1.0 }),
    }
}

async fn read_message(read_half: &mut OwnedReadHalf) -> Option<Message> {
    Message::read_from(read_half, None).await.ok()
}

async fn write_reply(
    write_half: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    response_to: i32,
    body: RawDocumentBuf,
) {
    let mut message = Message::new_request(body);
    message.response_to = response_to;
    let mut writer = write_half.lock().await;
    let _ = message.write_to(&mut *writer).await;
}

/// A reply carrying a cursor batch, as cursor-bearing commands produce.
pub(crate) fn cursor_reply(
    ns: &str,
    cursor_id: i64,
    first: bool,
    docs: Vec<RawDocumentBuf>,
) -> RawDocumentBuf {
    let mut batch = bson::raw::RawArrayBuf::new();
    for doc in docs {
        batch.push(doc);
    }
    let mut cursor = rawdoc! { "id": cursor_id, "ns": ns };
    cursor.append(if first { "firstBatch" } else { "nextBatch" }, batch);
    rawdoc! { "ok": 1.0, "cursor": cursor }
}
