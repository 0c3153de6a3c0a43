use bson::{rawdoc, RawDocument, RawDocumentBuf};
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    error::{CommandError, Error, ErrorKind, Result},
    options::ServerAddress,
    wire::{DocumentSequence, Message, MessageFlags},
};

/// A database command to send on a connection.
///
/// The driver attaches protocol control fields (target database, session and transaction state)
/// but otherwise treats the body as opaque; command semantics belong to the caller.
#[derive(Clone, Debug)]
pub struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: RawDocumentBuf,
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) exhaust_allowed: bool,
}

impl Command {
    /// Creates a command named `name` to run against `target_db`. `body` must already contain
    /// the command field itself (e.g. `{ "find": "events", ... }`).
    pub fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: RawDocumentBuf,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            document_sequences: Vec::new(),
            exhaust_allowed: false,
        }
    }

    /// Attaches a named document sequence to be carried outside the payload document.
    pub fn add_document_sequence(
        &mut self,
        identifier: impl Into<String>,
        documents: Vec<RawDocumentBuf>,
    ) {
        self.document_sequences.push(DocumentSequence {
            identifier: identifier.into(),
            documents,
        });
    }

    /// Appends a control field to the command body.
    pub(crate) fn append(&mut self, key: impl AsRef<str>, value: impl Into<bson::RawBson>) {
        self.body.append(key.as_ref(), value);
    }

    pub(crate) fn into_message(mut self) -> Message {
        self.body.append("$db", self.target_db.as_str());

        let mut flags = MessageFlags::empty();
        if self.exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }

        Message {
            document_payload: self.body,
            document_sequences: self.document_sequences,
            request_id: None,
            response_to: 0,
            flags,
        }
    }
}

/// A correlated reply to a command, with its body still in raw form.
#[derive(Clone, Debug)]
pub struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    pub(crate) message: Message,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, message: Message) -> Self {
        Self { source, message }
    }

    /// The address of the server that produced this reply.
    pub fn source_address(&self) -> &ServerAddress {
        &self.source
    }

    /// The raw reply payload.
    pub fn raw_body(&self) -> &RawDocument {
        &self.message.document_payload
    }

    /// Deserializes the reply payload.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_slice(self.message.document_payload.as_bytes())
            .map_err(|err| Error::new(ErrorKind::from(err)))
    }

    /// Checks the server-reported status of this reply, converting a non-ok status into a
    /// `Command` error carrying the server-provided code and message.
    pub fn ok(&self) -> Result<()> {
        let status: CommandStatus = self.body()?;
        if status.ok == 1 {
            Ok(())
        } else {
            Err(ErrorKind::Command(CommandError {
                code: status.code.unwrap_or(0),
                code_name: status.code_name.unwrap_or_default(),
                message: status.errmsg.unwrap_or_else(|| "command failed".to_string()),
            })
            .into())
        }
    }
}

/// The status fields every server reply carries.
#[derive(Debug, Deserialize)]
pub(crate) struct CommandStatus {
    #[serde(deserialize_with = "deserialize_ok", default)]
    pub(crate) ok: i32,
    pub(crate) errmsg: Option<String>,
    pub(crate) code: Option<i32>,
    #[serde(rename = "codeName")]
    pub(crate) code_name: Option<String>,
}

// Servers report `ok` as a double; accept any numeric form.
fn deserialize_ok<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<i32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OkValue {
        Int(i64),
        Double(f64),
    }

    Ok(match OkValue::deserialize(deserializer)? {
        OkValue::Int(value) => value as i32,
        OkValue::Double(value) => value as i32,
    })
}

/// The `cursor` sub-document carried by cursor-bearing replies.
#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,
    pub(crate) ns: String,
    #[serde(default)]
    pub(crate) first_batch: Option<Vec<RawDocumentBuf>>,
    #[serde(default)]
    pub(crate) next_batch: Option<Vec<RawDocumentBuf>>,
}

impl CursorInfo {
    pub(crate) fn into_batch(self) -> Result<Batch> {
        let ns = Namespace::from_full_name(&self.ns)?;
        let documents = self
            .first_batch
            .or(self.next_batch)
            .ok_or_else(|| Error::invalid_response("cursor reply carried no batch"))?;
        Ok(Batch {
            ns,
            cursor_id: self.id,
            documents,
        })
    }
}

/// One batch of documents from a server-side cursor, along with the (possibly zero) handle to
/// fetch the next one.
#[derive(Clone, Debug)]
pub struct Batch {
    /// The namespace the cursor reads from.
    pub ns: Namespace,

    /// The remote cursor handle; 0 means the cursor is exhausted server-side.
    pub cursor_id: i64,

    /// The documents in this batch, in server order.
    pub documents: Vec<RawDocumentBuf>,
}

/// A database/collection pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The database name.
    pub db: String,

    /// The collection name.
    pub coll: String,
}

impl Namespace {
    /// Creates a namespace from its parts.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parses a `"db.coll"` string; the collection part may itself contain dots.
    pub fn from_full_name(name: &str) -> Result<Self> {
        match name.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(Error::invalid_response(format!(
                "invalid namespace \"{}\"",
                name
            ))),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Builds the continuation command for an open server cursor.
pub(crate) fn get_more_command(ns: &Namespace, cursor_id: i64, batch_size: Option<u32>) -> Command {
    let mut body = rawdoc! {
        "getMore": cursor_id,
        "collection": ns.coll.as_str(),
    };
    if let Some(batch_size) = batch_size {
        body.append("batchSize", batch_size as i32);
    }
    Command::new("getMore", ns.db.as_str(), body)
}

/// Builds the best-effort cursor release command.
pub(crate) fn kill_cursors_command(ns: &Namespace, cursor_ids: &[i64]) -> Command {
    let mut ids = bson::raw::RawArrayBuf::new();
    for id in cursor_ids {
        ids.push(*id);
    }
    Command::new(
        "killCursors",
        ns.db.as_str(),
        rawdoc! { "killCursors": ns.coll.as_str(), "cursors": ids },
    )
}
