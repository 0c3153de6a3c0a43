use std::sync::atomic::{AtomicI32, Ordering};

use bitflags::bitflags;
use bson::RawDocumentBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::header::Header;
use crate::error::{Error, ErrorKind, Result};

const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Returns a new, unique request id. Wrapping is acceptable: ids are only compared for equality
/// within the short window a request is outstanding on one connection.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

bitflags! {
    /// The flag bits carried in a message header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// One wire message: a payload document plus any number of attached document sequences.
#[derive(Clone, Debug)]
pub(crate) struct Message {
    // payload type 0
    pub(crate) document_payload: RawDocumentBuf,
    // payload type 1
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) request_id: Option<i32>,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
}

/// A named sequence of documents attached to a message outside its payload document.
#[derive(Clone, Debug)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

impl Message {
    /// Creates a request message carrying `payload`.
    pub(crate) fn new_request(payload: RawDocumentBuf) -> Self {
        Self {
            document_payload: payload,
            document_sequences: Vec::new(),
            request_id: None,
            response_to: 0,
            flags: MessageFlags::empty(),
        }
    }

    /// Reads bytes from `reader` and deserializes them into a message.
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(reader).await?;

        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        if header.length > max_len {
            return Err(Error::invalid_response(format!(
                "message length {} over maximum {}",
                header.length, max_len
            )));
        }
        let length_remaining = (header.length as usize)
            .checked_sub(Header::LENGTH)
            .ok_or_else(|| {
                Error::invalid_response(format!("message length {} too short", header.length))
            })?;

        let mut buf = vec![0u8; length_remaining];
        reader.read_exact(&mut buf).await?;

        let flags = MessageFlags::from_bits_truncate(header.flags);
        let mut body = buf.as_slice();

        // A trailing checksum is not validated, just stripped off the section bytes.
        if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            let Some(without_checksum) = body.len().checked_sub(4) else {
                return Err(Error::invalid_response(
                    "message too short for its declared checksum",
                ));
            };
            body = &body[..without_checksum];
        }

        let mut document_payload = None;
        let mut document_sequences = Vec::new();

        while !body.is_empty() {
            match MessageSection::read(&mut body)? {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(Error::invalid_response(
                            "a message must contain exactly one payload type 0 section",
                        ));
                    }
                    document_payload = Some(document);
                }
                MessageSection::Sequence(sequence) => document_sequences.push(sequence),
            }
        }

        Ok(Self {
            document_payload: document_payload.ok_or_else(|| {
                Error::invalid_response(
                    "a message must contain exactly one payload type 0 section",
                )
            })?,
            document_sequences,
            request_id: Some(header.request_id),
            response_to: header.response_to,
            flags,
        })
    }

    /// Serializes the message and writes it to `writer`. Returns the request id the message was
    /// sent under.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<i32> {
        let sections = self.get_sections_bytes();

        let total_length = Header::LENGTH + sections.len();
        let total_length = i32::try_from(total_length).map_err(|_| {
            Error::invalid_argument(format!("message of {} bytes exceeds the wire limit", total_length))
        })?;

        let request_id = self.request_id.unwrap_or_else(next_request_id);

        let header = Header {
            length: total_length,
            request_id,
            response_to: self.response_to,
            flags: self.flags.bits(),
        };

        header.write_to(writer).await?;
        writer.write_all(&sections).await?;
        writer.flush().await?;

        Ok(request_id)
    }

    fn get_sections_bytes(&self) -> Vec<u8> {
        let mut sections = Vec::new();

        // Payload type 0
        sections.push(0);
        sections.extend(self.document_payload.as_bytes());

        for document_sequence in &self.document_sequences {
            // Payload type 1
            sections.push(1);

            let identifier_bytes = document_sequence.identifier.as_bytes();
            let documents_size: usize = document_sequence
                .documents
                .iter()
                .map(|document| document.as_bytes().len())
                .sum();

            // size bytes + identifier bytes + null terminator + document bytes
            let size = 4 + identifier_bytes.len() + 1 + documents_size;
            sections.extend((size as i32).to_le_bytes());
            sections.extend(identifier_bytes);
            sections.push(0);

            for document in &document_sequence.documents {
                sections.extend(document.as_bytes());
            }
        }

        sections
    }
}

/// One section of a message body.
#[derive(Debug)]
enum MessageSection {
    Document(RawDocumentBuf),
    Sequence(DocumentSequence),
}

impl MessageSection {
    /// Reads one section off the front of `body`, advancing it.
    fn read(body: &mut &[u8]) -> Result<Self> {
        let payload_type = read_u8(body)?;

        if payload_type == 0 {
            return Ok(MessageSection::Document(read_document(body)?));
        }
        if payload_type != 1 {
            return Err(Error::invalid_response(format!(
                "invalid payload type: {}",
                payload_type
            )));
        }

        let size = read_i32(body)? as usize;
        let content_len = size.checked_sub(4).ok_or_else(|| {
            Error::invalid_response(format!("invalid document sequence size: {}", size))
        })?;
        if body.len() < content_len {
            return Err(Error::invalid_response(
                "document sequence extends past the end of the message",
            ));
        }

        let (mut content, rest) = body.split_at(content_len);
        *body = rest;

        let nul = content
            .iter()
            .position(|byte| *byte == 0)
            .ok_or_else(|| Error::invalid_response("unterminated document sequence identifier"))?;
        let identifier = std::str::from_utf8(&content[..nul])
            .map_err(|_| Error::invalid_response("document sequence identifier is not UTF-8"))?
            .to_string();
        content = &content[nul + 1..];

        let mut documents = Vec::new();
        while !content.is_empty() {
            documents.push(read_document(&mut content)?);
        }

        Ok(MessageSection::Sequence(DocumentSequence {
            identifier,
            documents,
        }))
    }
}

fn read_u8(body: &mut &[u8]) -> Result<u8> {
    let (&byte, rest) = body
        .split_first()
        .ok_or_else(|| Error::invalid_response("unexpected end of message"))?;
    *body = rest;
    Ok(byte)
}

fn read_i32(body: &mut &[u8]) -> Result<i32> {
    if body.len() < 4 {
        return Err(Error::invalid_response("unexpected end of message"));
    }
    let (bytes, rest) = body.split_at(4);
    *body = rest;
    Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Reads one length-prefixed document off the front of `body` without copying past its end.
fn read_document(body: &mut &[u8]) -> Result<RawDocumentBuf> {
    if body.len() < 4 {
        return Err(Error::invalid_response("unexpected end of message"));
    }
    let declared = i32::from_le_bytes(body[..4].try_into().unwrap());
    let len = usize::try_from(declared)
        .ok()
        .filter(|len| *len >= 5 && *len <= body.len())
        .ok_or_else(|| {
            Error::invalid_response(format!("invalid document length: {}", declared))
        })?;

    let (document_bytes, rest) = body.split_at(len);
    let document = RawDocumentBuf::from_bytes(document_bytes.to_vec())
        .map_err(|err| Error::new(ErrorKind::from(err)))?;
    *body = rest;
    Ok(document)
}

#[cfg(test)]
mod test {
    use bson::rawdoc;
    use pretty_assertions::assert_eq;

    use super::{DocumentSequence, Message, MessageFlags};

    #[tokio::test]
    async fn message_round_trip() {
        let message = Message {
            document_payload: rawdoc! { "find": "events", "batchSize": 2 },
            document_sequences: vec![DocumentSequence {
                identifier: "documents".to_string(),
                documents: vec![rawdoc! { "x": 1 }, rawdoc! { "x": 2 }],
            }],
            request_id: Some(42),
            response_to: 0,
            flags: MessageFlags::empty(),
        };

        let mut bytes = Vec::new();
        let request_id = message.write_to(&mut bytes).await.unwrap();
        assert_eq!(request_id, 42);

        let parsed = Message::read_from(&mut bytes.as_slice(), None).await.unwrap();
        assert_eq!(parsed.request_id, Some(42));
        assert_eq!(parsed.response_to, 0);
        assert_eq!(parsed.document_payload, message.document_payload);
        assert_eq!(parsed.document_sequences.len(), 1);
        assert_eq!(parsed.document_sequences[0].identifier, "documents");
        assert_eq!(
            parsed.document_sequences[0].documents,
            message.document_sequences[0].documents
        );
    }

    #[tokio::test]
    async fn reply_round_trip() {
        let reply = Message {
            document_payload: rawdoc! { "ok": 1.0, "n": 3 },
            document_sequences: Vec::new(),
            request_id: Some(7),
            response_to: 42,
            flags: MessageFlags::MORE_TO_COME,
        };

        let mut bytes = Vec::new();
        reply.write_to(&mut bytes).await.unwrap();

        let parsed = Message::read_from(&mut bytes.as_slice(), None).await.unwrap();
        assert_eq!(parsed.response_to, 42);
        assert!(parsed.flags.contains(MessageFlags::MORE_TO_COME));
    }

    #[tokio::test]
    async fn oversized_message_rejected() {
        let message = Message::new_request(rawdoc! { "ping": 1 });
        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();

        let err = Message::read_from(&mut bytes.as_slice(), Some(8))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("over maximum"));
    }

    #[tokio::test]
    async fn truncated_message_rejected() {
        let message = Message::new_request(rawdoc! { "ping": 1 });
        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();
        bytes.truncate(bytes.len() - 3);

        assert!(Message::read_from(&mut bytes.as_slice(), None).await.is_err());
    }

    #[test]
    fn request_ids_are_unique() {
        let first = super::next_request_id();
        let second = super::next_request_id();
        assert_ne!(first, second);
    }
}
