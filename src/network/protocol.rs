//! Binary Wire Protocol Implementation
//!
//! Implements the framed request/response protocol spoken by Photon and other
//! MongoDB-compatible document databases. Every message starts with a 16-byte
//! header (total length, request id, response-to id, opcode), all fields
//! little-endian, followed by an opcode-specific body.

use crate::error::{Error, Result};
use bson::Document;

/// Opcode constants
pub const OP_REPLY: i32 = 1;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;

/// Size of the standard message header
pub const HEADER_LEN: usize = 16;

/// Insert flags
pub const INSERT_CONTINUE_ON_ERROR: i32 = 1;

/// Update flags
pub const UPDATE_UPSERT: i32 = 1;
pub const UPDATE_MULTI: i32 = 2;

/// Delete flags
pub const DELETE_SINGLE_REMOVE: i32 = 1;

/// Reply response flags
pub const REPLY_CURSOR_NOT_FOUND: i32 = 1;
pub const REPLY_QUERY_FAILURE: i32 = 2;
pub const REPLY_SHARD_CONFIG_STALE: i32 = 4;
pub const REPLY_AWAIT_CAPABLE: i32 = 8;

/// Standard message header shared by every opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MsgHeader {
    /// Parse the leading 16 bytes of a frame
    pub fn parse(frame: &[u8]) -> Result<MsgHeader> {
        if frame.len() < HEADER_LEN {
            return Err(Error::Parse(format!(
                "header needs {HEADER_LEN} bytes, got {}",
                frame.len()
            )));
        }
        let mut body = FrameReader::new(frame);
        Ok(MsgHeader {
            message_length: body.i32()?,
            request_id: body.i32()?,
            response_to: body.i32()?,
            op_code: body.i32()?,
        })
    }
}

/// A decoded reply frame
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    /// Decode a complete reply frame, header included
    pub fn decode(frame: &[u8]) -> Result<Reply> {
        let header = MsgHeader::parse(frame)?;
        check_frame_length(&header, frame)?;
        if header.op_code != OP_REPLY {
            return Err(Error::IncorrectReply);
        }
        let mut body = FrameReader::new(&frame[HEADER_LEN..]);
        let flags = body.i32()?;
        let cursor_id = body.i64()?;
        let starting_from = body.i32()?;
        let number_returned = body.i32()?;
        if number_returned < 0 {
            return Err(Error::Parse(format!(
                "reply claims {number_returned} documents"
            )));
        }
        let documents = body.documents_to_end()?;
        if documents.len() != number_returned as usize {
            return Err(Error::Parse(format!(
                "reply claims {number_returned} documents but carried {}",
                documents.len()
            )));
        }
        Ok(Reply {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    pub fn is_cursor_not_found(&self) -> bool {
        self.flags & REPLY_CURSOR_NOT_FOUND != 0
    }

    pub fn is_query_failure(&self) -> bool {
        self.flags & REPLY_QUERY_FAILURE != 0
    }

    pub fn is_shard_config_stale(&self) -> bool {
        self.flags & REPLY_SHARD_CONFIG_STALE != 0
    }

    pub fn is_await_capable(&self) -> bool {
        self.flags & REPLY_AWAIT_CAPABLE != 0
    }
}

/// A wire message, one variant per opcode
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Insert {
        request_id: i32,
        flags: i32,
        namespace: String,
        documents: Vec<Document>,
    },
    Update {
        request_id: i32,
        namespace: String,
        flags: i32,
        selector: Document,
        update: Document,
    },
    Delete {
        request_id: i32,
        namespace: String,
        flags: i32,
        selector: Document,
    },
    Query {
        request_id: i32,
        flags: i32,
        namespace: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: Document,
        projection: Option<Document>,
    },
    GetMore {
        request_id: i32,
        namespace: String,
        number_to_return: i32,
        cursor_id: i64,
    },
    KillCursors {
        request_id: i32,
        cursor_ids: Vec<i64>,
    },
    Reply(Reply),
}

impl Message {
    pub fn request_id(&self) -> i32 {
        match self {
            Message::Insert { request_id, .. }
            | Message::Update { request_id, .. }
            | Message::Delete { request_id, .. }
            | Message::Query { request_id, .. }
            | Message::GetMore { request_id, .. }
            | Message::KillCursors { request_id, .. } => *request_id,
            Message::Reply(reply) => reply.request_id,
        }
    }

    pub fn op_code(&self) -> i32 {
        match self {
            Message::Insert { .. } => OP_INSERT,
            Message::Update { .. } => OP_UPDATE,
            Message::Delete { .. } => OP_DELETE,
            Message::Query { .. } => OP_QUERY,
            Message::GetMore { .. } => OP_GET_MORE,
            Message::KillCursors { .. } => OP_KILL_CURSORS,
            Message::Reply(_) => OP_REPLY,
        }
    }

    fn response_to(&self) -> i32 {
        match self {
            Message::Reply(reply) => reply.response_to,
            _ => 0,
        }
    }

    /// Serialize into a complete frame, header included
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        match self {
            Message::Insert {
                flags,
                namespace,
                documents,
                ..
            } => {
                put_i32(&mut body, *flags);
                put_cstring(&mut body, namespace);
                for document in documents {
                    put_document(&mut body, document)?;
                }
            }
            Message::Update {
                namespace,
                flags,
                selector,
                update,
                ..
            } => {
                put_i32(&mut body, 0);
                put_cstring(&mut body, namespace);
                put_i32(&mut body, *flags);
                put_document(&mut body, selector)?;
                put_document(&mut body, update)?;
            }
            Message::Delete {
                namespace,
                flags,
                selector,
                ..
            } => {
                put_i32(&mut body, 0);
                put_cstring(&mut body, namespace);
                put_i32(&mut body, *flags);
                put_document(&mut body, selector)?;
            }
            Message::Query {
                flags,
                namespace,
                number_to_skip,
                number_to_return,
                query,
                projection,
                ..
            } => {
                put_i32(&mut body, *flags);
                put_cstring(&mut body, namespace);
                put_i32(&mut body, *number_to_skip);
                put_i32(&mut body, *number_to_return);
                put_document(&mut body, query)?;
                if let Some(projection) = projection {
                    put_document(&mut body, projection)?;
                }
            }
            Message::GetMore {
                namespace,
                number_to_return,
                cursor_id,
                ..
            } => {
                put_i32(&mut body, 0);
                put_cstring(&mut body, namespace);
                put_i32(&mut body, *number_to_return);
                put_i64(&mut body, *cursor_id);
            }
            Message::KillCursors { cursor_ids, .. } => {
                put_i32(&mut body, 0);
                put_i32(&mut body, cursor_ids.len() as i32);
                for cursor_id in cursor_ids {
                    put_i64(&mut body, *cursor_id);
                }
            }
            Message::Reply(reply) => {
                put_i32(&mut body, reply.flags);
                put_i64(&mut body, reply.cursor_id);
                put_i32(&mut body, reply.starting_from);
                put_i32(&mut body, reply.number_returned);
                for document in &reply.documents {
                    put_document(&mut body, document)?;
                }
            }
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        put_i32(&mut frame, (HEADER_LEN + body.len()) as i32);
        put_i32(&mut frame, self.request_id());
        put_i32(&mut frame, self.response_to());
        put_i32(&mut frame, self.op_code());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a complete frame, header included
    pub fn decode(frame: &[u8]) -> Result<Message> {
        let header = MsgHeader::parse(frame)?;
        check_frame_length(&header, frame)?;
        let mut body = FrameReader::new(&frame[HEADER_LEN..]);
        match header.op_code {
            OP_INSERT => Ok(Message::Insert {
                request_id: header.request_id,
                flags: body.i32()?,
                namespace: body.cstring()?,
                documents: body.documents_to_end()?,
            }),
            OP_UPDATE => {
                body.i32()?; // reserved
                Ok(Message::Update {
                    request_id: header.request_id,
                    namespace: body.cstring()?,
                    flags: body.i32()?,
                    selector: body.document()?,
                    update: body.document()?,
                })
            }
            OP_DELETE => {
                body.i32()?; // reserved
                Ok(Message::Delete {
                    request_id: header.request_id,
                    namespace: body.cstring()?,
                    flags: body.i32()?,
                    selector: body.document()?,
                })
            }
            OP_QUERY => {
                let flags = body.i32()?;
                let namespace = body.cstring()?;
                let number_to_skip = body.i32()?;
                let number_to_return = body.i32()?;
                let query = body.document()?;
                let projection = if body.remaining() > 0 {
                    Some(body.document()?)
                } else {
                    None
                };
                Ok(Message::Query {
                    request_id: header.request_id,
                    flags,
                    namespace,
                    number_to_skip,
                    number_to_return,
                    query,
                    projection,
                })
            }
            OP_GET_MORE => {
                body.i32()?; // reserved
                Ok(Message::GetMore {
                    request_id: header.request_id,
                    namespace: body.cstring()?,
                    number_to_return: body.i32()?,
                    cursor_id: body.i64()?,
                })
            }
            OP_KILL_CURSORS => {
                body.i32()?; // reserved
                let count = body.i32()?;
                if count < 0 {
                    return Err(Error::Parse(format!("negative cursor count {count}")));
                }
                let mut cursor_ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    cursor_ids.push(body.i64()?);
                }
                Ok(Message::KillCursors {
                    request_id: header.request_id,
                    cursor_ids,
                })
            }
            OP_REPLY => Reply::decode(frame).map(Message::Reply),
            other => Err(Error::Parse(format!("unknown opcode {other}"))),
        }
    }
}

fn check_frame_length(header: &MsgHeader, frame: &[u8]) -> Result<()> {
    if header.message_length < HEADER_LEN as i32 {
        return Err(Error::Parse(format!(
            "frame length {} is shorter than the header",
            header.message_length
        )));
    }
    if header.message_length as usize != frame.len() {
        return Err(Error::Parse(format!(
            "frame length {} disagrees with {} buffered bytes",
            header.message_length,
            frame.len()
        )));
    }
    Ok(())
}

fn put_i32(frame: &mut Vec<u8>, value: i32) {
    frame.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(frame: &mut Vec<u8>, value: i64) {
    frame.extend_from_slice(&value.to_le_bytes());
}

fn put_cstring(frame: &mut Vec<u8>, value: &str) {
    frame.extend_from_slice(value.as_bytes());
    frame.push(0);
}

fn put_document(frame: &mut Vec<u8>, document: &Document) -> Result<()> {
    document.to_writer(&mut *frame)?;
    Ok(())
}

/// Bounds-checked little-endian reader over one frame body
struct FrameReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buffer: &'a [u8]) -> FrameReader<'a> {
        FrameReader {
            buffer,
            position: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(Error::Parse(format!(
                "needed {count} more bytes, {} remain",
                self.remaining()
            )));
        }
        let slice = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn cstring(&mut self) -> Result<String> {
        let rest = &self.buffer[self.position..];
        let end = rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or_else(|| Error::Parse("unterminated cstring".into()))?;
        let value = std::str::from_utf8(&rest[..end])
            .map_err(|err| Error::Parse(format!("cstring is not utf-8: {err}")))?
            .to_string();
        self.position += end + 1;
        Ok(value)
    }

    fn document(&mut self) -> Result<Document> {
        if self.remaining() < 4 {
            return Err(Error::Parse("truncated document length".into()));
        }
        let at = self.position;
        let length = i32::from_le_bytes([
            self.buffer[at],
            self.buffer[at + 1],
            self.buffer[at + 2],
            self.buffer[at + 3],
        ]);
        if length < 5 {
            return Err(Error::Parse(format!("document length {length} is too small")));
        }
        let length = length as usize;
        if length > self.remaining() {
            return Err(Error::Parse("document extends past the frame".into()));
        }
        let mut reader = &self.buffer[at..at + length];
        let document = Document::from_reader(&mut reader)?;
        self.position += length;
        Ok(document)
    }

    fn documents_to_end(&mut self) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        while self.remaining() > 0 {
            documents.push(self.document()?);
        }
        Ok(documents)
    }
}
