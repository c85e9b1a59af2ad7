//! MongoDB wire protocol framing: MsgHeader, OP_MSG (kind-0 + kind-1 sections,
//! optional CRC-32C checksum), legacy OP_QUERY, and OP_REPLY.

use crate::error::{Error, Result};
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 16 {
            return None;
        }
        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let request_id = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let response_to = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        Some((
            Self {
                message_length,
                request_id,
                response_to,
                op_code,
            },
            16,
        ))
    }
}

pub const OP_MSG: i32 = 2013;
pub const OP_COMPRESSED: i32 = 2012;
pub const OP_QUERY: i32 = 2004;
pub const OP_REPLY: i32 = 1;

pub const CHECKSUM_PRESENT: u32 = 1 << 0;
pub const MORE_TO_COME: u32 = 1 << 1;

/// A single kind-1 document sequence: its C-string identifier plus the documents it carries.
#[derive(Debug, Clone)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone)]
pub struct OpMsg {
    pub flags: u32,
    pub body: Document,
    pub sequences: Vec<DocumentSequence>,
}

impl OpMsg {
    pub fn sequence(&self, identifier: &str) -> Option<&[Document]> {
        self.sequences
            .iter()
            .find(|s| s.identifier == identifier)
            .map(|s| s.documents.as_slice())
    }
}

#[derive(Debug, Clone)]
pub struct OpQuery {
    pub flags: u32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
}

#[derive(Debug, Clone)]
pub enum Message {
    Msg(OpMsg),
    Query(OpQuery),
}

/// Reads one framed message off `stream`, enforcing `max_message_size` and verifying
/// the CRC-32C trailer when `CHECKSUM_PRESENT` is set. Any failure here is a
/// `ProtocolError`: the caller must close the connection without replying.
pub async fn read_message<R>(stream: &mut R, max_message_size: i32) -> Result<(MessageHeader, Message)>
where
    R: AsyncRead + Unpin,
{
    let mut hdr_buf = [0u8; 16];
    stream.read_exact(&mut hdr_buf).await?;
    let (header, _) =
        MessageHeader::parse(&hdr_buf).ok_or_else(|| Error::Protocol("short header".into()))?;
    if header.message_length < 16 {
        return Err(Error::Protocol("messageLength below minimum".into()));
    }
    if header.message_length > max_message_size {
        return Err(Error::Protocol("messageLength exceeds max_message_size".into()));
    }
    let body_len = (header.message_length - 16) as usize;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await?;

    let message = match header.op_code {
        OP_MSG => Message::Msg(decode_op_msg(&hdr_buf, &body)?),
        OP_QUERY => Message::Query(decode_op_query(&body)?),
        other => return Err(Error::Protocol(format!("unsupported opcode {other}"))),
    };
    Ok((header, message))
}

/// Decodes an OP_MSG body (flags + sections [+ checksum]). `header_bytes` is the
/// preceding 16-byte header, needed to verify the CRC-32C checksum, which covers
/// the whole message except the checksum field itself.
pub fn decode_op_msg(header_bytes: &[u8], body: &[u8]) -> Result<OpMsg> {
    if body.len() < 4 {
        return Err(Error::Protocol("OP_MSG body too short for flags".into()));
    }
    let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let checksum_present = flags & CHECKSUM_PRESENT != 0;

    let sections_end = if checksum_present {
        if body.len() < 8 {
            return Err(Error::Protocol("OP_MSG body too short for checksum".into()));
        }
        let end = body.len() - 4;
        let expected = u32::from_le_bytes([
            body[end],
            body[end + 1],
            body[end + 2],
            body[end + 3],
        ]);
        let mut hasher_input = Vec::with_capacity(header_bytes.len() + end);
        hasher_input.extend_from_slice(header_bytes);
        hasher_input.extend_from_slice(&body[..end]);
        let actual = crc32c::crc32c(&hasher_input);
        if actual != expected {
            return Err(Error::Protocol("checksum mismatch".into()));
        }
        end
    } else {
        body.len()
    };

    let mut offset = 4usize;
    let mut body_section: Option<Document> = None;
    let mut sequences: Vec<DocumentSequence> = Vec::new();

    while offset < sections_end {
        let kind = body[offset];
        offset += 1;
        match kind {
            0 => {
                let (doc, consumed) = decode_one_document(&body[offset..sections_end])?;
                if body_section.is_some() {
                    return Err(Error::Protocol("more than one kind-0 section".into()));
                }
                body_section = Some(doc);
                offset += consumed;
            }
            1 => {
                if offset + 4 > sections_end {
                    return Err(Error::Protocol("truncated kind-1 section".into()));
                }
                let section_len = i32::from_le_bytes([
                    body[offset],
                    body[offset + 1],
                    body[offset + 2],
                    body[offset + 3],
                ]) as usize;
                let section_start = offset;
                let section_stop = section_start + section_len;
                if section_len < 4 || section_stop > sections_end {
                    return Err(Error::Protocol("invalid kind-1 section length".into()));
                }
                let mut p = section_start + 4;
                let id_end = body[p..section_stop]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|rel| p + rel)
                    .ok_or_else(|| Error::Protocol("unterminated sequence identifier".into()))?;
                let identifier = std::str::from_utf8(&body[p..id_end])
                    .map_err(|_| Error::Protocol("non-utf8 sequence identifier".into()))?
                    .to_string();
                p = id_end + 1;
                let mut documents = Vec::new();
                while p < section_stop {
                    let (doc, consumed) = decode_one_document(&body[p..section_stop])?;
                    documents.push(doc);
                    p += consumed;
                }
                if sequences.iter().any(|s: &DocumentSequence| s.identifier == identifier) {
                    return Err(Error::Protocol(format!(
                        "duplicate document sequence identifier: {identifier}"
                    )));
                }
                sequences.push(DocumentSequence { identifier, documents });
                offset = section_stop;
            }
            other => return Err(Error::Protocol(format!("unknown section kind {other}"))),
        }
    }

    let body = body_section.ok_or_else(|| Error::Protocol("missing kind-0 section".into()))?;
    Ok(OpMsg {
        flags,
        body,
        sequences,
    })
}

fn decode_one_document(buf: &[u8]) -> Result<(Document, usize)> {
    if buf.len() < 4 {
        return Err(Error::Protocol("truncated document length".into()));
    }
    let len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len < 5 || len > buf.len() {
        return Err(Error::Protocol("malformed document length".into()));
    }
    let doc = bson::Document::from_reader(&mut std::io::Cursor::new(&buf[..len]))
        .map_err(|e| Error::Protocol(format!("malformed BSON document: {e}")))?;
    Ok((doc, len))
}

/// Encodes an OP_MSG with a single kind-0 section. The server never emits kind-1
/// sections or sets `CHECKSUM_PRESENT` on its own replies.
pub fn encode_op_msg(doc: &Document, response_to: i32, request_id: i32) -> Vec<u8> {
    let doc_bytes = bson::to_vec(doc).expect("bson encode");
    let flags: u32 = 0;
    let body_len = 4 + 1 + doc_bytes.len();
    let message_length = 16 + body_len as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    out.extend_from_slice(&message_length.to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&response_to.to_le_bytes());
    out.extend_from_slice(&OP_MSG.to_le_bytes());

    out.extend_from_slice(&flags.to_le_bytes());
    out.push(0u8);
    out.extend_from_slice(&doc_bytes);
    out
}

/// Decode OP_QUERY body into its fields.
pub fn decode_op_query(body: &[u8]) -> Result<OpQuery> {
    if body.len() < 4 {
        return Err(Error::Protocol("OP_QUERY body too short".into()));
    }
    let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let mut i = 4;
    let mut end = i;
    while end < body.len() && body[end] != 0 {
        end += 1;
    }
    if end >= body.len() {
        return Err(Error::Protocol("unterminated collection name".into()));
    }
    let full_collection_name = std::str::from_utf8(&body[i..end])
        .map_err(|_| Error::Protocol("non-utf8 collection name".into()))?
        .to_string();
    i = end + 1;
    if i + 8 > body.len() {
        return Err(Error::Protocol("OP_QUERY body truncated".into()));
    }
    let number_to_skip = i32::from_le_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
    i += 4;
    let number_to_return = i32::from_le_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
    i += 4;
    if i >= body.len() {
        return Err(Error::Protocol("OP_QUERY missing query document".into()));
    }
    let (query, _) = decode_one_document(&body[i..])?;
    Ok(OpQuery {
        flags,
        full_collection_name,
        number_to_skip,
        number_to_return,
        query,
    })
}

/// Encode OP_REPLY with the provided documents (used only for the pre-handshake
/// legacy OP_QUERY path).
pub fn encode_op_reply(docs: &[Document], response_to: i32, request_id: i32) -> Vec<u8> {
    let response_flags: u32 = 0;
    let cursor_id: i64 = 0;
    let starting_from: i32 = 0;
    let number_returned: i32 = docs.len() as i32;

    let mut docs_buf = Vec::new();
    for d in docs {
        let b = bson::to_vec(d).expect("bson encode");
        docs_buf.extend_from_slice(&b);
    }

    let body_len = 4 + 8 + 4 + 4 + docs_buf.len();
    let message_length = 16 + body_len as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    out.extend_from_slice(&message_length.to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&response_to.to_le_bytes());
    out.extend_from_slice(&OP_REPLY.to_le_bytes());

    out.extend_from_slice(&response_flags.to_le_bytes());
    out.extend_from_slice(&cursor_id.to_le_bytes());
    out.extend_from_slice(&starting_from.to_le_bytes());
    out.extend_from_slice(&number_returned.to_le_bytes());
    out.extend_from_slice(&docs_buf);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn header_roundtrip() {
        let msg = doc! { "ping": 1.0, "$db": "admin" };
        let bytes = encode_op_msg(&msg, 7, 42);
        let (header, _) = MessageHeader::parse(&bytes).unwrap();
        assert_eq!(header.message_length as usize, bytes.len());
        assert_eq!(header.request_id, 42);
        assert_eq!(header.response_to, 7);
        assert_eq!(header.op_code, OP_MSG);
    }

    #[test]
    fn decode_section0_roundtrip() {
        let msg = doc! { "hello": 1.0, "$db": "admin" };
        let bytes = encode_op_msg(&msg, 0, 1);
        let decoded = decode_op_msg(&bytes[0..16], &bytes[16..]).unwrap();
        assert_eq!(decoded.body, msg);
        assert!(decoded.sequences.is_empty());
    }

    #[test]
    fn decode_kind1_sequence() {
        let header_bytes = [0u8; 16];
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes()); // flags
        // kind 0
        let cmd = doc! { "insert": "c", "$db": "d" };
        let cmd_bytes = bson::to_vec(&cmd).unwrap();
        body.push(0u8);
        body.extend_from_slice(&cmd_bytes);
        // kind 1
        let d1 = doc! { "_id": 1i32 };
        let d1_bytes = bson::to_vec(&d1).unwrap();
        let identifier = b"documents\0";
        let section_len = 4 + identifier.len() + d1_bytes.len();
        body.push(1u8);
        body.extend_from_slice(&(section_len as i32).to_le_bytes());
        body.extend_from_slice(identifier);
        body.extend_from_slice(&d1_bytes);

        let decoded = decode_op_msg(&header_bytes, &body).unwrap();
        assert_eq!(decoded.body, cmd);
        assert_eq!(decoded.sequences.len(), 1);
        assert_eq!(decoded.sequences[0].identifier, "documents");
        assert_eq!(decoded.sequences[0].documents, vec![d1]);
    }

    #[test]
    fn rejects_bad_checksum() {
        let header_bytes = [0u8; 16];
        let mut body = Vec::new();
        body.extend_from_slice(&CHECKSUM_PRESENT.to_le_bytes());
        let cmd = doc! { "ping": 1.0, "$db": "admin" };
        let cmd_bytes = bson::to_vec(&cmd).unwrap();
        body.push(0u8);
        body.extend_from_slice(&cmd_bytes);
        body.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
        let result = decode_op_msg(&header_bytes, &body);
        assert!(result.is_err());
    }
}
