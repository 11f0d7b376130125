//! Boundary to the DNS wire format, backed by `hickory-proto`.

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};

use crate::error::Error;

/// A DNS question as supplied by the caller.
///
/// `message_type` defaults to a query and `recursion_desired` to `true` when
/// left unset. Without an `id`, DoH exchanges use 0 and UDP a random id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: Option<u16>,
    pub message_type: Option<MessageType>,
    pub recursion_desired: Option<bool>,
    pub queries: Vec<Query>,
}

impl DnsQuery {
    pub fn new(name: &str, record_type: RecordType) -> Result<Self, Error> {
        let name = Name::from_ascii(name).map_err(|e| {
            Error::invalid_input(format!("invalid domain name {name}: {e}"))
        })?;
        Ok(DnsQuery {
            queries: vec![Query::query(name, record_type)],
            ..Default::default()
        })
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_recursion_desired(mut self, recursion_desired: bool) -> Self {
        self.recursion_desired = Some(recursion_desired);
        self
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.queries.push(query);
        self
    }

    /// Builds the wire message, filling unset fields with their defaults.
    pub fn to_message(&self, default_id: u16) -> Message {
        let mut message = Message::new();
        message
            .set_id(self.id.unwrap_or(default_id))
            .set_message_type(self.message_type.unwrap_or(MessageType::Query))
            .set_op_code(OpCode::Query)
            .set_recursion_desired(self.recursion_desired.unwrap_or(true));
        message.add_queries(self.queries.iter().cloned());
        message
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, ProtoError> {
    message.to_vec()
}

pub fn decode(bytes: &[u8]) -> Result<Message, ProtoError> {
    Message::from_vec(bytes)
}

/// Decodes a resolver answer, telling "no answer" apart from "malformed answer".
pub(crate) fn decode_response(bytes: &[u8]) -> Result<Message, Error> {
    if bytes.is_empty() {
        return Err(Error::response("Empty."));
    }
    decode(bytes).map_err(Error::invalid_packet)
}
