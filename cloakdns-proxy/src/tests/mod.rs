//! Crate-level test suites: end-to-end scenarios against an in-process
//! mock resolver, and property tests for the wire-level laws.


use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use std::str::FromStr;

pub(crate) fn query_packet(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
    message.to_bytes().unwrap()
}
