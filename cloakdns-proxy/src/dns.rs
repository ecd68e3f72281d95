//! DNS wire helpers.
//!
//! Message-level work goes through hickory-proto; the handful of
//! operations that only touch header bytes (flag checks, transaction ids)
//! stay on the raw packet to avoid a full decode on the hot path.

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};

/// Fixed DNS header length.
pub const DNS_HEADER_SIZE: usize = 12;

/// Smallest packet worth looking at: header plus an empty question.
pub const MIN_PACKET_SIZE: usize = DNS_HEADER_SIZE + 5;

/// Largest packet accepted anywhere in the engine.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Largest response a UDP client is sent before falling back to a
/// truncated shell.
pub const MAX_UDP_PACKET_SIZE: usize = 512;

/// Transaction id from the first header bytes.
pub fn transaction_id(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[0], packet[1]])
}

/// Overwrite the transaction id in place.
pub fn set_transaction_id(packet: &mut [u8], id: u16) {
    packet[..2].copy_from_slice(&id.to_be_bytes());
}

/// Whether the TC (truncated) flag is set.
pub fn has_tc_flag(packet: &[u8]) -> bool {
    packet.len() >= DNS_HEADER_SIZE && packet[2] & 0x02 != 0
}

/// Whether the QR flag marks this packet as a response.
pub fn is_response(packet: &[u8]) -> bool {
    packet.len() >= DNS_HEADER_SIZE && packet[2] & 0x80 != 0
}

/// Start a response message mirroring a query: same id and question,
/// recursion bits set the way a forwarder answers.
pub fn synthetic_response(query: &Message, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response.set_response_code(rcode);
    response
}

/// Replace an oversized UDP response with an empty shell carrying TC=1,
/// so the client retries over TCP.
pub fn truncated_shell(response: &[u8]) -> Result<Vec<u8>> {
    let parsed = Message::from_bytes(response)?;
    let mut shell = synthetic_response(&parsed, parsed.response_code());
    shell.set_truncated(true);
    Ok(shell.to_bytes()?)
}

/// Prepend the 2-byte big-endian length used by DNS over TCP.
pub fn prefix_with_size(packet: Vec<u8>) -> Result<Vec<u8>> {
    if packet.len() > u16::MAX as usize {
        return Err(ProxyError::PacketSize(packet.len()));
    }
    let mut framed = Vec::with_capacity(packet.len() + 2);
    framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    framed.extend_from_slice(&packet);
    Ok(framed)
}

/// Read one length-prefixed packet from a TCP-style stream.
pub async fn read_prefixed<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_PACKET_SIZE {
        return Err(ProxyError::PacketSize(len));
    }
    let mut packet = vec![0u8; len];
    reader.read_exact(&mut packet).await?;
    Ok(packet)
}
