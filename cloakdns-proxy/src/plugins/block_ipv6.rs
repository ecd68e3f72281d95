//! AAAA suppression for IPv6-free networks.

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use hickory_proto::serialize::binary::BinEncodable;

use crate::dns::synthetic_response;
use crate::error::Result;
use crate::plugins::{Plugin, PluginAction, PluginsState};

/// Answers every AAAA question locally with an empty response so clients
/// fall back to A records without waiting on an upstream.
pub struct BlockIpv6;

#[async_trait]
impl Plugin for BlockIpv6 {
    fn name(&self) -> &'static str {
        "block_ipv6"
    }

    async fn apply(&self, state: &mut PluginsState, _packet: &mut Vec<u8>) -> Result<()> {
        if state.qtype != RecordType::AAAA {
            return Ok(());
        }
        let synth = synthetic_response(&state.question, ResponseCode::NoError);
        state.synth = Some(synth.to_bytes()?);
        state.action = PluginAction::Synth;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::tests::{client_addr, query_packet};
    use crate::plugins::ClientProto;
    use hickory_proto::op::Message;
    use hickory_proto::serialize::binary::BinDecodable;

    #[tokio::test]
    async fn aaaa_gets_empty_synthetic_answer() {
        let packet = query_packet("example.com.", RecordType::AAAA);
        let mut state = PluginsState::new(&packet, ClientProto::Udp, client_addr()).unwrap();
        BlockIpv6.apply(&mut state, &mut packet.clone()).await.unwrap();

        assert_eq!(state.action, PluginAction::Synth);
        let synth = Message::from_bytes(state.synth.as_deref().unwrap()).unwrap();
        assert_eq!(synth.response_code(), ResponseCode::NoError);
        assert!(synth.answers().is_empty());
    }

    #[tokio::test]
    async fn a_queries_untouched() {
        let packet = query_packet("example.com.", RecordType::A);
        let mut state = PluginsState::new(&packet, ClientProto::Udp, client_addr()).unwrap();
        BlockIpv6.apply(&mut state, &mut packet.clone()).await.unwrap();
        assert_eq!(state.action, PluginAction::Forward);
    }
}
