//! DNSCrypt v2 client transport.
//!
//! Certificate discovery over plain DNS TXT queries, then encrypted
//! exchanges over UDP or TCP. Wire layout:
//!
//! ```text
//! query:    client-magic(8) client-pk(32) client-nonce(12) box(padded dns)
//! response: resolver-magic(8) client-nonce(12) server-nonce(12) box(padded dns)
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use cloakdns_crypto::{
    cert, pad, random_half_nonce, unpad, Certificate, KeyPair, HALF_NONCE_SIZE, KEY_SIZE,
    NONCE_SIZE, PAD_BLOCK_SIZE, QUERY_OVERHEAD, RESOLVER_MAGIC, RESPONSE_OVERHEAD,
};

use crate::catalog::ServerInfo;
use crate::config::MainProto;
use crate::dns::{self, MAX_PACKET_SIZE};
use crate::error::{ProxyError, Result};
use crate::estimator::SizeEstimator;

/// Largest padded plaintext that still fits a `MAX_PACKET_SIZE` datagram
/// once the encrypted framing is added.
const MAX_PADDED_QUERY: usize = (MAX_PACKET_SIZE - QUERY_OVERHEAD) / PAD_BLOCK_SIZE * PAD_BLOCK_SIZE;

/// Encrypt one query for a server. Returns the wire packet and the client
/// nonce half the response must echo.
pub fn encrypt_query(
    keys: &KeyPair,
    estimator: &SizeEstimator,
    server: &ServerInfo,
    packet: &[u8],
    server_proto: MainProto,
) -> Result<(Vec<u8>, [u8; HALF_NONCE_SIZE])> {
    let shared_key = server.shared_key.as_ref().ok_or(ProxyError::NoCertificate)?;
    let client_magic = server.client_magic.ok_or(ProxyError::NoCertificate)?;

    let client_nonce = random_half_nonce();
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..HALF_NONCE_SIZE].copy_from_slice(&client_nonce);

    // Over UDP every query is padded to the shared estimator target; over
    // TCP a small random amount is enough since fragmentation is moot.
    let min_size = match server_proto {
        MainProto::Udp => estimator.question_size(),
        MainProto::Tcp => packet.len() + 1 + rand::thread_rng().gen_range(0..256),
    };
    let padded = pad(packet, min_size.min(MAX_PADDED_QUERY));
    if padded.len() > MAX_PADDED_QUERY {
        return Err(ProxyError::QuestionTooLarge);
    }
    let sealed = shared_key.seal(&nonce, &padded)?;

    let mut wire = Vec::with_capacity(QUERY_OVERHEAD + padded.len());
    wire.extend_from_slice(&client_magic);
    wire.extend_from_slice(&keys.public_bytes());
    wire.extend_from_slice(&client_nonce);
    wire.extend_from_slice(&sealed);
    Ok((wire, client_nonce))
}

/// Open a server response: check the resolver magic, require our nonce in
/// the echoed half, then unseal and unpad.
pub fn decrypt_response(
    server: &ServerInfo,
    encrypted: &[u8],
    client_nonce: &[u8; HALF_NONCE_SIZE],
) -> Result<Vec<u8>> {
    let shared_key = server.shared_key.as_ref().ok_or(ProxyError::NoCertificate)?;
    if encrypted.len() < RESPONSE_OVERHEAD {
        return Err(ProxyError::PacketSize(encrypted.len()));
    }
    if encrypted[..RESOLVER_MAGIC.len()] != RESOLVER_MAGIC {
        return Err(ProxyError::UnexpectedMagic);
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&encrypted[RESOLVER_MAGIC.len()..RESOLVER_MAGIC.len() + NONCE_SIZE]);
    if nonce[..HALF_NONCE_SIZE] != client_nonce[..] {
        return Err(ProxyError::NonceMismatch);
    }
    let plaintext = shared_key.open(&nonce, &encrypted[RESOLVER_MAGIC.len() + NONCE_SIZE..])?;
    Ok(unpad(&plaintext)?.to_vec())
}

/// One encrypted UDP round trip.
pub async fn exchange_udp(
    server: &ServerInfo,
    encrypted_query: &[u8],
    client_nonce: &[u8; HALF_NONCE_SIZE],
) -> Result<Vec<u8>> {
    let addr = server.udp_addr.ok_or(ProxyError::NoServers)?;
    let socket = udp_socket_for(&addr).await?;
    socket.connect(addr).await?;
    socket.send(encrypted_query).await?;

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let len = timeout(server.timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| ProxyError::Timeout)??;
    decrypt_response(server, &buf[..len], client_nonce)
}

/// One encrypted TCP round trip, length-prefixed both ways.
pub async fn exchange_tcp(
    server: &ServerInfo,
    encrypted_query: Vec<u8>,
    client_nonce: &[u8; HALF_NONCE_SIZE],
) -> Result<Vec<u8>> {
    let addr = server.tcp_addr.ok_or(ProxyError::NoServers)?;
    let mut stream = timeout(server.timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::Timeout)??;

    let framed = dns::prefix_with_size(encrypted_query)?;
    stream.write_all(&framed).await?;

    let encrypted_response = timeout(server.timeout, dns::read_prefixed(&mut stream))
        .await
        .map_err(|_| ProxyError::Timeout)??;
    decrypt_response(server, &encrypted_response, client_nonce)
}

/// Fetch and select the server's current certificate via a plain TXT
/// query for the provider name, sent to the server itself. UDP first,
/// falling back to TCP on truncation or failure. Returns the selected
/// certificate and the measured round-trip time.
pub async fn fetch_certificate(
    provider_name: &str,
    provider_pk: &[u8; KEY_SIZE],
    addr: SocketAddr,
    query_timeout: Duration,
    ignore_timestamp: bool,
) -> Result<(Certificate, Duration)> {
    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(
        Name::from_ascii(provider_name)?,
        RecordType::TXT,
    ));
    let query = message.to_bytes()?;

    let begin = Instant::now();
    let response = plain_exchange(&query, addr, query_timeout).await?;
    let rtt = begin.elapsed();

    if dns::transaction_id(&response) != message.id() || !dns::is_response(&response) {
        return Err(ProxyError::Protocol("mismatched certificate response".into()));
    }

    let parsed = Message::from_bytes(&response)?;
    let mut certs = Vec::new();
    for record in parsed.answers() {
        let RData::TXT(txt) = record.data() else {
            continue;
        };
        let bin: Vec<u8> = txt.iter().flat_map(|seg| seg.iter().copied()).collect();
        match Certificate::parse(&bin, provider_pk) {
            Ok(cert) => certs.push(cert),
            Err(e) => debug!("skipping certificate from [{provider_name}]: {e}"),
        }
    }

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    cert::select(&certs, now, ignore_timestamp)
        .copied()
        .map(|cert| (cert, rtt))
        .ok_or(ProxyError::NoCertificate)
}

/// Unencrypted DNS exchange used for certificate discovery.
async fn plain_exchange(query: &[u8], addr: SocketAddr, query_timeout: Duration) -> Result<Vec<u8>> {
    let udp_result = async {
        let socket = udp_socket_for(&addr).await?;
        socket.connect(addr).await?;
        socket.send(query).await?;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let len = timeout(query_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        buf.truncate(len);
        Ok::<_, ProxyError>(buf)
    }
    .await;

    match udp_result {
        Ok(response) if !dns::has_tc_flag(&response) => Ok(response),
        _ => {
            let mut stream = timeout(query_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| ProxyError::Timeout)??;
            let framed = dns::prefix_with_size(query.to_vec())?;
            stream.write_all(&framed).await?;
            timeout(query_timeout, dns::read_prefixed(&mut stream))
                .await
                .map_err(|_| ProxyError::Timeout)?
        }
    }
}

async fn udp_socket_for(addr: &SocketAddr) -> Result<UdpSocket> {
    let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    Ok(UdpSocket::bind(bind_addr).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloakdns_crypto::{EncryptionSystem, SharedKey};
    use std::sync::Arc;

    fn server_pair() -> (Arc<ServerInfo>, KeyPair, KeyPair) {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let info = Arc::new(ServerInfo::new_dnscrypt(
            "test".into(),
            "127.0.0.1:8443".parse().unwrap(),
            "127.0.0.1:8443".parse().unwrap(),
            *b"testmgic",
            SharedKey::new(
                EncryptionSystem::XChaCha20Poly1305,
                &server.public_bytes(),
                &client,
            ),
            Duration::from_secs(2),
            Duration::from_millis(10),
        ));
        (info, client, server)
    }

    #[test]
    fn encrypted_query_layout() {
        let (server, client, _server_keys) = server_pair();
        let estimator = SizeEstimator::new();
        let packet = vec![0x11; 50];
        let (wire, nonce) =
            encrypt_query(&client, &estimator, &server, &packet, MainProto::Udp).unwrap();

        assert_eq!(&wire[..8], b"testmgic");
        assert_eq!(&wire[8..40], &client.public_bytes());
        assert_eq!(&wire[40..52], &nonce);
        // Padded to the estimator target plus the AEAD tag.
        assert_eq!(wire.len(), 52 + estimator.question_size() + 16);
    }

    #[test]
    fn query_round_trip_through_server_side() {
        let (server, client, server_keys) = server_pair();
        let estimator = SizeEstimator::new();
        let packet = b"\x00\x2a dummy dns query".to_vec();
        let (wire, client_nonce) =
            encrypt_query(&client, &estimator, &server, &packet, MainProto::Udp).unwrap();

        // Server side: derive the same shared key from the client pk.
        let mut client_pk = [0u8; KEY_SIZE];
        client_pk.copy_from_slice(&wire[8..40]);
        let server_key = SharedKey::new(
            EncryptionSystem::XChaCha20Poly1305,
            &client_pk,
            &server_keys,
        );
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..HALF_NONCE_SIZE].copy_from_slice(&wire[40..52]);
        let plaintext = server_key.open(&nonce, &wire[52..]).unwrap();
        assert_eq!(unpad(&plaintext).unwrap(), &packet[..]);

        // And back: a well-formed response decrypts.
        let response_dns = b"\x00\x2a dummy dns response".to_vec();
        let mut full_nonce = nonce;
        full_nonce[HALF_NONCE_SIZE..].copy_from_slice(&[9u8; HALF_NONCE_SIZE]);
        let sealed = server_key
            .seal(&full_nonce, &pad(&response_dns, response_dns.len() + 1))
            .unwrap();
        let mut encrypted = Vec::new();
        encrypted.extend_from_slice(&RESOLVER_MAGIC);
        encrypted.extend_from_slice(&full_nonce);
        encrypted.extend_from_slice(&sealed);

        let opened = decrypt_response(&server, &encrypted, &client_nonce).unwrap();
        assert_eq!(opened, response_dns);
    }

    #[test]
    fn response_with_wrong_magic_or_nonce_is_rejected() {
        let (server, client, server_keys) = server_pair();
        let estimator = SizeEstimator::new();
        let (wire, client_nonce) = encrypt_query(
            &client,
            &estimator,
            &server,
            b"\x00\x01 query",
            MainProto::Udp,
        )
        .unwrap();

        let mut client_pk = [0u8; KEY_SIZE];
        client_pk.copy_from_slice(&wire[8..40]);
        let server_key = SharedKey::new(
            EncryptionSystem::XChaCha20Poly1305,
            &client_pk,
            &server_keys,
        );
        let mut full_nonce = [0u8; NONCE_SIZE];
        full_nonce[..HALF_NONCE_SIZE].copy_from_slice(&client_nonce);
        let sealed = server_key.seal(&full_nonce, &pad(b"resp", 64)).unwrap();

        let mut good = Vec::new();
        good.extend_from_slice(&RESOLVER_MAGIC);
        good.extend_from_slice(&full_nonce);
        good.extend_from_slice(&sealed);

        let mut bad_magic = good.clone();
        bad_magic[0] ^= 0xff;
        assert!(matches!(
            decrypt_response(&server, &bad_magic, &client_nonce),
            Err(ProxyError::UnexpectedMagic)
        ));

        let mut bad_nonce = good;
        bad_nonce[RESOLVER_MAGIC.len()] ^= 0xff;
        assert!(matches!(
            decrypt_response(&server, &bad_nonce, &client_nonce),
            Err(ProxyError::NonceMismatch)
        ));
    }

    #[test]
    fn oversized_question_is_refused() {
        let (server, client, _) = server_pair();
        let estimator = SizeEstimator::new();
        let packet = vec![0u8; MAX_PADDED_QUERY];
        assert!(matches!(
            encrypt_query(&client, &estimator, &server, &packet, MainProto::Tcp),
            Err(ProxyError::QuestionTooLarge)
        ));
    }
}
