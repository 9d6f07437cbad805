//! Wire message types for the Tally peer protocol.
//!
//! Gossip payloads are `MAGIC_BYTES ++ bincode(GossipMessage)`. Point-to-point
//! requests use a 4-byte big-endian length prefix followed by bincode.

use tally_core::constants::{
    MAGIC_BYTES, MAX_BLOCK_SIZE, MAX_HEADERS_PER_RESPONSE, MAX_LOCATOR_SIZE,
};
use tally_core::error::NetworkError;
use tally_core::types::{Block, BlockHeader, Hash256, Transaction};

use crate::inventory::{InvItem, InvKind};

/// Gossipsub topic for full block announcements.
pub const BLOCKS_TOPIC: &str = "/tally/blocks/1";

/// Gossipsub topic for loose transactions.
pub const TXS_TOPIC: &str = "/tally/txs/1";

/// Gossipsub topic for inventory announcements.
pub const INV_TOPIC: &str = "/tally/inv/1";

/// Protocol name for request-response.
pub const REQ_RESP_PROTOCOL: &str = "/tally/req-resp/1";

/// Maximum gossip message size (one block plus framing).
pub const MAX_MESSAGE_SIZE: usize = MAX_BLOCK_SIZE + 1024;

/// Blocks a single `GetData` may ask for.
pub const MAX_GETDATA_BLOCKS: usize = 8;

/// Inventory items a single `GetData` may carry.
pub const MAX_GETDATA_ITEMS: usize = 1_000;

/// Maximum request size.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Maximum response size (a full `GetData` worth of blocks).
pub const MAX_RESPONSE_SIZE: usize = MAX_GETDATA_BLOCKS * MAX_BLOCK_SIZE + 1024;

/// A message published over gossipsub.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum GossipMessage {
    /// Announcement of objects by hash only.
    Inv(Vec<InvItem>),
    Block(Block),
    Tx(Transaction),
}

impl GossipMessage {
    /// Encode as MAGIC_BYTES + bincode payload.
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        let payload = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| NetworkError::Encode(e.to_string()))?;
        let total_size = MAGIC_BYTES.len() + payload.len();
        if total_size > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge { size: total_size });
        }
        let mut buf = Vec::with_capacity(total_size);
        buf.extend_from_slice(&MAGIC_BYTES);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a gossip payload. Returns `None` for anything malformed or oversized.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() > MAX_MESSAGE_SIZE || data.len() < MAGIC_BYTES.len() {
            return None;
        }
        if data[..MAGIC_BYTES.len()] != MAGIC_BYTES {
            return None;
        }
        let (msg, _): (Self, usize) =
            bincode::decode_from_slice(&data[MAGIC_BYTES.len()..], bincode::config::standard())
                .ok()?;
        Some(msg)
    }

    /// Gossipsub topic this message belongs on.
    pub fn topic(&self) -> &'static str {
        match self {
            GossipMessage::Inv(_) => INV_TOPIC,
            GossipMessage::Block(_) => BLOCKS_TOPIC,
            GossipMessage::Tx(_) => TXS_TOPIC,
        }
    }
}

/// Point-to-point requests.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum TallyRequest {
    /// Headers following the first locator hash the peer recognizes.
    GetHeaders(Vec<Hash256>),
    /// Full objects for the listed inventory items.
    GetData(Vec<InvItem>),
    /// The peer's best height and hash.
    GetStatus,
}

impl TallyRequest {
    /// Reject requests a well-behaved peer would never send.
    pub fn validate(&self) -> Result<(), NetworkError> {
        match self {
            TallyRequest::GetHeaders(locator) if locator.len() > MAX_LOCATOR_SIZE => {
                Err(NetworkError::MessageTooLarge {
                    size: locator.len(),
                })
            }
            TallyRequest::GetData(items) => {
                let blocks = items.iter().filter(|i| i.kind == InvKind::Block).count();
                if items.len() > MAX_GETDATA_ITEMS || blocks > MAX_GETDATA_BLOCKS {
                    return Err(NetworkError::MessageTooLarge { size: items.len() });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Point-to-point responses.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum TallyResponse {
    Headers(Vec<BlockHeader>),
    Data {
        blocks: Vec<Block>,
        transactions: Vec<Transaction>,
    },
    Status { best_height: u64, best_hash: Hash256 },
}

impl TallyResponse {
    pub fn validate(&self) -> Result<(), NetworkError> {
        match self {
            TallyResponse::Headers(headers) if headers.len() > MAX_HEADERS_PER_RESPONSE => {
                Err(NetworkError::MessageTooLarge {
                    size: headers.len(),
                })
            }
            _ => Ok(()),
        }
    }
}

fn invalid(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

async fn read_framed<T, M>(io: &mut T, max: usize) -> std::io::Result<M>
where
    T: libp2p::futures::AsyncRead + Unpin + Send,
    M: bincode::Decode<()>,
{
    use libp2p::futures::AsyncReadExt;
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(invalid(format!("frame too large: {len} > {max}")));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    let (msg, _): (M, usize) = bincode::decode_from_slice(&buf, bincode::config::standard())
        .map_err(|e| invalid(e.to_string()))?;
    Ok(msg)
}

async fn write_framed<T, M>(io: &mut T, msg: &M, max: usize) -> std::io::Result<()>
where
    T: libp2p::futures::AsyncWrite + Unpin + Send,
    M: bincode::Encode,
{
    use libp2p::futures::AsyncWriteExt;
    let buf = bincode::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| invalid(e.to_string()))?;
    if buf.len() > max {
        return Err(invalid(format!("frame too large: {} > {max}", buf.len())));
    }
    io.write_all(&(buf.len() as u32).to_be_bytes()).await?;
    io.write_all(&buf).await?;
    Ok(())
}

/// Codec for the Tally request-response protocol.
#[derive(Debug, Clone, Default)]
pub struct TallyCodec;

#[async_trait::async_trait]
impl libp2p::request_response::Codec for TallyCodec {
    type Protocol = libp2p::StreamProtocol;
    type Request = TallyRequest;
    type Response = TallyResponse;

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<Self::Request>
    where
        T: libp2p::futures::AsyncRead + Unpin + Send,
    {
        let request: TallyRequest = read_framed(io, MAX_REQUEST_SIZE).await?;
        request.validate().map_err(|e| invalid(e.to_string()))?;
        Ok(request)
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<Self::Response>
    where
        T: libp2p::futures::AsyncRead + Unpin + Send,
    {
        let response: TallyResponse = read_framed(io, MAX_RESPONSE_SIZE).await?;
        response.validate().map_err(|e| invalid(e.to_string()))?;
        Ok(response)
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> std::io::Result<()>
    where
        T: libp2p::futures::AsyncWrite + Unpin + Send,
    {
        write_framed(io, &req, MAX_REQUEST_SIZE).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        resp: Self::Response,
    ) -> std::io::Result<()>
    where
        T: libp2p::futures::AsyncWrite + Unpin + Send,
    {
        write_framed(io, &resp, MAX_RESPONSE_SIZE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::request_response::Codec;
    use tally_core::types::{OutPoint, TxInput, TxOutput};

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig: vec![],
                sequence: 0,
            }],
            outputs: vec![TxOutput {
                value: 50,
                script: vec![0xAC],
                address: Some("addr".into()),
            }],
            lock_time: 0,
        }
    }

    fn sample_block() -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                time: 1_700_000_000,
                bits: 0,
                nonce: 42,
            },
            transactions: vec![sample_tx()],
        }
    }

    #[test]
    fn gossip_block_decodes() {
        let msg = GossipMessage::Block(sample_block());
        let encoded = msg.encode().unwrap();
        assert_eq!(&encoded[..4], &MAGIC_BYTES);
        match GossipMessage::decode(&encoded) {
            Some(GossipMessage::Block(b)) => assert_eq!(b, sample_block()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut encoded = GossipMessage::Tx(sample_tx()).encode().unwrap();
        encoded[0] = 0x00;
        assert!(GossipMessage::decode(&encoded).is_none());
        assert!(GossipMessage::decode(&[]).is_none());
    }

    #[test]
    fn topic_routing() {
        assert_eq!(GossipMessage::Inv(vec![]).topic(), INV_TOPIC);
        assert_eq!(GossipMessage::Block(sample_block()).topic(), BLOCKS_TOPIC);
        assert_eq!(GossipMessage::Tx(sample_tx()).topic(), TXS_TOPIC);
    }

    #[test]
    fn oversized_locator_rejected() {
        let req = TallyRequest::GetHeaders(vec![Hash256::ZERO; MAX_LOCATOR_SIZE + 1]);
        assert!(req.validate().is_err());
        assert!(TallyRequest::GetHeaders(vec![Hash256::ZERO; 30]).validate().is_ok());
    }

    #[test]
    fn getdata_block_limit() {
        let items = vec![InvItem::block(Hash256::ZERO); MAX_GETDATA_BLOCKS + 1];
        assert!(TallyRequest::GetData(items).validate().is_err());
        let txs = vec![InvItem::tx(Hash256::ZERO); 100];
        assert!(TallyRequest::GetData(txs).validate().is_ok());
    }

    #[tokio::test]
    async fn codec_request_roundtrip_over_buffer() {
        let mut codec = TallyCodec;
        let protocol = libp2p::StreamProtocol::new(REQ_RESP_PROTOCOL);
        let req = TallyRequest::GetData(vec![InvItem::block(Hash256([3; 32]))]);

        let mut buf = libp2p::futures::io::Cursor::new(Vec::new());
        codec.write_request(&protocol, &mut buf, req.clone()).await.unwrap();
        buf.set_position(0);
        let decoded = codec.read_request(&protocol, &mut buf).await.unwrap();
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn codec_rejects_oversized_length_prefix() {
        let mut codec = TallyCodec;
        let protocol = libp2p::StreamProtocol::new(REQ_RESP_PROTOCOL);
        let len = (MAX_REQUEST_SIZE as u32 + 1).to_be_bytes();
        let mut buf = libp2p::futures::io::Cursor::new(len.to_vec());
        assert!(codec.read_request(&protocol, &mut buf).await.is_err());
    }
}
