//! The receiving half of STREAM: credential derivation and fulfillment.

use crate::crypto::{
    decrypt, encrypt_with_nonce, generate_fulfillment, hash_sha256, hmac_sha256, NONCE_LENGTH,
    SHARED_SECRET_LENGTH,
};
use crate::packet::{
    ConnectionAssetDetailsFrame, Frame, StreamMaxMoneyFrame, StreamPacket, StreamPacketBuilder,
};
use bytes::BytesMut;
use streampay_packet::{
    Address, ErrorCode, Fulfill, FulfillBuilder, PacketType as IlpPacketType, Prepare, Reject,
    RejectBuilder,
};
use tracing::debug;
use uuid::Uuid;

static SHARED_SECRET_GENERATOR_STRING: &[u8] = b"ilp_stream_shared_secret";
static TAG_ENCRYPTION_STRING: &[u8] = b"ilp_stream_tag_encryption";

/// STREAM connection parameters handed to a sender.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamCredentials {
    pub ilp_address: Address,
    pub shared_secret: [u8; SHARED_SECRET_LENGTH],
}

/// Derives per-connection STREAM credentials from a single server secret.
///
/// The destination address's final segment encodes the connection tag (an
/// opaque id chosen by the caller, here always a payment or wallet-address
/// id) encrypted under a key only this server holds, so the account behind
/// any incoming packet can be recovered from the packet alone. The shared
/// secret is an HMAC of the encoded segment, so it rederives from the
/// address without any lookup.
#[derive(Clone)]
pub struct ConnectionGenerator {
    secret_generator: [u8; 32],
    tag_key: [u8; 32],
}

impl ConnectionGenerator {
    pub fn new(server_secret: &[u8]) -> Self {
        assert_eq!(server_secret.len(), 32, "Server secret must be 32 bytes");
        ConnectionGenerator {
            secret_generator: hmac_sha256(server_secret, SHARED_SECRET_GENERATOR_STRING),
            tag_key: hmac_sha256(server_secret, TAG_ENCRYPTION_STRING),
        }
    }

    /// Generates the STREAM credentials binding `tag` to `base_address`.
    ///
    /// Deterministic: the nonce is derived from the tag, so the same tag
    /// always yields the same address and secret.
    pub fn generate_credentials(&self, base_address: &Address, tag: Uuid) -> StreamCredentials {
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&hmac_sha256(&self.tag_key, tag.as_bytes())[..NONCE_LENGTH]);
        let encrypted =
            encrypt_with_nonce(&self.tag_key, BytesMut::from(&tag.as_bytes()[..]), nonce);
        let local_part = base64::encode_config(&encrypted[..], base64::URL_SAFE_NO_PAD);

        // Adding base64url characters to a valid address cannot fail
        let ilp_address = base_address
            .with_suffix(local_part.as_bytes())
            .expect("base64url suffix is always a valid address segment");
        debug!("Generated STREAM address: {}", ilp_address);

        StreamCredentials {
            shared_secret: hmac_sha256(&self.secret_generator, local_part.as_bytes()),
            ilp_address,
        }
    }

    /// Recovers the tag encoded in a destination address, if it is one of
    /// ours.
    pub fn decode_tag(&self, destination: &Address) -> Option<Uuid> {
        let local_part = destination.segments().rev().next()?;
        let encrypted = base64::decode_config(local_part, base64::URL_SAFE_NO_PAD).ok()?;
        let decrypted = decrypt(&self.tag_key, BytesMut::from(&encrypted[..])).ok()?;
        Uuid::from_slice(&decrypted).ok()
    }

    /// Rederives the shared secret from a destination address alone.
    pub fn rederive_secret(&self, destination: &Address) -> Option<[u8; 32]> {
        let local_part = destination.segments().rev().next()?;
        Some(hmac_sha256(&self.secret_generator, local_part.as_bytes()))
    }
}

/// What the receiver tells the sender about the receiving side.
#[derive(Debug, Clone)]
pub struct ReceiveParams<'a> {
    /// Our address, used as `triggered_by` on rejects
    pub ilp_address: &'a Address,
    pub asset_code: &'a str,
    pub asset_scale: u8,
    /// Total credited to this connection so far, excluding this packet
    pub total_received: u64,
    /// The most this connection is willing to receive in total
    pub receive_max: u64,
}

/// Fulfills a single incoming STREAM money packet.
///
/// The caller is responsible for crediting `prepare.amount()` when (and only
/// when) the returned fulfill is actually committed.
pub fn receive_money(
    shared_secret: &[u8; 32],
    params: &ReceiveParams<'_>,
    prepare: &Prepare,
) -> Result<Fulfill, Reject> {
    let stream_packet =
        StreamPacket::from_encrypted(shared_secret, BytesMut::from(prepare.data())).map_err(
            |_| {
                debug!("Unable to decrypt STREAM data, rejecting Prepare packet");
                RejectBuilder {
                    code: ErrorCode::F06_UNEXPECTED_PAYMENT,
                    message: b"Could not decrypt data",
                    triggered_by: Some(params.ilp_address),
                    data: &[],
                }
                .build()
            },
        )?;

    let fulfillment = generate_fulfillment(&shared_secret[..], prepare.data());
    if hash_sha256(&fulfillment) != prepare.execution_condition() {
        return Err(RejectBuilder {
            code: ErrorCode::F05_WRONG_CONDITION,
            message: b"Condition generated does not match prepare",
            triggered_by: Some(params.ilp_address),
            data: &[],
        }
        .build());
    }

    // The sender tells us the least it will accept for this packet
    if prepare.amount() < stream_packet.prepare_amount() {
        return Err(RejectBuilder {
            code: ErrorCode::F99_APPLICATION_ERROR,
            message: b"Packet amount below sender minimum",
            triggered_by: Some(params.ilp_address),
            data: &[],
        }
        .build());
    }

    let mut response_frames: Vec<Frame> = Vec::new();
    for frame in stream_packet.frames() {
        match frame {
            Frame::StreamMoney(frame) => {
                response_frames.push(Frame::StreamMaxMoney(StreamMaxMoneyFrame {
                    stream_id: frame.stream_id,
                    receive_max: params.receive_max,
                    total_received: params.total_received,
                }));
            }
            Frame::ConnectionNewAddress(_) => {
                response_frames.push(Frame::ConnectionAssetDetails(ConnectionAssetDetailsFrame {
                    source_asset_code: params.asset_code.to_string(),
                    source_asset_scale: params.asset_scale,
                }));
            }
            _ => {}
        }
    }

    let response = StreamPacketBuilder {
        sequence: stream_packet.sequence(),
        ilp_packet_type: IlpPacketType::Fulfill,
        prepare_amount: prepare.amount(),
        frames: &response_frames,
    }
    .build();

    Ok(FulfillBuilder {
        fulfillment: &fulfillment,
        data: &response.into_encrypted(&shared_secret[..])[..],
    }
    .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_condition;
    use crate::packet::StreamMoneyFrame;
    use std::str::FromStr;
    use std::time::{Duration, SystemTime};
    use streampay_packet::PrepareBuilder;

    fn generator() -> ConnectionGenerator {
        ConnectionGenerator::new(&[7u8; 32])
    }

    fn base() -> Address {
        Address::from_str("test.node").unwrap()
    }

    #[test]
    fn credentials_are_deterministic_and_reversible() {
        let tag = Uuid::new_v4();
        let first = generator().generate_credentials(&base(), tag);
        let second = generator().generate_credentials(&base(), tag);
        assert_eq!(first, second);
        assert_eq!(generator().decode_tag(&first.ilp_address), Some(tag));
        assert_eq!(
            generator().rederive_secret(&first.ilp_address),
            Some(first.shared_secret)
        );
    }

    #[test]
    fn foreign_addresses_do_not_decode() {
        let other = ConnectionGenerator::new(&[8u8; 32]);
        let creds = generator().generate_credentials(&base(), Uuid::new_v4());
        assert_eq!(other.decode_tag(&creds.ilp_address), None);
        assert_eq!(
            generator().decode_tag(&Address::from_str("test.node.not-a-tag").unwrap()),
            None
        );
    }

    fn money_prepare(creds: &StreamCredentials, amount: u64) -> Prepare {
        let packet = StreamPacketBuilder {
            sequence: 1,
            ilp_packet_type: IlpPacketType::Prepare,
            prepare_amount: 0,
            frames: &[Frame::StreamMoney(StreamMoneyFrame {
                stream_id: 1,
                shares: 1,
            })],
        }
        .build();
        let data = packet.into_encrypted(&creds.shared_secret);
        let condition = generate_condition(&creds.shared_secret, &data);
        PrepareBuilder {
            amount,
            expires_at: SystemTime::now() + Duration::from_secs(30),
            execution_condition: &condition,
            destination: creds.ilp_address.clone(),
            data: &data,
        }
        .build()
    }

    #[test]
    fn fulfills_money_packets() {
        let creds = generator().generate_credentials(&base(), Uuid::new_v4());
        let prepare = money_prepare(&creds, 100);
        let params = ReceiveParams {
            ilp_address: &base(),
            asset_code: "XRP",
            asset_scale: 9,
            total_received: 0,
            receive_max: u64::max_value(),
        };
        let fulfill = receive_money(&creds.shared_secret, &params, &prepare).unwrap();
        assert_eq!(
            hash_sha256(fulfill.fulfillment()),
            prepare.execution_condition()
        );
        let response =
            StreamPacket::from_encrypted(&creds.shared_secret, BytesMut::from(fulfill.data()))
                .unwrap();
        assert_eq!(response.prepare_amount(), 100);
        assert!(matches!(response.frames()[0], Frame::StreamMaxMoney(_)));
    }

    #[test]
    fn rejects_garbage_with_unexpected_payment() {
        let creds = generator().generate_credentials(&base(), Uuid::new_v4());
        let prepare = PrepareBuilder {
            amount: 10,
            expires_at: SystemTime::now() + Duration::from_secs(30),
            execution_condition: &[0u8; 32],
            destination: creds.ilp_address.clone(),
            data: b"not a stream packet",
        }
        .build();
        let params = ReceiveParams {
            ilp_address: &base(),
            asset_code: "XRP",
            asset_scale: 9,
            total_received: 0,
            receive_max: u64::max_value(),
        };
        let reject = receive_money(&creds.shared_secret, &params, &prepare).unwrap_err();
        assert_eq!(reject.code(), ErrorCode::F06_UNEXPECTED_PAYMENT);
    }

    #[test]
    fn rejects_wrong_condition() {
        let creds = generator().generate_credentials(&base(), Uuid::new_v4());
        let mut prepare = money_prepare(&creds, 100);
        // valid STREAM data under a different condition
        prepare = PrepareBuilder {
            amount: prepare.amount(),
            expires_at: prepare.expires_at(),
            execution_condition: &[3u8; 32],
            destination: prepare.destination(),
            data: prepare.data(),
        }
        .build();
        let params = ReceiveParams {
            ilp_address: &base(),
            asset_code: "XRP",
            asset_scale: 9,
            total_received: 0,
            receive_max: u64::max_value(),
        };
        let reject = receive_money(&creds.shared_secret, &params, &prepare).unwrap_err();
        assert_eq!(reject.code(), ErrorCode::F05_WRONG_CONDITION);
    }
}
