use crate::IlpResult;
use async_trait::async_trait;
use secrecy::ExposeSecret;
use streampay_packet::{ErrorCode, Packet, Prepare, RejectBuilder};
use streampay_payments::Peer;
use tracing::{error, warn};

/// Carries a Prepare to an outgoing peer and returns its response.
#[async_trait]
pub trait OutgoingLink: Send + Sync {
    async fn send(&self, peer: &Peer, prepare: Prepare) -> IlpResult;
}

/// ILP-over-HTTP: POST the OER-encoded Prepare with the peer's outgoing
/// bearer token; the response body is the Fulfill or Reject.
pub struct HttpLink {
    client: reqwest::Client,
}

impl HttpLink {
    pub fn new() -> Self {
        HttpLink {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpLink {
    fn default() -> Self {
        Self::new()
    }
}

fn peer_unreachable(message: &str) -> streampay_packet::Reject {
    RejectBuilder {
        code: ErrorCode::T01_PEER_UNREACHABLE,
        message: message.as_bytes(),
        triggered_by: None,
        data: &[],
    }
    .build()
}

#[async_trait]
impl OutgoingLink for HttpLink {
    async fn send(&self, peer: &Peer, prepare: Prepare) -> IlpResult {
        let response = self
            .client
            .post(&peer.http.outgoing_endpoint)
            .bearer_auth(peer.http.outgoing_token.expose_secret())
            .header("Content-Type", "application/octet-stream")
            .body(prepare.to_bytes().to_vec())
            .send()
            .await
            .map_err(|err| {
                warn!("Error sending packet to peer {}: {}", peer.id, err);
                peer_unreachable("peer connection failed")
            })?;

        if !response.status().is_success() {
            warn!(
                "Peer {} returned HTTP {} for ILP request",
                peer.id,
                response.status()
            );
            return Err(peer_unreachable("peer returned an HTTP error"));
        }

        let body = response
            .bytes()
            .await
            .map_err(|_| peer_unreachable("error reading peer response"))?;
        match Packet::from_bytes(&body) {
            Ok(Packet::Fulfill(fulfill)) => Ok(fulfill),
            Ok(Packet::Reject(reject)) => Err(reject),
            Ok(Packet::Prepare(_)) | Err(_) => {
                error!("Peer {} responded with an unparsable packet", peer.id);
                Err(peer_unreachable("invalid response packet"))
            }
        }
    }
}
