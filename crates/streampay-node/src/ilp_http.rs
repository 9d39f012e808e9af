//! The ILP-over-HTTP transport: peers POST OER-encoded Prepares with their
//! bearer token; the body of the reply is the Fulfill or Reject.

use bytes::Bytes;
use std::sync::Arc;
use streampay_packet::Packet;
use streampay_payments::store::{AssetStore, PeerStore};
use streampay_payments::store::InMemoryStore;
use streampay_pipeline::{Pipeline, SourceAccount};
use tracing::debug;
use warp::http::{Response, StatusCode};
use warp::{Filter, Rejection, Reply};

#[derive(Clone)]
pub struct IlpHttpServer {
    store: InMemoryStore,
    pipeline: Arc<Pipeline<InMemoryStore>>,
}

impl IlpHttpServer {
    pub fn new(store: InMemoryStore, pipeline: Arc<Pipeline<InMemoryStore>>) -> Self {
        IlpHttpServer { store, pipeline }
    }

    /// `POST /ilp` with `Authorization: Bearer <peer incoming token>`.
    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let server = self.clone();
        warp::post()
            .and(warp::path("ilp"))
            .and(warp::path::end())
            .and(warp::header::optional::<String>("authorization"))
            .and(warp::body::bytes())
            .and_then(move |authorization: Option<String>, body: Bytes| {
                let server = server.clone();
                async move { Ok::<_, Rejection>(server.handle(authorization, body).await) }
            })
    }

    async fn handle(&self, authorization: Option<String>, body: Bytes) -> Response<Vec<u8>> {
        let token = match authorization
            .as_deref()
            .and_then(|header| header.strip_prefix("Bearer "))
        {
            Some(token) => token.to_string(),
            None => return status_body(StatusCode::UNAUTHORIZED, "missing bearer token"),
        };
        let peer = match self.store.get_peer_by_incoming_token(&token).await {
            Some(peer) => peer,
            None => return status_body(StatusCode::UNAUTHORIZED, "unknown token"),
        };
        let asset = match self.store.get_asset(peer.asset_id).await {
            Some(asset) => asset,
            None => {
                return status_body(StatusCode::INTERNAL_SERVER_ERROR, "peer asset missing")
            }
        };
        let prepare = match Packet::from_bytes(&body) {
            Ok(Packet::Prepare(prepare)) => prepare,
            _ => return status_body(StatusCode::BAD_REQUEST, "expected an ILP Prepare"),
        };
        debug!(
            "Inbound packet from peer {} for {}",
            peer.id,
            prepare.destination()
        );

        let source = SourceAccount::from_peer(peer, asset.code, asset.scale);
        let packet_bytes = match self.pipeline.handle_request(source, prepare).await {
            Ok(fulfill) => fulfill.to_bytes(),
            Err(reject) => reject.to_bytes(),
        };
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/octet-stream")
            .body(packet_bytes.to_vec())
            .unwrap_or_else(|_| Response::new(Vec::new()))
    }
}

fn status_body(status: StatusCode, message: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .body(message.as_bytes().to_vec())
        .unwrap_or_else(|_| Response::new(Vec::new()))
}
