//! # http
//!
//! why: members behind http load balancers or proxies cannot speak the packet protocol
//! relations: bodies use codec.rs; routes dispatch to a RaftService
//! what: router() for axum, HttpClient over reqwest
//!
//! every request is `POST /raft/{kind}` with the binary codec as body.

use crate::codec;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::packet::MessageType;
use crate::service::{RaftClient, RaftService};
use async_trait::async_trait;
use axum::body::Bytes as Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use raft_core::{RaftMessage, RaftReply};
use raft_sync::WaitError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const ROUTE_PREFIX: &str = "/raft/";

/// routes for every message type, answering through `service`
pub fn router(service: Arc<dyn RaftService>) -> Router {
    MessageType::ALL
        .into_iter()
        .fold(Router::new(), |router, kind| {
            let path = format!("{ROUTE_PREFIX}{}", kind.path());
            router.route(
                &path,
                post(move |State(service): State<Arc<dyn RaftService>>, body: Body| handle(service, kind, body)),
            )
        })
        .with_state(service)
}

async fn handle(service: Arc<dyn RaftService>, kind: MessageType, body: Body) -> Response {
    let message = match codec::decode_message(kind, body) {
        Ok(message) => message,
        Err(err) => {
            debug!(request = kind.path(), error = %err, "rejected malformed request");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };
    match service.handle(message).await {
        Ok(reply) if codec::reply_type(&reply) == kind => (StatusCode::OK, codec::encode_reply(&reply)).into_response(),
        Ok(_) => (StatusCode::INTERNAL_SERVER_ERROR, "mismatched reply").into_response(),
        Err(err) => {
            warn!(request = kind.path(), error = %err, "service failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Request/response client for a member serving [`router`]
pub struct HttpClient {
    endpoint: SocketAddr,
    base: String,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(endpoint: SocketAddr, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            endpoint,
            base: format!("http://{endpoint}{ROUTE_PREFIX}"),
            client,
        })
    }

    async fn post(&self, kind: MessageType, body: bytes::Bytes) -> Result<RaftReply> {
        let response = self
            .client
            .post(format!("{}{}", self.base, kind.path()))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Wait(WaitError::Timeout)
                } else {
                    err.into()
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }
        codec::decode_reply(kind, response.bytes().await?)
    }
}

#[async_trait]
impl RaftClient for HttpClient {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn exchange(&self, message: RaftMessage, cancellation: Option<CancellationToken>) -> Result<RaftReply> {
        let kind = codec::message_type(&message);
        let request = self.post(kind, codec::encode_message(&message)?);
        match cancellation {
            Some(token) => tokio::select! {
                reply = request => reply,
                _ = token.cancelled() => Err(TransportError::Wait(WaitError::Canceled)),
            },
            None => request.await,
        }
    }
}
