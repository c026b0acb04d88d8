//! Access resolution endpoints
//!
//! `GET /access` and `/access/premium` are the request/response side of the
//! resolver; `/access/ws` is the push side, streaming fresh statuses whenever
//! the profile changes so every open tab converges on the same answer.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Json,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use muse_shared::AccessStatus;
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Current access status for the authenticated identity.
///
/// Never errors on store trouble: the resolver degrades to the free fallback,
/// and `source` tells the caller (and our tests) which path produced it.
pub async fn get_access(
    State(state): State<AppState>,
    identity: Identity,
) -> Json<AccessStatus> {
    Json(state.resolver.resolve(identity.user_id).await)
}

/// Premium gate. Non-entitled callers get an explicit 402 explaining what is
/// required, never a silent no-op.
pub async fn get_premium_access(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Json<AccessStatus>> {
    let status = state.resolver.resolve(identity.user_id).await;
    if !status.is_premium {
        return Err(ApiError::PremiumRequired);
    }
    Ok(Json(status))
}

/// WebSocket subprotocol name announced by authenticating clients.
const BEARER_PROTOCOL: &str = "bearer";

/// WebSocket handler - upgrades and streams access status updates.
///
/// Browsers cannot set an Authorization header on the upgrade request, and a
/// `?token=` query parameter would end up in request traces. The JWT rides in
/// the subprotocol list instead (`Sec-WebSocket-Protocol: bearer, <jwt>`),
/// which never appears in a URI.
pub async fn access_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    let token = bearer_protocol_token(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = state
        .jwt
        .verify(&token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    Ok(ws
        .protocols([BEARER_PROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, state, claims.sub)))
}

/// Extract the JWT from a `Sec-WebSocket-Protocol: bearer, <jwt>` header.
fn bearer_protocol_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    let mut protocols = raw.split(',').map(str::trim);
    if protocols.next()? != BEARER_PROTOCOL {
        return None;
    }
    protocols.next().map(str::to_owned)
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Uuid) {
    let mut subscription = match state.resolver.subscribe(user_id).await {
        Ok(sub) => sub,
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "Change feed unavailable");
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    // Initial snapshot so the client renders immediately
    let initial = state.resolver.resolve(user_id).await;
    if send_status(&mut sender, &initial).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            update = subscription.recv() => match update {
                Some(status) => {
                    if send_status(&mut sender, &status).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            message = receiver.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {} // pings and client chatter are ignored
            },
        }
    }

    // Dropping the subscription releases the shared watch once the last
    // tab for this identity disconnects
    tracing::debug!(user_id = %user_id, "Access WebSocket closed");
}

async fn send_status(
    sender: &mut SplitSink<WebSocket, Message>,
    status: &AccessStatus,
) -> Result<(), axum::Error> {
    match serde_json::to_string(status) {
        Ok(payload) => sender.send(Message::Text(payload)).await,
        Err(err) => {
            tracing::error!(error = %err, "Failed to serialize access status");
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_protocol(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn test_token_extracted_from_bearer_protocol() {
        let headers = headers_with_protocol("bearer, eyJhbGciOiJIUzI1NiJ9.payload.sig");
        assert_eq!(
            bearer_protocol_token(&headers).as_deref(),
            Some("eyJhbGciOiJIUzI1NiJ9.payload.sig")
        );
    }

    #[test]
    fn test_missing_header_rejected() {
        assert!(bearer_protocol_token(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_wrong_scheme_rejected() {
        let headers = headers_with_protocol("graphql-ws, some-token");
        assert!(bearer_protocol_token(&headers).is_none());
    }

    #[test]
    fn test_bearer_without_token_rejected() {
        let headers = headers_with_protocol("bearer");
        assert!(bearer_protocol_token(&headers).is_none());
    }
}
