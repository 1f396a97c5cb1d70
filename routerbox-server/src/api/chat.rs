// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::api::error::set_retry_after;
use crate::api::ApiError;
use crate::context::AppContext;
use crate::router::{Admission, CallerContext, ChatReply};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{HeaderMap, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::Stream;
use routerbox_core::{ChatCompletionRequest, ErrorBody, StreamItem};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

pub const USER_HEADER: &str = "x-user-id";
pub const QUEUED_HEADER: &str = "x-ratelimit-queued";
pub const WAITED_HEADER: &str = "x-ratelimit-waited-ms";

const DONE: &str = "[DONE]";

/// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the socket peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());
    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
        .or_else(|| peer.map(|addr| addr.ip()))
}

fn caller_from(headers: &HeaderMap, peer: Option<SocketAddr>, request: &ChatCompletionRequest) -> CallerContext {
    let user = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(request.user.as_deref());
    CallerContext::new(user, client_ip(headers, peer))
}

fn item_data(item: &StreamItem) -> String {
    serde_json::to_string(item).unwrap_or_else(|e| {
        let body = ErrorBody::new(format!("failed to encode stream item: {}", e), "server_error", None);
        serde_json::to_string(&body).unwrap_or_default()
    })
}

/// Every item as one `data:` event, then exactly one `[DONE]`
fn event_stream(rx: mpsc::Receiver<StreamItem>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = ReceiverStream::new(rx)
        .map(|item| Ok::<_, Infallible>(Event::default().data(item_data(&item))))
        .chain(tokio_stream::once(Ok(Event::default().data(DONE))));
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// A request that fails before streaming starts still answers as a stream:
/// one error event, then `[DONE]`, under the error's status
fn stream_error(err: ApiError) -> Response {
    let (status, body, retry_after_secs) = err.into_parts();
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(StreamItem::Error(body));
    drop(tx);
    let mut response = (status, event_stream(rx)).into_response();
    set_retry_after(response.headers_mut(), retry_after_secs);
    response
}

fn admission_headers(headers: &mut HeaderMap, admission: Admission) {
    if admission.queued {
        headers.insert(QUEUED_HEADER, HeaderValue::from_static("true"));
        headers.insert(WAITED_HEADER, HeaderValue::from(admission.waited.as_millis() as u64));
    }
}

/// POST /chat/completions - OpenAI-compatible chat completion
pub async fn chat_completions(
    State(ctx): State<AppContext>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let caller = caller_from(&headers, peer.map(|ConnectInfo(addr)| addr), &request);

    let routed = if request.stream {
        match ctx.router.handle(request, &caller).await {
            Ok(routed) => routed,
            Err(e) => return Ok(stream_error(e.into())),
        }
    } else {
        tokio::time::timeout(ctx.request_timeout, ctx.router.handle(request, &caller))
            .await
            .map_err(|_| ApiError::Timeout(ctx.request_timeout.as_secs()))??
    };

    let mut response = match routed.reply {
        ChatReply::Complete(completion) => Json(completion).into_response(),
        ChatReply::Stream(rx) => event_stream(rx).into_response(),
    };
    admission_headers(response.headers_mut(), routed.admission);
    Ok(response)
}
