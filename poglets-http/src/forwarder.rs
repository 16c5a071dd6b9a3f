//! Client forwarder: replays tunnelled requests against local upstreams

use crate::head;
use crate::pool::{BoxError, ConnectionPool, PoolConfig, ProxyBody, Upstream};
use crate::wrapping::HeaderPolicy;
use futures::TryStreamExt;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request};
use poglets_common::{Result, TunnelError};
use poglets_core::{ControlSession, IncomingStream, StreamReader, StreamWriter, UpstreamRouter};
use poglets_protocol::RequestHead;
use std::sync::Arc;
use tracing::{debug, warn};

/// Forwards every incoming stream to the upstream its route key resolves to.
#[derive(Debug)]
pub struct HttpForwarder {
    router: UpstreamRouter<Arc<ConnectionPool>>,
    policy: HeaderPolicy,
}

impl HttpForwarder {
    /// Build one connection pool per route. Must be called inside a tokio
    /// runtime.
    pub fn new(routes: &UpstreamRouter<String>, pool: &PoolConfig) -> Result<Self> {
        let router = routes.try_map(|_, url| {
            Ok::<_, TunnelError>(Arc::new(ConnectionPool::new(
                Upstream::parse(url)?,
                pool.clone(),
            )?))
        })?;
        Ok(Self {
            router,
            policy: HeaderPolicy::default(),
        })
    }

    /// Header policy applied when the server asked for transport wrapping.
    #[must_use]
    pub fn with_header_policy(mut self, policy: HeaderPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Serve one stream to completion.
    ///
    /// Unroutable streams are reset with `NoMatchingUpstream` before any
    /// upstream connection is made. When the stream fails (peer reset,
    /// deadline, session loss) the in-flight upstream request is dropped.
    pub async fn handle(self: Arc<Self>, session: ControlSession, incoming: IncomingStream) {
        let IncomingStream { head, stream } = incoming;
        let (mut writer, reader) = stream.split();
        let id = writer.id();

        let pool = match self.router.resolve(&head.route_key) {
            Ok(pool) => pool.clone(),
            Err(e) => {
                warn!("Stream {id}: {e}");
                writer.reset(&e);
                return;
            }
        };
        debug!(
            "Stream {id}: {} {} -> {}",
            head.method,
            head.uri,
            pool.upstream().authority()
        );

        let wrap = session.capabilities().transport_wrapping;
        let cancel = writer.cancellation();
        let result = tokio::select! {
            result = self.forward(&pool, head, reader, &mut writer, wrap) => result,
            () = cancel.cancelled() => {
                debug!("Stream {id} cancelled, upstream request aborted");
                return;
            }
        };

        if let Err(e) = result {
            warn!("Stream {id}: {e}");
            writer.reset(&e);
        }
    }

    async fn forward(
        &self,
        pool: &ConnectionPool,
        head: RequestHead,
        reader: StreamReader,
        writer: &mut StreamWriter,
        wrap: bool,
    ) -> Result<()> {
        let request = build_request(pool.upstream(), head, reader)?;

        let mut sender = pool.acquire().await?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| TunnelError::Connection(format!("upstream request failed: {e}")))?;

        let (mut parts, mut body) = response.into_parts();
        if wrap {
            self.policy.apply(&mut parts.headers);
        }
        writer
            .reply(head::response_head(parts.status.as_u16(), &parts.headers))
            .await?;

        while let Some(frame) = body.frame().await {
            let frame = frame
                .map_err(|e| TunnelError::Connection(format!("upstream body failed: {e}")))?;
            if let Ok(data) = frame.into_data() {
                if !data.is_empty() {
                    writer.write_body(data).await?;
                }
            }
        }
        writer.close_write();
        pool.release(sender).await;
        Ok(())
    }
}

/// Upstream request for a stream. Requests without a declared body get an
/// empty body; otherwise the stream's inbound half is relayed as it arrives.
fn build_request(
    upstream: &Upstream,
    head: RequestHead,
    reader: StreamReader,
) -> Result<Request<ProxyBody>> {
    let method = Method::from_bytes(head.method.as_bytes())
        .map_err(|_| TunnelError::Protocol(format!("invalid method {:?}", head.method)))?;

    let mut headers = head::from_wire(&head.headers);
    let has_body = headers.contains_key(header::CONTENT_LENGTH)
        || headers.contains_key(header::TRANSFER_ENCODING);
    let host = HeaderValue::from_str(&upstream.authority())
        .map_err(|e| TunnelError::Config(format!("invalid upstream authority: {e}")))?;
    headers.insert(header::HOST, host);

    let body = if has_body {
        StreamBody::new(
            reader
                .into_body_stream()
                .map_ok(Frame::data)
                .map_err(|e| Box::new(e) as BoxError),
        )
        .boxed_unsync()
    } else {
        Empty::new().map_err(|never| match never {}).boxed_unsync()
    };

    let mut request = Request::builder()
        .method(method)
        .uri(upstream.request_target(&head.uri))
        .body(body)
        .map_err(|e| TunnelError::Protocol(format!("invalid request target: {e}")))?;
    *request.headers_mut() = headers;
    Ok(request)
}
