//! Service execution.
//!
//! The middleware turns a request envelope into a reply envelope: it reads
//! the url from the request header, picks the first registered service
//! whose name prefixes the url, runs it, and wraps the outcome in a reply
//! header. Error replies always carry an empty body.

use crate::metrics::Metrics;
use bytes::Bytes;
use fabricrpc_protocol::{
    Envelope, HeaderCodec, Message, ProtoHeaderCodec, ReplyHeader, Status, StatusCode,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// An async service mounted under a url prefix.
pub trait Service: Send + Sync {
    /// Name matched against the url, e.g. `pkg.Echo` for `/pkg.Echo/Say`.
    fn name(&self) -> &str;

    /// Runs the method at `url` on a raw request body.
    fn execute<'a>(&'a self, url: &'a str, body: Bytes) -> BoxFuture<'a, Result<Bytes, Status>>;

    /// Metrics label for `url`, or `None` if the service has no such
    /// method. Labels must come from a fixed set owned by the service.
    fn method_label(&self, _url: &str) -> Option<&str> {
        Some(self.name())
    }
}

const LABEL_INVALID: &str = "invalid";
const LABEL_UNMATCHED: &str = "unmatched";

/// Decodes `body`, runs `handler` and encodes its reply.
pub async fn handle_typed<Req, Resp, F, Fut>(body: &[u8], handler: F) -> Result<Bytes, Status>
where
    Req: Message,
    Resp: Message,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = Result<Resp, Status>>,
{
    let request = Req::decode(body).map_err(|e| {
        tracing::debug!("Cannot parse request body: {}", e);
        Status::invalid_argument("cannot parse body")
    })?;
    let reply = handler(request).await?;
    let encoded = reply.encode().map_err(|e| {
        tracing::warn!("Cannot serialize reply body: {}", e);
        Status::internal("cannot serialize body")
    })?;
    Ok(Bytes::from(encoded))
}

type MethodFn = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, Status>> + Send + Sync>;

/// A [`Service`] built from typed async handlers, one per method.
pub struct MethodService {
    name: String,
    methods: HashMap<String, MethodFn>,
}

impl MethodService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Adds `method`, reachable at `/{name}/{method}`.
    pub fn with_method<Req, Resp, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let call: MethodFn = Arc::new(move |body: Bytes| {
            let handler = handler.clone();
            async move { handle_typed(&body, |request: Req| handler(request)).await }.boxed()
        });
        self.methods.insert(format!("/{}/{}", self.name, method), call);
        self
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

impl Service for MethodService {
    fn name(&self) -> &str {
        &self.name
    }

    fn method_label(&self, url: &str) -> Option<&str> {
        self.methods.get_key_value(url).map(|(key, _)| key.as_str())
    }

    fn execute<'a>(&'a self, url: &'a str, body: Bytes) -> BoxFuture<'a, Result<Bytes, Status>> {
        match self.methods.get(url) {
            Some(call) => call(body),
            None => async move { Err(Status::unimplemented("url not found")) }.boxed(),
        }
    }
}

/// Routes request envelopes to services.
pub struct ServiceMiddleware {
    services: Vec<Arc<dyn Service>>,
    codec: Arc<dyn HeaderCodec>,
    metrics: Option<Arc<Metrics>>,
}

impl ServiceMiddleware {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            codec: Arc::new(ProtoHeaderCodec),
            metrics: None,
        }
    }

    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    pub fn add_service(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    pub fn with_codec(mut self, codec: Arc<dyn HeaderCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn codec(&self) -> &Arc<dyn HeaderCodec> {
        &self.codec
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Runs one request and builds its reply.
    pub async fn execute(&self, request: &Envelope) -> Envelope {
        let started = Instant::now();
        let (url, label, outcome) = match self.decode_url(request.header()) {
            Ok(url) => match self.route(&url) {
                Some(service) => {
                    let label = service.method_label(&url).unwrap_or(LABEL_UNMATCHED);
                    let outcome = service.execute(&url, request.body().clone()).await;
                    (url, label, outcome)
                }
                None => (url, LABEL_UNMATCHED, Err(Status::unimplemented("url not found"))),
            },
            Err(status) => (String::new(), LABEL_INVALID, Err(status)),
        };

        if let Some(ref metrics) = self.metrics {
            metrics.requests_total.with_label_values(&[label]).inc();
            metrics
                .request_duration
                .with_label_values(&[label])
                .observe(started.elapsed().as_secs_f64());
            if let Err(ref status) = outcome {
                metrics
                    .errors_total
                    .with_label_values(&[status_label(status.code())])
                    .inc();
            }
        }

        match outcome {
            Ok(body) => self.reply(&Status::ok(), body),
            Err(status) => {
                tracing::debug!("{}: {}", url, status);
                self.reply(&status, Bytes::new())
            }
        }
    }

    fn decode_url(&self, header: &[u8]) -> Result<String, Status> {
        let header = self.codec.deserialize_request_header(header).map_err(|e| {
            tracing::debug!("Cannot parse request header: {}", e);
            Status::invalid_argument("cannot parse fabric rpc header")
        })?;
        if header.url.is_empty() {
            return Err(Status::invalid_argument("url is empty"));
        }
        if !header.url.starts_with('/') {
            return Err(Status::invalid_argument("invalid url"));
        }
        Ok(header.url)
    }

    fn route(&self, url: &str) -> Option<&Arc<dyn Service>> {
        let path = &url[1..];
        self.services
            .iter()
            .find(|service| path.starts_with(service.name()))
    }

    /// Builds a reply envelope carrying `status`.
    pub fn reply(&self, status: &Status, body: Bytes) -> Envelope {
        match self
            .codec
            .serialize_reply_header(&ReplyHeader::from_status(status))
        {
            Ok(header) => Envelope::new(header, body),
            Err(e) => {
                tracing::error!("Cannot serialize reply header: {}", e);
                let fallback = Status::internal("cannot serialize reply header");
                let header = self
                    .codec
                    .serialize_reply_header(&ReplyHeader::from_status(&fallback))
                    .unwrap_or_default();
                Envelope::new(header, Bytes::new())
            }
        }
    }
}

impl Default for ServiceMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

fn status_label(code: StatusCode) -> &'static str {
    match code {
        StatusCode::Ok => "ok",
        StatusCode::Unknown => "unknown",
        StatusCode::InvalidArgument => "invalid_argument",
        StatusCode::DeadlineExceeded => "deadline_exceeded",
        StatusCode::NotFound => "not_found",
        StatusCode::Unimplemented => "unimplemented",
        StatusCode::Internal => "internal",
        StatusCode::TransportError => "transport_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabricrpc_protocol::{Json, RequestHeader};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct SayRequest {
        name: String,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct SayReply {
        message: String,
    }

    fn echo() -> Arc<dyn Service> {
        Arc::new(
            MethodService::new("pkg.Echo")
                .with_method("Say", |req: Json<SayRequest>| async move {
                    Ok::<_, Status>(Json(SayReply {
                        message: format!("hello {}", req.0.name),
                    }))
                })
                .with_method("Fail", |_: Json<SayRequest>| async move {
                    Err::<Json<SayReply>, _>(Status::not_found("no such greeting"))
                }),
        )
    }

    fn request(url: &str, body: &[u8]) -> Envelope {
        let header = ProtoHeaderCodec
            .serialize_request_header(&RequestHeader::new(url))
            .unwrap();
        Envelope::new(header, Bytes::copy_from_slice(body))
    }

    fn status_of(reply: &Envelope) -> Status {
        ProtoHeaderCodec
            .deserialize_reply_header(reply.header())
            .unwrap()
            .to_status()
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_echo() {
        let middleware = ServiceMiddleware::new().with_service(echo());
        let body = serde_json::to_vec(&SayRequest {
            name: "world".into(),
        })
        .unwrap();

        let reply = middleware.execute(&request("/pkg.Echo/Say", &body)).await;
        assert_eq!(status_of(&reply), Status::ok());
        let decoded: SayReply = serde_json::from_slice(reply.body()).unwrap();
        assert_eq!(decoded.message, "hello world");
    }

    #[tokio::test]
    async fn test_handler_error_has_empty_body() {
        let middleware = ServiceMiddleware::new().with_service(echo());
        let reply = middleware
            .execute(&request("/pkg.Echo/Fail", br#"{"name":"x"}"#))
            .await;
        assert_eq!(status_of(&reply), Status::not_found("no such greeting"));
        assert!(reply.body().is_empty());
    }

    #[tokio::test]
    async fn test_bad_urls() {
        let middleware = ServiceMiddleware::new().with_service(echo());

        let reply = middleware.execute(&Envelope::default()).await;
        assert_eq!(status_of(&reply), Status::invalid_argument("url is empty"));

        let reply = middleware.execute(&request("pkg.Echo/Say", b"{}")).await;
        assert_eq!(status_of(&reply), Status::invalid_argument("invalid url"));

        let reply = middleware
            .execute(&Envelope::new(&b"\x0a\x7f"[..], Bytes::new()))
            .await;
        assert_eq!(
            status_of(&reply),
            Status::invalid_argument("cannot parse fabric rpc header")
        );
    }

    #[tokio::test]
    async fn test_unmatched_url_is_unimplemented() {
        let middleware = ServiceMiddleware::new().with_service(echo());
        for url in ["/no/such/method", "/pkg.Echo/Missing"] {
            let reply = middleware.execute(&request(url, b"{}")).await;
            assert_eq!(status_of(&reply), Status::unimplemented("url not found"));
            assert!(reply.body().is_empty());
        }
    }

    #[tokio::test]
    async fn test_bad_body() {
        let middleware = ServiceMiddleware::new().with_service(echo());
        let reply = middleware
            .execute(&request("/pkg.Echo/Say", b"not json"))
            .await;
        assert_eq!(status_of(&reply), Status::invalid_argument("cannot parse body"));
    }

    #[tokio::test]
    async fn test_first_matching_service_wins() {
        let first = MethodService::new("pkg")
            .with_method("Echo/Say", |_: Vec<u8>| async move { Ok::<_, Status>(b"first".to_vec()) });
        let middleware = ServiceMiddleware::new()
            .with_service(Arc::new(first))
            .with_service(echo());
        let reply = middleware.execute(&request("/pkg.Echo/Say", b"{}")).await;
        // `pkg` prefixes the url but has no `/pkg.Echo/Say` method.
        assert_eq!(status_of(&reply), Status::unimplemented("url not found"));

        let reply = middleware.execute(&request("/pkg/Echo/Say", b"")).await;
        assert_eq!(reply.body().as_ref(), b"first");
    }

    #[tokio::test]
    async fn test_metric_labels_stay_bounded() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let middleware = ServiceMiddleware::new()
            .with_service(echo())
            .with_metrics(Some(metrics.clone()));

        for i in 0..200 {
            middleware
                .execute(&request(&format!("/junk{}/x", i), b"{}"))
                .await;
            middleware
                .execute(&request(&format!("/pkg.Echo/Junk{}", i), b"{}"))
                .await;
        }
        middleware.execute(&Envelope::default()).await;
        middleware
            .execute(&request("/pkg.Echo/Say", br#"{"name":"x"}"#))
            .await;

        let text = String::from_utf8(metrics.encode()).unwrap();
        assert!(!text.contains("Junk"));
        assert!(!text.contains("junk"));
        assert_eq!(
            metrics
                .requests_total
                .with_label_values(&[LABEL_UNMATCHED])
                .get(),
            400.0
        );
        assert_eq!(
            metrics.requests_total.with_label_values(&[LABEL_INVALID]).get(),
            1.0
        );
        assert_eq!(
            metrics
                .requests_total
                .with_label_values(&["/pkg.Echo/Say"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_handle_typed_serialize_failure() {
        struct Unencodable;

        impl Message for Unencodable {
            fn decode(_: &[u8]) -> Result<Self, fabricrpc_protocol::CodecError> {
                Ok(Unencodable)
            }

            fn encode(&self) -> Result<Vec<u8>, fabricrpc_protocol::CodecError> {
                Err(fabricrpc_protocol::CodecError::Custom("nope".into()))
            }
        }

        let result = handle_typed(b"", |_: Vec<u8>| async move { Ok::<_, Status>(Unencodable) }).await;
        assert_eq!(result, Err(Status::internal("cannot serialize body")));
    }
}
