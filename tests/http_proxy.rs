//! HTTP/1.1 proxying through the dispatcher.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode};
use relay_proxy::http::{error_handler_fn, handler_fn, HeaderDirectives, PassThrough, RequestHead};
use relay_proxy::routing::{AnyMatcher, PathPrefixMatcher};
use relay_proxy::{
    BoxError, Configuration, Context, Hooks, ProxyError, ProxyInterceptor, ProxyOverride, Upstream,
};
use serde_json::Value;

use common::{eventually, start_echo_upstream, start_proxy};

async fn echo_json(response: reqwest::Response) -> Value {
    response.json::<Value>().await.unwrap()
}

#[tokio::test]
async fn round_trip_preserves_status_and_body() {
    let upstream = start_echo_upstream().await;
    let config = Configuration::new()
        .with_upstream(Upstream::new("echo", &upstream.url()).unwrap().route(AnyMatcher, PassThrough));
    let (dispatcher, addr) = start_proxy(config).await;

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/raw"))
        .body(payload.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-upstream"], "echo");
    assert_eq!(response.bytes().await.unwrap().as_ref(), payload.as_slice());

    dispatcher.stop(true).await.unwrap();
}

#[tokio::test]
async fn header_layers_apply_in_precedence_order() {
    let upstream = start_echo_upstream().await;
    let handler = handler_fn(|req, proxy, _method, _path, _ctx| async move {
        let ov = ProxyOverride::new()
            .request_headers(HeaderDirectives::new().remove("ReqProxyLevelClear").unwrap());
        proxy.send(req, Some(ov)).await
    });
    let config = Configuration {
        proxy_request_headers: Some(
            HeaderDirectives::new()
                .set("ReqConfigLevel", "CONFIG-REQUEST")
                .and_then(|d| d.set("ReqConfigLevelOverwrite", "CONFIG-REQUEST"))
                .and_then(|d| d.set("ReqProxyLevelClear", "CONFIG-REQUEST"))
                .unwrap(),
        ),
        ..Configuration::default()
    }
    .with_upstream(
        Upstream::new("echo", &upstream.url())
            .unwrap()
            .with_request_headers(
                HeaderDirectives::new()
                    .set("REQConfigLevelOverwrite", "PROXY-REQUEST-OVERWRITE")
                    .unwrap(),
            )
            .route(PathPrefixMatcher::new("/echo"), handler),
    );
    let (dispatcher, addr) = start_proxy(config).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/echo"))
        .header("ReqProxyLevelClear", "from-client")
        .header("X-Client", "kept")
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let echo = echo_json(response).await;
    let headers = &echo["headers"];
    assert_eq!(headers["reqconfiglevel"], "CONFIG-REQUEST");
    assert_eq!(headers["reqconfigleveloverwrite"], "PROXY-REQUEST-OVERWRITE");
    assert!(headers.get("reqproxylevelclear").is_none());
    assert_eq!(headers["x-client"], "kept");
    assert_eq!(echo["body"], "hello");

    dispatcher.stop(true).await.unwrap();
}

#[tokio::test]
async fn missing_route_without_error_handler_yields_json_fallback() {
    let (dispatcher, addr) = start_proxy(Configuration::new()).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/missing"))
        .header("accept", "application/json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(
        echo_json(response).await,
        serde_json::json!({ "error": "Unexpected error occurred" })
    );

    let response = reqwest::get(format!("http://{addr}/missing")).await.unwrap();
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.text().await.unwrap(), "Unexpected error occurred");

    dispatcher.stop(true).await.unwrap();
}

#[tokio::test]
async fn global_error_handler_receives_missing_route() {
    let handler = error_handler_fn(|_req: RequestHead, err: ProxyError, _ctx| async move {
        let mut response = Response::new(Body::from(err.to_string()));
        *response.status_mut() = StatusCode::NOT_FOUND;
        Ok(response)
    });
    let (dispatcher, addr) = start_proxy(Configuration::new().with_error_handler(Arc::new(handler))).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.text().await.unwrap(),
        "Missing RequestHandler configuration for the \"POST:/missing\" request"
    );

    dispatcher.stop(true).await.unwrap();
}

#[tokio::test]
async fn upstream_error_handler_wins_over_global() {
    let dead_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let upstream_handler = error_handler_fn(|_req, err: ProxyError, _ctx| async move {
        let mut response = Response::new(Body::from("upstream handler"));
        *response.status_mut() = err.status_code();
        Ok(response)
    });
    let global_handler = error_handler_fn(|_req, _err, _ctx| async move {
        Ok(Response::new(Body::from("global handler")))
    });
    let config = Configuration::new()
        .with_error_handler(Arc::new(global_handler))
        .with_upstream(
            Upstream::new("dead", &format!("http://127.0.0.1:{dead_port}"))
                .unwrap()
                .with_error_handler(Arc::new(upstream_handler))
                .route(AnyMatcher, PassThrough),
        );
    let (dispatcher, addr) = start_proxy(config).await;

    let response = reqwest::get(format!("http://{addr}/anything")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.text().await.unwrap(), "upstream handler");

    dispatcher.stop(true).await.unwrap();
}

#[tokio::test]
async fn failing_error_handler_falls_back() {
    let handler = error_handler_fn(|_req, _err, _ctx| async move {
        Err(ProxyError::handler("error handler broke"))
    });
    let (dispatcher, addr) = start_proxy(Configuration::new().with_error_handler(Arc::new(handler))).await;

    let response = reqwest::get(format!("http://{addr}/missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.text().await.unwrap(), "Unexpected error occurred");

    dispatcher.stop(true).await.unwrap();
}

#[tokio::test]
async fn panicking_handler_is_recovered() {
    let handler = handler_fn(|_req, _proxy, _method, _path, _ctx| async move {
        if true {
            panic!("handler exploded");
        }
        Ok(Response::new(Body::empty()))
    });
    let config = Configuration::new()
        .with_upstream(Upstream::new("none", "http://127.0.0.1:1").unwrap().route(AnyMatcher, handler));
    let (dispatcher, addr) = start_proxy(config).await;

    let response = reqwest::get(format!("http://{addr}/boom")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    dispatcher.stop(true).await.unwrap();
}

struct Rewriter;

#[async_trait]
impl ProxyInterceptor for Rewriter {
    fn on_before_proxy_request(
        &self,
        options: &mut relay_proxy::ProxyRequestOptions,
        headers: &mut HeaderMap,
        ctx: &Context,
    ) -> Result<(), BoxError> {
        options.path = format!("{}?intercepted=1", options.path);
        headers.insert("x-intercepted", HeaderValue::from_static("yes"));
        ctx.insert("intercepted", true);
        Ok(())
    }

    async fn on_before_response(
        &self,
        status: &mut StatusCode,
        headers: &mut HeaderMap,
        ctx: &Context,
    ) -> Result<(), BoxError> {
        if ctx.get_as::<bool>("intercepted") == Some(true) {
            *status = StatusCode::ACCEPTED;
            headers.insert("x-rewritten", HeaderValue::from_static("yes"));
        }
        Ok(())
    }
}

struct FailingResponse;

#[async_trait]
impl ProxyInterceptor for FailingResponse {
    async fn on_before_response(
        &self,
        _status: &mut StatusCode,
        _headers: &mut HeaderMap,
        _ctx: &Context,
    ) -> Result<(), BoxError> {
        Err("refusing this response".into())
    }
}

#[tokio::test]
async fn interceptor_rewrites_request_and_response() {
    let upstream = start_echo_upstream().await;
    let handler = handler_fn(|req, proxy, _method, path: String, _ctx| async move {
        let interceptor: Arc<dyn ProxyInterceptor> = if path == "/fail" {
            Arc::new(FailingResponse)
        } else {
            Arc::new(Rewriter)
        };
        proxy
            .send(req, Some(ProxyOverride::new().interceptor(interceptor)))
            .await
    });
    let config = Configuration::new()
        .with_upstream(Upstream::new("echo", &upstream.url()).unwrap().route(AnyMatcher, handler));
    let (dispatcher, addr) = start_proxy(config).await;

    let response = reqwest::get(format!("http://{addr}/intercept")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["x-rewritten"], "yes");
    let echo = echo_json(response).await;
    assert_eq!(echo["path"], "/intercept?intercepted=1");
    assert_eq!(echo["headers"]["x-intercepted"], "yes");

    let response = reqwest::get(format!("http://{addr}/fail")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    dispatcher.stop(true).await.unwrap();
}

#[tokio::test]
async fn override_and_base_path_shape_the_outbound_request() {
    let upstream = start_echo_upstream().await;
    let handler = handler_fn(|req, proxy, _method, path: String, _ctx| async move {
        let ov = if path == "/moved" {
            ProxyOverride::new()
                .url("/elsewhere?x=1")
                .method(axum::http::Method::PUT)
        } else {
            ProxyOverride::new()
        };
        proxy.send(req, Some(ov)).await
    });
    let config = Configuration::new().with_upstream(
        Upstream::new("echo", &format!("{}/base", upstream.url()))
            .unwrap()
            .route(AnyMatcher, handler),
    );
    let (dispatcher, addr) = start_proxy(config).await;

    let echo = echo_json(reqwest::get(format!("http://{addr}/items?id=7")).await.unwrap()).await;
    assert_eq!(echo["method"], "GET");
    assert_eq!(echo["path"], "/base/items?id=7");

    let echo = echo_json(reqwest::get(format!("http://{addr}/moved")).await.unwrap()).await;
    assert_eq!(echo["method"], "PUT");
    assert_eq!(echo["path"], "/base/elsewhere?x=1");

    dispatcher.stop(true).await.unwrap();
}

#[tokio::test]
async fn seed_headers_fill_handler_responses() {
    let upstream = start_echo_upstream().await;
    let local = handler_fn(|_req, _proxy, _method, _path, _ctx| async move {
        let mut response = Response::new(Body::from("local"));
        response
            .headers_mut()
            .insert("x-served-by", HeaderValue::from_static("handler"));
        Ok(response)
    });
    let config = Configuration {
        response_headers: Some(
            HeaderDirectives::new()
                .set("x-served-by", "proxy")
                .and_then(|d| d.set("x-proxy", "relay"))
                .unwrap(),
        ),
        ..Configuration::default()
    }
    .with_upstream(
        Upstream::new("echo", &upstream.url())
            .unwrap()
            .with_response_headers(HeaderDirectives::new().remove("x-upstream").unwrap())
            .route(PathPrefixMatcher::new("/local"), local)
            .route(AnyMatcher, PassThrough),
    );
    let (dispatcher, addr) = start_proxy(config).await;

    let response = reqwest::get(format!("http://{addr}/local")).await.unwrap();
    assert_eq!(response.headers()["x-served-by"], "handler");
    assert_eq!(response.headers()["x-proxy"], "relay");

    let response = reqwest::get(format!("http://{addr}/relayed")).await.unwrap();
    assert_eq!(response.headers()["x-served-by"], "proxy");
    assert_eq!(response.headers()["x-proxy"], "relay");
    assert!(response.headers().get("x-upstream").is_none());

    dispatcher.stop(true).await.unwrap();
}

#[derive(Default)]
struct CountingHooks {
    before: AtomicUsize,
    after: AtomicUsize,
}

impl Hooks for CountingHooks {
    fn before_http_request(&self, _req: &RequestHead, ctx: &Context) -> Result<(), BoxError> {
        self.before.fetch_add(1, Ordering::SeqCst);
        ctx.insert("tenant", "acme");
        Err("before hook failed".into())
    }

    fn after_http_request(&self, _req: &RequestHead, _ctx: &Context) -> Result<(), BoxError> {
        self.after.fetch_add(1, Ordering::SeqCst);
        panic!("after hook exploded");
    }
}

#[tokio::test]
async fn hooks_bracket_requests_without_changing_outcome() {
    let upstream = start_echo_upstream().await;
    let hooks = Arc::new(CountingHooks::default());
    let handler = handler_fn(|req, proxy, _method, _path, ctx: Context| async move {
        let tenant = ctx.get_as::<String>("tenant").unwrap_or_default();
        let ov = ProxyOverride::new().request_headers(
            HeaderDirectives::new().set("x-tenant", &tenant).unwrap(),
        );
        proxy.send(req, Some(ov)).await
    });
    let config = Configuration::new()
        .with_hooks(hooks.clone())
        .with_upstream(Upstream::new("echo", &upstream.url()).unwrap().route(AnyMatcher, handler));
    let (dispatcher, addr) = start_proxy(config).await;

    let response = reqwest::get(format!("http://{addr}/hooked")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let echo = echo_json(response).await;
    assert_eq!(echo["headers"]["x-tenant"], "acme");

    assert_eq!(hooks.before.load(Ordering::SeqCst), 1);
    assert!(eventually(|| hooks.after.load(Ordering::SeqCst) == 1).await);

    dispatcher.stop(true).await.unwrap();
}

/// Raw upstream that answers with a chunked body and sends one byte every
/// `interval`, forever.
async fn start_drip_upstream(interval: std::time::Duration) -> std::net::SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let start = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n";
                if stream.write_all(start).await.is_err() {
                    return;
                }
                loop {
                    tokio::time::sleep(interval).await;
                    if stream.write_all(b"1\r\n.\r\n").await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn slow_response_bodies_are_cut_off_at_twice_the_timeout() {
    let upstream = start_drip_upstream(std::time::Duration::from_millis(100)).await;
    let config = Configuration {
        proxy_request_timeout: std::time::Duration::from_millis(300),
        ..Configuration::new().with_upstream(
            Upstream::new("drip", &format!("http://{upstream}"))
                .unwrap()
                .route(AnyMatcher, PassThrough),
        )
    };
    let (dispatcher, addr) = start_proxy(config).await;

    let started = std::time::Instant::now();
    let response = reqwest::get(format!("http://{addr}/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(3), response.bytes()).await;
    assert!(matches!(outcome, Ok(Err(_))), "body should fail, not finish or hang");
    assert!(started.elapsed() < std::time::Duration::from_secs(2));

    dispatcher.stop(true).await.unwrap();
}
