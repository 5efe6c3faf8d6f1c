//! TLS-terminating reverse proxy
//!
//! Every request is forwarded to a single plain-HTTP backend. Identity
//! headers are always overwritten from the connection, so a client cannot
//! spoof its address or the scheme it arrived on.
//!
//! Protocol upgrades (WebSocket, h2c) are relayed: once the backend answers
//! `101 Switching Protocols`, both upgraded connections are spliced together.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        header::{self, HeaderMap, HeaderName, HeaderValue},
        Request, Response, StatusCode, Uri, Version,
    },
    response::IntoResponse,
    Router,
};
use hyper::upgrade::OnUpgrade;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioIo},
};
use rustls::ServerConfig;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::{HttpsifyError, Result};
use crate::tls::ACME_TLS_ALPN;

/// HTTP client type for forwarding requests
type HttpClient = Client<HttpConnector, Body>;

/// Value of the `Server` header when `info` is enabled
pub const SERVER_IDENT: &str = concat!("httpsify-rs/", env!("CARGO_PKG_VERSION"));

/// Headers that only apply to a single transport hop
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

static X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
static X_REMOTE_IP: HeaderName = HeaderName::from_static("x-remote-ip");
static X_REMOTE_PORT: HeaderName = HeaderName::from_static("x-remote-port");
static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");

/// Shared proxy state
pub struct ProxyState {
    client: HttpClient,
    backend: Url,
    backend_timeout: Duration,
    /// Port the TLS listener is bound to
    tls_port: u16,
    info: bool,
}

/// Per-request facts taken from the connection and the request line
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_ip: IpAddr,
    pub client_port: u16,
    /// Host the client asked for, without rewriting
    pub host: String,
    pub backend: Uri,
}

impl RequestContext {
    /// Overwrite identity headers; client-supplied values are discarded
    pub fn apply(&self, headers: &mut HeaderMap, tls_port: u16) {
        let ip = HeaderValue::from_str(&self.client_ip.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static(""));

        match HeaderValue::from_str(&self.host) {
            Ok(host) => {
                headers.insert(header::HOST, host.clone());
                headers.insert(X_FORWARDED_HOST.clone(), host);
            }
            Err(_) => {
                headers.remove(header::HOST);
                headers.remove(&X_FORWARDED_HOST);
            }
        }

        headers.insert(X_REAL_IP.clone(), ip.clone());
        headers.insert(X_REMOTE_IP.clone(), ip.clone());
        headers.insert(X_REMOTE_PORT.clone(), HeaderValue::from(self.client_port));
        headers.insert(X_FORWARDED_FOR.clone(), ip);
        headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("https"));
        headers.insert(X_FORWARDED_PORT.clone(), HeaderValue::from(tls_port));
    }
}

/// Backend URI for `uri`: backend path prefix first, queries joined with `&`
pub fn backend_uri(backend: &Url, uri: &Uri) -> Result<Uri> {
    let host = backend
        .host_str()
        .ok_or_else(|| HttpsifyError::Http(format!("Backend {} has no host", backend)))?;
    let authority = match backend.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let prefix = backend.path().trim_end_matches('/');
    let path = format!("{}{}", prefix, uri.path());

    let query = match (backend.query().filter(|q| !q.is_empty()), uri.query().filter(|q| !q.is_empty())) {
        (Some(a), Some(b)) => format!("?{}&{}", a, b),
        (Some(q), None) | (None, Some(q)) => format!("?{}", q),
        (None, None) => String::new(),
    };

    format!("{}://{}{}{}", backend.scheme(), authority, path, query)
        .parse()
        .map_err(|e| HttpsifyError::Http(format!("Invalid forward URI: {}", e)))
}

/// Remove hop-by-hop headers, including any the `Connection` header names
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    for name in &named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Protocol named by `Upgrade`, when `Connection` asks for an upgrade
pub fn requested_upgrade(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

/// Host requested by the client: the `Host` header, or the authority for HTTP/2
fn requested_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Proxy server
pub struct ProxyServer {
    state: Arc<ProxyState>,
    tls_acceptor: TlsAcceptor,
}

impl ProxyServer {
    /// Create a new proxy server around the live TLS configuration
    pub fn new(config: &Config, tls_config: Arc<ServerConfig>) -> Self {
        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();

        let state = Arc::new(ProxyState {
            client,
            backend: config.backend.clone(),
            backend_timeout: config.backend_timeout,
            tls_port: config.port,
            info: config.info,
        });

        Self {
            state,
            tls_acceptor: TlsAcceptor::from(tls_config),
        }
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Accept TLS connections on `listener` until cancelled
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        use hyper::service::service_fn;
        use tower::ServiceExt;

        let router = self.router();
        info!("Proxying https://{} -> {}", listener.local_addr()?, self.state.backend);

        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let acceptor = self.tls_acceptor.clone();
            let router = router.clone();

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("TLS handshake failed from {}: {}", addr, e);
                        return;
                    }
                };

                if tls_stream.get_ref().1.alpn_protocol() == Some(ACME_TLS_ALPN) {
                    debug!("Closing ACME validation connection from {}", addr);
                    return;
                }

                let io = TokioIo::new(tls_stream);
                let service = service_fn(move |mut req: Request<hyper::body::Incoming>| {
                    req.extensions_mut().insert(ConnectInfo(addr));
                    router.clone().oneshot(req)
                });

                if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(io, service)
                    .await
                {
                    debug!("Error serving connection from {}: {}", addr, e);
                }
            });
        }

        info!("Proxy listener stopped");
        Ok(())
    }
}

/// Forward one request to the backend
async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    mut req: Request<Body>,
) -> Response<Body> {
    let context = match backend_uri(&state.backend, req.uri()) {
        Ok(backend) => RequestContext {
            client_ip: client.ip(),
            client_port: client.port(),
            host: requested_host(&req),
            backend,
        },
        Err(e) => {
            error!("{}", e);
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    debug!("Proxying request: {} {} -> {}", req.method(), context.host, context.backend);

    let upgrade = requested_upgrade(req.headers());
    let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();
    parts.uri = context.backend.clone();
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);
    if let Some(protocol) = upgrade {
        parts
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        parts.headers.insert(header::UPGRADE, protocol);
    }
    context.apply(&mut parts.headers, state.tls_port);

    let forward_req = Request::from_parts(parts, body);

    let result = match tokio::time::timeout(state.backend_timeout, state.client.request(forward_req)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(HttpsifyError::BackendUnavailable(e.to_string())),
        Err(_) => Err(HttpsifyError::BackendUnavailable(format!(
            "no response within {:?}",
            state.backend_timeout
        ))),
    };

    match result {
        Ok(mut response) => {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                match client_upgrade {
                    Some(client_upgrade) => {
                        let backend_upgrade = hyper::upgrade::on(&mut response);
                        tokio::spawn(splice_upgraded(client_upgrade, backend_upgrade, context.client_ip));
                    }
                    None => warn!("Backend switched protocols without an upgrade request"),
                }
            }

            let (mut parts, body) = response.into_parts();
            if state.info {
                parts
                    .headers
                    .insert(header::SERVER, HeaderValue::from_static(SERVER_IDENT));
            }
            Response::from_parts(parts, Body::new(body))
        }
        Err(e) => {
            warn!("{} ({} from {})", e, context.backend, context.client_ip);
            let mut response = (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response();
            if state.info {
                response
                    .headers_mut()
                    .insert(header::SERVER, HeaderValue::from_static(SERVER_IDENT));
            }
            response
        }
    }
}

/// Relay bytes between the client and backend once both sides have upgraded
async fn splice_upgraded(client: OnUpgrade, backend: OnUpgrade, client_ip: IpAddr) {
    match tokio::try_join!(client, backend) {
        Ok((client, backend)) => {
            let mut client = TokioIo::new(client);
            let mut backend = TokioIo::new(backend);
            match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                Ok((up, down)) => debug!("Upgraded connection from {} closed ({} up, {} down)", client_ip, up, down),
                Err(e) => debug!("Upgraded connection from {} failed: {}", client_ip, e),
            }
        }
        Err(e) => warn!("Protocol upgrade for {} failed: {}", client_ip, e),
    }
}
