//! Opening handshake per
//! [RFC 6455 Section 4](https://datatracker.ietf.org/doc/html/rfc6455#section-4).
//!
//! The client sends an HTTP/1.1 GET with `Upgrade: websocket` and a random
//! `Sec-WebSocket-Key`, and the server must answer `101 Switching Protocols`
//! with a `Sec-WebSocket-Accept` derived from that key. Any leftover bytes
//! hyper buffered past the response headers are early frames and are carried
//! into the connection.

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    Request, Response, StatusCode,
    header::{
        CONNECTION, HOST, HeaderMap, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
        SEC_WEBSOCKET_VERSION, UPGRADE,
    },
    upgrade,
};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};
use tracing::{debug, error};
use url::Url;

use crate::{Result, WsError, options::Options, stream::MaybeTlsStream};

/// A freshly upgraded connection: the raw stream, bytes read past the end
/// of the handshake response, and the masking key assigned to the
/// connection.
#[derive(Debug)]
pub(crate) struct Handshake<S> {
    pub stream: S,
    pub read_buf: Bytes,
    pub mask: [u8; 4],
}

/// Dials `url`, performing TLS for `wss`/`https` schemes, then runs the
/// upgrade handshake with `headers` merged into the request.
pub(crate) async fn connect(
    url: &Url,
    headers: HeaderMap,
    options: &Options,
) -> Result<Handshake<MaybeTlsStream<TcpStream>>> {
    let secure = match url.scheme() {
        "ws" | "http" => false,
        "wss" | "https" => true,
        other => return Err(WsError::UnsupportedScheme(other.to_owned())),
    };

    let host = url.host_str().ok_or(WsError::UnsupportedScheme(
        url.scheme().to_owned(),
    ))?;
    let port = url.port().unwrap_or(if secure { 443 } else { 80 });

    let socket = TcpStream::connect((host, port)).await?;
    if options.no_delay {
        socket.set_nodelay(true)?;
    }

    let stream = if secure {
        let connector = tls_connector();
        let domain = ServerName::try_from(host.to_owned())
            .map_err(|_| WsError::UnsupportedScheme(url.scheme().to_owned()))?;
        MaybeTlsStream::Tls(connector.connect(domain, socket).await?)
    } else {
        MaybeTlsStream::Plain(socket)
    };

    handshake_on(stream, url, headers).await
}

/// Runs the upgrade handshake over an already established stream.
pub(crate) async fn handshake_on<S>(io: S, url: &Url, headers: HeaderMap) -> Result<Handshake<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let key = generate_key();

    let mut request = Request::builder()
        .method("GET")
        .uri(&url[url::Position::BeforePath..])
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(SEC_WEBSOCKET_KEY, key.clone())
        .header(SEC_WEBSOCKET_VERSION, "13")
        .body(Empty::<Bytes>::new())
        .map_err(|err| WsError::Http(err.to_string()))?;

    if !headers.contains_key(HOST) {
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_owned(),
            (None, _) => return Err(WsError::UnsupportedScheme(url.scheme().to_owned())),
        };
        request.headers_mut().insert(
            HOST,
            HeaderValue::from_str(&host)
                .map_err(|err| WsError::InvalidHeader(err.to_string()))?,
        );
    }

    // Caller headers go in last so they win over the defaults.
    for (name, value) in headers {
        if let Some(name) = name {
            request.headers_mut().insert(name, value);
        }
    }

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|err| WsError::Http(err.to_string()))?;

    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            error!("handshake connection error: {err}");
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|err| WsError::Http(err.to_string()))?;

    if let Err(err) = verify(&response, &key) {
        drop(sender);
        return Err(err);
    }

    let upgraded = upgrade::on(response)
        .await
        .map_err(|err| WsError::Http(err.to_string()))?;
    let parts = upgraded
        .downcast::<TokioIo<S>>()
        .expect("stream type changed during upgrade");

    debug!(host = url.host_str(), "websocket handshake complete");

    Ok(Handshake {
        stream: parts.io.into_inner(),
        read_buf: parts.read_buf,
        mask: rand::random(),
    })
}

/// Checks the server's `101` response against RFC 6455 Section 4.2.2.
fn verify<B>(response: &Response<B>, key: &str) -> Result<()> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(WsError::InvalidStatusCode(response.status().as_u16()));
    }

    let headers = response.headers();

    let upgrade_ok = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrade_ok {
        return Err(WsError::InvalidUpgradeHeader);
    }

    let connection_ok = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        });
    if !connection_ok {
        return Err(WsError::InvalidConnectionHeader);
    }

    let accept_ok = headers
        .get(SEC_WEBSOCKET_ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == accept_key(key));
    if !accept_ok {
        return Err(WsError::InvalidAcceptKey);
    }

    Ok(())
}

/// Generates a random 16-byte key, base64 encoded.
fn generate_key() -> String {
    let bytes: [u8; 16] = rand::random();
    STANDARD.encode(bytes)
}

/// Derives the expected `Sec-WebSocket-Accept` value for `key`.
pub(crate) fn accept_key(key: &str) -> String {
    const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID.as_bytes());
    STANDARD.encode(sha1.finalize())
}

/// Builds a TLS connector trusting the bundled webpki roots.
fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsConnector::from(std::sync::Arc::new(config))
}
