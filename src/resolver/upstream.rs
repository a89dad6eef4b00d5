//! Terminal chain stage: forwards queries to an external DNS server.
//!
//! Two client flavors sit behind the same `call_external` contract: classic
//! DNS over UDP/TCP/TCP-TLS, and DNS-over-HTTPS (POST with
//! `application/dns-message`). Transient network errors are retried up to
//! three times; permanent errors surface immediately.

use crate::config::{Net, Upstream};
use crate::resolver::{with_prefix, Request, Resolver, Response, ResponseType};
use crate::util;
use anyhow::Result;
use async_trait::async_trait;
use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, Instrument};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const UDP_BUFFER_SIZE: usize = 4096;
const EXCHANGE_ATTEMPTS: usize = 3;
const DNS_CONTENT_TYPE: &str = "application/dns-message";

static SHARED_TLS_CONFIG: LazyLock<Arc<rustls::ClientConfig>> = LazyLock::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("can't pack message: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
    #[error("can't perform https request: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http return code should be 200, but received {0}")]
    HttpStatus(u16),
    #[error("http return content type should be '{DNS_CONTENT_TYPE}', but was '{0}'")]
    HttpContentType(String),
    #[error("invalid tls server name '{0}'")]
    TlsName(String),
    #[error("no address found for '{0}'")]
    NoAddress(String),
}

impl ExchangeError {
    fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Timeout(_) => true,
            ExchangeError::Io(err) => matches!(
                err.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::WouldBlock
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::Interrupted
            ),
            ExchangeError::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

enum UpstreamClient {
    Dns(DnsUpstreamClient),
    Https(HttpUpstreamClient),
}

/// Transport of a classic (non-DoH) upstream.
#[derive(Clone, Copy)]
enum ClassicNet {
    Udp,
    Tcp,
    TcpTls,
}

struct DnsUpstreamClient {
    net: ClassicNet,
    tls_host: String,
}

struct HttpUpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    async fn call_external(
        &self,
        message: &Message,
        url: &str,
    ) -> Result<(Message, Duration), ExchangeError> {
        let start = Instant::now();
        let response = match self {
            UpstreamClient::Dns(client) => client.exchange(message, url).await?,
            UpstreamClient::Https(client) => client.exchange(message, url).await?,
        };
        Ok((response, start.elapsed()))
    }
}

impl DnsUpstreamClient {
    async fn exchange(&self, message: &Message, addr: &str) -> Result<Message, ExchangeError> {
        match self.net {
            ClassicNet::Udp => exchange_udp(message, addr).await,
            ClassicNet::Tcp => {
                let raw = message.to_vec()?;
                let payload = tokio::time::timeout(DEFAULT_TIMEOUT, async {
                    let stream = TcpStream::connect(addr).await?;
                    exchange_stream(stream, &raw).await
                })
                .await
                .map_err(|_| ExchangeError::Timeout(addr.to_string()))??;
                Ok(Message::from_vec(&payload)?)
            }
            ClassicNet::TcpTls => {
                let raw = message.to_vec()?;
                let server_name = ServerName::try_from(self.tls_host.clone())
                    .map_err(|_| ExchangeError::TlsName(self.tls_host.clone()))?;
                let payload = tokio::time::timeout(DEFAULT_TIMEOUT, async {
                    let connector = tokio_rustls::TlsConnector::from(SHARED_TLS_CONFIG.clone());
                    let tcp = TcpStream::connect(addr).await?;
                    let stream = connector.connect(server_name, tcp).await?;
                    exchange_stream(stream, &raw).await
                })
                .await
                .map_err(|_| ExchangeError::Timeout(addr.to_string()))??;
                Ok(Message::from_vec(&payload)?)
            }
        }
    }
}

impl HttpUpstreamClient {
    async fn exchange(&self, message: &Message, url: &str) -> Result<Message, ExchangeError> {
        let raw = message.to_vec()?;

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, DNS_CONTENT_TYPE)
            .body(raw)
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(ExchangeError::HttpStatus(response.status().as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if content_type != DNS_CONTENT_TYPE {
            return Err(ExchangeError::HttpContentType(content_type));
        }

        let body = response.bytes().await?;
        Ok(Message::from_vec(&body)?)
    }
}

/// One message exchange over UDP with the standard per-attempt timeout and a
/// 4096-byte receive buffer. Also used by the CNAME stage for its inline
/// sub-queries.
pub(crate) async fn exchange_udp(message: &Message, addr: &str) -> Result<Message, ExchangeError> {
    let raw = message.to_vec()?;

    let payload = tokio::time::timeout(DEFAULT_TIMEOUT, async {
        let target = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| ExchangeError::NoAddress(addr.to_string()))?;
        let bind_addr: SocketAddr = if target.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;
        socket.send(&raw).await?;

        let mut buffer = vec![0u8; UDP_BUFFER_SIZE];
        let received = socket.recv(&mut buffer).await?;
        buffer.truncate(received);
        Ok::<_, ExchangeError>(buffer)
    })
    .await
    .map_err(|_| ExchangeError::Timeout(addr.to_string()))??;

    Ok(Message::from_vec(&payload)?)
}

// DNS over a stream transport uses a two-byte length prefix in both
// directions.
async fn exchange_stream<S>(mut stream: S, raw: &[u8]) -> Result<Vec<u8>, ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let length = (raw.len() as u16).to_be_bytes();
    stream.write_all(&length).await?;
    stream.write_all(raw).await?;
    stream.flush().await?;

    let mut length_buffer = [0u8; 2];
    stream.read_exact(&mut length_buffer).await?;
    let response_length = u16::from_be_bytes(length_buffer) as usize;

    let mut payload = vec![0u8; response_length];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Sends requests to an external DNS server.
pub struct UpstreamResolver {
    client: UpstreamClient,
    url: String,
}

impl UpstreamResolver {
    pub fn new(upstream: Upstream) -> Self {
        let url = endpoint_url(&upstream);
        let client = match upstream.net {
            Net::Https => UpstreamClient::Https(HttpUpstreamClient {
                client: reqwest::Client::builder()
                    .timeout(DEFAULT_TIMEOUT)
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            }),
            Net::Udp => UpstreamClient::Dns(DnsUpstreamClient {
                net: ClassicNet::Udp,
                tls_host: upstream.host.clone(),
            }),
            Net::Tcp => UpstreamClient::Dns(DnsUpstreamClient {
                net: ClassicNet::Tcp,
                tls_host: upstream.host.clone(),
            }),
            Net::TcpTls => UpstreamClient::Dns(DnsUpstreamClient {
                net: ClassicNet::TcpTls,
                tls_host: upstream.host.clone(),
            }),
        };
        Self { client, url }
    }
}

fn endpoint_url(upstream: &Upstream) -> String {
    let host = if upstream.host.contains(':') {
        format!("[{}]", upstream.host)
    } else {
        upstream.host.clone()
    };

    match upstream.net {
        Net::Https => format!("https://{host}:{}{}", upstream.port, upstream.path),
        _ => format!("{host}:{}", upstream.port),
    }
}

#[async_trait]
impl Resolver for UpstreamResolver {
    async fn resolve(&self, request: &Request) -> Result<Response> {
        let span = with_prefix(&request.log, "upstream_resolver");
        async move {
            let mut attempt = 1;
            loop {
                match self.client.call_external(&request.message, &self.url).await {
                    Ok((response, rtt)) => {
                        debug!(
                            answer = %util::answer_to_string(response.answers()),
                            return_code = ?response.response_code(),
                            upstream = %self.url,
                            response_time_ms = rtt.as_millis() as u64,
                            "received response from upstream"
                        );
                        return Ok(Response {
                            message: response,
                            rtype: ResponseType::Resolved,
                            reason: format!("RESOLVED ({})", self.url),
                        });
                    }
                    Err(err) if err.is_transient() && attempt < EXCHANGE_ATTEMPTS => {
                        debug!(attempt, "temporary network error / timeout occurred, retrying");
                        attempt += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        .instrument(span)
        .await
    }

    fn configuration(&self) -> Vec<String> {
        vec![format!("upstream '{}'", self.url)]
    }

    fn name(&self) -> &'static str {
        "upstream_resolver"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::testing::request;
    use hickory_proto::rr::{RData, RecordType};
    use std::net::{IpAddr, Ipv4Addr};

    async fn spawn_udp_responder(answer_ip: Ipv4Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; UDP_BUFFER_SIZE];
            while let Ok((len, peer)) = socket.recv_from(&mut buffer).await {
                let query = Message::from_vec(&buffer[..len]).unwrap();
                let mut reply = util::new_reply(&query);
                if let Some(question) = query.queries().first() {
                    reply.add_answer(util::create_answer(
                        question.name().clone(),
                        IpAddr::V4(answer_ip),
                        300,
                    ));
                }
                let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
            }
        });
        addr
    }

    async fn spawn_tcp_responder(answer_ip: Ipv4Addr) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut length_buffer = [0u8; 2];
                stream.read_exact(&mut length_buffer).await.unwrap();
                let len = u16::from_be_bytes(length_buffer) as usize;
                let mut payload = vec![0u8; len];
                stream.read_exact(&mut payload).await.unwrap();

                let query = Message::from_vec(&payload).unwrap();
                let mut reply = util::new_reply(&query);
                if let Some(question) = query.queries().first() {
                    reply.add_answer(util::create_answer(
                        question.name().clone(),
                        IpAddr::V4(answer_ip),
                        300,
                    ));
                }
                let raw = reply.to_vec().unwrap();
                stream.write_all(&(raw.len() as u16).to_be_bytes()).await.unwrap();
                stream.write_all(&raw).await.unwrap();
            }
        });
        addr
    }

    fn upstream(net: Net, addr: SocketAddr) -> Upstream {
        Upstream {
            net,
            host: addr.ip().to_string(),
            port: addr.port(),
            path: String::new(),
        }
    }

    #[tokio::test]
    async fn test_resolve_via_udp() {
        let addr = spawn_udp_responder(Ipv4Addr::new(123, 124, 122, 122)).await;
        let resolver = UpstreamResolver::new(upstream(Net::Udp, addr));

        let req = request("example.com.", RecordType::A, None);
        let response = resolver.resolve(&req).await.unwrap();

        assert_eq!(response.rtype, ResponseType::Resolved);
        assert_eq!(response.reason, format!("RESOLVED ({addr})"));
        match response.message.answers()[0].data() {
            RData::A(ip) => assert_eq!(ip.0, Ipv4Addr::new(123, 124, 122, 122)),
            other => panic!("unexpected rdata {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_via_tcp() {
        let addr = spawn_tcp_responder(Ipv4Addr::new(10, 0, 0, 9)).await;
        let resolver = UpstreamResolver::new(upstream(Net::Tcp, addr));

        let req = request("example.com.", RecordType::A, None);
        let response = resolver.resolve(&req).await.unwrap();

        assert_eq!(response.rtype, ResponseType::Resolved);
        assert_eq!(response.message.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_refused_fails_after_retries() {
        // Bind-then-drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let resolver = UpstreamResolver::new(upstream(Net::Tcp, addr));
        let req = request("example.com.", RecordType::A, None);
        assert!(resolver.resolve(&req).await.is_err());
    }

    #[test]
    fn test_endpoint_url() {
        let u: Upstream = "udp:8.8.8.8".parse().unwrap();
        assert_eq!(endpoint_url(&u), "8.8.8.8:53");

        let u: Upstream = "tcp-tls:[fd00::6cd4]:853".parse().unwrap();
        assert_eq!(endpoint_url(&u), "[fd00::6cd4]:853");

        let u: Upstream = "https:dns.example/dns-query".parse().unwrap();
        assert_eq!(endpoint_url(&u), "https://dns.example:443/dns-query");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Timeout("1.1.1.1:53".into()).is_transient());
        assert!(ExchangeError::Io(std::io::Error::from(ErrorKind::ConnectionRefused)).is_transient());
        assert!(!ExchangeError::HttpStatus(500).is_transient());
        assert!(!ExchangeError::Io(std::io::Error::from(ErrorKind::PermissionDenied)).is_transient());
    }
}
