use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms, ring};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme, SupportedProtocolVersion};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::BoxedIo;
use super::trace::ConnectionTrace;
use crate::error::Error;
use crate::metrics::ClientMetrics;

pub const DISABLE_TLS_FALLBACK_ENV: &str = "DISABLE_TLS_FALLBACK";

const OVERRIDE_UNSET: u8 = 0;
const OVERRIDE_ENABLED: u8 = 1;
const OVERRIDE_DISABLED: u8 = 2;

static FALLBACK_OVERRIDE: AtomicU8 = AtomicU8::new(OVERRIDE_UNSET);
static FALLBACK_DISABLED_BY_ENV: OnceLock<bool> = OnceLock::new();

pub fn tls_fallback_disabled() -> bool {
    match FALLBACK_OVERRIDE.load(Ordering::Relaxed) {
        OVERRIDE_ENABLED => false,
        OVERRIDE_DISABLED => true,
        _ => *FALLBACK_DISABLED_BY_ENV.get_or_init(|| {
            std::env::var(DISABLE_TLS_FALLBACK_ENV)
                .map(|value| is_truthy(&value))
                .unwrap_or(false)
        }),
    }
}

pub fn set_tls_fallback_disabled(disabled: bool) {
    let value = if disabled {
        OVERRIDE_DISABLED
    } else {
        OVERRIDE_ENABLED
    };
    FALLBACK_OVERRIDE.store(value, Ordering::Relaxed);
}

pub fn clear_tls_fallback_override() {
    FALLBACK_OVERRIDE.store(OVERRIDE_UNSET, Ordering::Relaxed);
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub struct TlsSession {
    pub io: BoxedIo,
    pub alpn: Option<Vec<u8>>,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TlsSession")
            .field("alpn", &self.alpn.as_deref().map(String::from_utf8_lossy))
            .finish_non_exhaustive()
    }
}

pub trait TlsDialer: Send + Sync {
    fn handshake<'a>(
        &'a self,
        tcp: TcpStream,
        server_name: &'a str,
    ) -> BoxFuture<'a, io::Result<TlsSession>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelloProfile {
    Standard,
    Chrome,
    Compat,
}

#[derive(Debug)]
struct NoCertificateVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[derive(Clone)]
pub struct RustlsDialer {
    connector: TlsConnector,
    profile: HelloProfile,
}

impl RustlsDialer {
    pub fn new(profile: HelloProfile, alpn: &[&[u8]]) -> Result<Self, Error> {
        let provider = profile_provider(profile);
        let verifier = Arc::new(NoCertificateVerification {
            algorithms: provider.signature_verification_algorithms,
        });
        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(profile_versions(profile))
            .map_err(|source| Error::TlsConfig {
                message: source.to_string(),
            })?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|protocol| protocol.to_vec()).collect();
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            profile,
        })
    }

    pub fn profile(&self) -> HelloProfile {
        self.profile
    }
}

impl std::fmt::Debug for RustlsDialer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RustlsDialer")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl TlsDialer for RustlsDialer {
    fn handshake<'a>(
        &'a self,
        tcp: TcpStream,
        server_name: &'a str,
    ) -> BoxFuture<'a, io::Result<TlsSession>> {
        Box::pin(async move {
            let name = ServerName::try_from(server_name.to_owned())
                .map_err(|source| io::Error::new(io::ErrorKind::InvalidInput, source))?;
            let stream = self.connector.connect(name, tcp).await?;
            let alpn = stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
            Ok(TlsSession {
                io: Box::new(stream),
                alpn,
            })
        })
    }
}

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];

fn profile_versions(profile: HelloProfile) -> &'static [&'static SupportedProtocolVersion] {
    match profile {
        HelloProfile::Standard | HelloProfile::Chrome => rustls::DEFAULT_VERSIONS,
        HelloProfile::Compat => TLS12_ONLY,
    }
}

fn profile_provider(profile: HelloProfile) -> CryptoProvider {
    use ring::cipher_suite as suite;

    let defaults = ring::default_provider();
    match profile {
        HelloProfile::Standard => defaults,
        HelloProfile::Chrome => CryptoProvider {
            cipher_suites: vec![
                suite::TLS13_AES_128_GCM_SHA256,
                suite::TLS13_AES_256_GCM_SHA384,
                suite::TLS13_CHACHA20_POLY1305_SHA256,
                suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
            kx_groups: vec![
                ring::kx_group::X25519,
                ring::kx_group::SECP256R1,
                ring::kx_group::SECP384R1,
            ],
            ..defaults
        },
        HelloProfile::Compat => CryptoProvider {
            cipher_suites: vec![
                suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
            kx_groups: vec![ring::kx_group::SECP256R1, ring::kx_group::X25519],
            ..defaults
        },
    }
}

pub(crate) async fn dial_tls<F, Fut>(
    mut connect: F,
    server_name: &str,
    primary: &dyn TlsDialer,
    fallback: Option<&dyn TlsDialer>,
    handshake_timeout: Option<Duration>,
    metrics: &ClientMetrics,
    trace: Option<&ConnectionTrace>,
) -> io::Result<TlsSession>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<TcpStream>>,
{
    let tcp = connect().await?;
    let primary_error =
        match handshake_within(primary, tcp, server_name, handshake_timeout).await {
            Ok(session) => {
                if let Some(trace) = trace {
                    trace.tls_handshake_done(server_name, session.alpn.as_deref(), false);
                }
                return Ok(session);
            }
            Err(error) if error.kind() == io::ErrorKind::TimedOut => return Err(error),
            Err(error) => error,
        };

    let Some(fallback) = fallback.filter(|_| !tls_fallback_disabled()) else {
        return Err(primary_error);
    };
    debug!(
        server_name,
        error = %primary_error,
        "primary tls handshake failed; redialing with fallback profile"
    );

    let tcp = connect().await?;
    match handshake_within(fallback, tcp, server_name, handshake_timeout).await {
        Ok(session) => {
            metrics.record_tls_fallback();
            if let Some(trace) = trace {
                trace.tls_handshake_done(server_name, session.alpn.as_deref(), true);
            }
            Ok(session)
        }
        Err(error) => {
            debug!(server_name, error = %error, "fallback tls handshake failed");
            Err(primary_error)
        }
    }
}

async fn handshake_within(
    dialer: &dyn TlsDialer,
    tcp: TcpStream,
    server_name: &str,
    handshake_timeout: Option<Duration>,
) -> io::Result<TlsSession> {
    let handshake = dialer.handshake(tcp, server_name);
    let Some(limit) = handshake_timeout.filter(|limit| !limit.is_zero()) else {
        return handshake.await;
    };
    match tokio::time::timeout(limit, handshake).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "tls handshake with {server_name} timed out after {}ms",
                limit.as_millis()
            ),
        )),
    }
}
