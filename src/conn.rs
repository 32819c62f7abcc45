//! socket acquisition and the boxed duplex stream type.

use std::path::PathBuf;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{
    error::Error,
    origin::Origin,
};

/// object safe duplex byte stream.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// boxed connection stream. handed to `Handler::on_upgrade` after a
/// protocol switch.
pub type Io = Box<dyn IoStream>;

/// raw byte stream surrendered by the client after an upgrade, together with
/// any bytes read past the response head.
pub struct Upgraded {
    pub(crate) io: Io,
    pub(crate) read_buf: Bytes,
}

impl Upgraded {
    /// the io stream and the read-ahead bytes that arrived with the upgrade
    /// response. the caller owns both from here on.
    pub fn into_parts(self) -> (Io, Bytes) {
        (self.io, self.read_buf)
    }
}

/// tls configuration bundle for https origins.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// SNI hostname override. defaults to the origin host.
    pub servername: Option<String>,
    /// additional trusted root certificate, DER encoded.
    pub ca: Option<Vec<u8>>,
    /// verify the server certificate chain and hostname. default true.
    pub reject_unauthorized: bool,
    /// resume tls sessions across reconnects. default true.
    pub reuse_sessions: bool,
    /// session cache capacity when resumption is enabled. default 100.
    pub max_cached_sessions: usize,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            servername: None,
            ca: None,
            reject_unauthorized: true,
            reuse_sessions: true,
            max_cached_sessions: 100,
        }
    }
}

/// per client tls machinery. the rustls config owns the session cache, so it
/// is built once and survives reconnects to honor session reuse.
pub(crate) struct TlsState {
    #[cfg(feature = "rustls")]
    config: once_cell::sync::OnceCell<std::sync::Arc<tokio_rustls::rustls::ClientConfig>>,
}

impl TlsState {
    pub(crate) fn new() -> Self {
        Self {
            #[cfg(feature = "rustls")]
            config: once_cell::sync::OnceCell::new(),
        }
    }
}

/// establish the byte stream for a client: tcp or a named local endpoint,
/// with a tls handshake layered on for https origins.
pub(crate) async fn connect(
    origin: &Origin,
    socket_path: Option<&PathBuf>,
    servername: Option<&str>,
    tls: &TlsOptions,
    tls_state: &TlsState,
) -> Result<Io, Error> {
    let _ = (servername, tls, tls_state);

    if let Some(path) = socket_path {
        return connect_unix(path).await;
    }

    let stream = connect_tcp(origin).await?;

    if origin.is_tls() {
        #[cfg(feature = "rustls")]
        {
            return tls::handshake(stream, origin, servername, tls, tls_state).await;
        }

        #[cfg(not(feature = "rustls"))]
        {
            return Err(Error::NotSupported("https origin without the rustls feature"));
        }
    }

    Ok(Box::new(stream))
}

async fn connect_tcp(origin: &Origin) -> Result<TcpStream, Error> {
    let (host, port) = origin.addr();
    let mut addrs = tokio::net::lookup_host((host, port)).await?;

    let mut addr = addrs
        .next()
        .ok_or_else(|| Error::invalid(format!("{host} resolved to no address")))?;

    // try every resolved address, returning the last error when all fail.
    let stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(e) => match addrs.next() {
                Some(next) => addr = next,
                None => return Err(e.into()),
            },
        }
    };

    let _ = stream.set_nodelay(true);
    debug!(target: "client", addr = %addr, "tcp connected");

    Ok(stream)
}

#[cfg(unix)]
async fn connect_unix(path: &PathBuf) -> Result<Io, Error> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    debug!(target: "client", path = %path.display(), "unix socket connected");
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn connect_unix(_path: &PathBuf) -> Result<Io, Error> {
    Err(Error::NotSupported("socket_path on this platform"))
}

#[cfg(feature = "rustls")]
mod tls {
    use std::sync::Arc;

    use tokio_rustls::{
        TlsConnector,
        rustls::{
            self, CertificateError, ClientConfig, RootCertStore,
            pki_types::{CertificateDer, ServerName},
        },
    };

    use crate::error::TlsError;

    use super::*;

    pub(super) async fn handshake(
        stream: TcpStream,
        origin: &Origin,
        servername: Option<&str>,
        opts: &TlsOptions,
        state: &TlsState,
    ) -> Result<Io, Error> {
        let config = state
            .config
            .get_or_try_init(|| build_config(opts).map(Arc::new))?
            .clone();

        let name = servername
            .or(opts.servername.as_deref())
            .unwrap_or(origin.host())
            .to_string();
        let name = ServerName::try_from(name).map_err(|e| TlsError::Other(e.to_string()))?;

        let connector = TlsConnector::from(config);
        let stream = connector.connect(name, stream).await.map_err(map_tls_io_err)?;

        Ok(Box::new(stream))
    }

    fn build_config(opts: &TlsOptions) -> Result<ClientConfig, Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca) = &opts.ca {
            roots
                .add(CertificateDer::from(ca.clone()))
                .map_err(|e| TlsError::Other(e.to_string()))?;
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        config.resumption = if opts.reuse_sessions {
            rustls::client::Resumption::in_memory_sessions(opts.max_cached_sessions.max(1))
        } else {
            rustls::client::Resumption::disabled()
        };

        if !opts.reject_unauthorized {
            config
                .dangerous()
                .set_certificate_verifier(SkipServerVerification::new());
        }

        Ok(config)
    }

    fn map_tls_io_err(e: std::io::Error) -> Error {
        if let Some(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return TlsError::AltNameInvalid.into();
        }
        TlsError::Other(e.to_string()).into()
    }

    // certificate verification bypass for reject_unauthorized = false.
    // signatures are still checked, trust chain and hostname are not.
    #[derive(Debug)]
    struct SkipServerVerification;

    impl SkipServerVerification {
        fn new() -> Arc<Self> {
            Arc::new(Self)
        }
    }

    impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
