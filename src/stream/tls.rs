//! TLS stream adapter over rustls.
//!
//! [`TlsStream`] wraps any clonable [`ConnectionStream`] and drives the
//! record machine lazily: the handshake completes during the first read or
//! write. The shared rustls state sits behind a fiber mutex so a reader
//! half and writer half cloned from one stream can be driven by two
//! fibers; waiting for incoming data happens outside the lock so a parked
//! reader never starves a writer.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConnection, DigitallySignedStruct, RootCertStore, ServerConnection};

use crate::clock::INFINITY;
use crate::error::{Error, Result};
use crate::fiber::Mutex;
use crate::stream::{ConnectionStream, InputStream, IoMode, OutputStream};

bitflags::bitflags! {
    /// Peer-validation policy, combinable as flags. An empty set disables
    /// certificate validation entirely.
    pub struct TlsPeerMode: u8 {
        /// Require the peer to present a certificate (client auth on the
        /// server side).
        const REQUIRE_CERT = 0b001;
        /// Validate the peer certificate chain against the trust store.
        const CHECK_PEER = 0b010;
        /// Validate the peer certificate chain and hostname against the
        /// trust store.
        const TRUSTED_CERT = 0b100;
    }
}

/// Protocol version selection. The backend supports 1.2 and 1.3; asking
/// for the retired 1.0/1.1 versions fails at configuration time instead
/// of silently downgrading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
    #[default]
    Any,
}

/// Certificate material and validation policy for one side of a
/// connection. Certificates and keys are PEM files.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub peer_mode: TlsPeerMode,
    pub version: TlsVersion,
    pub cert_chain_file: Option<PathBuf>,
    pub private_key_file: Option<PathBuf>,
    pub trust_store_file: Option<PathBuf>,
}

impl Default for TlsPeerMode {
    fn default() -> Self {
        TlsPeerMode::TRUSTED_CERT
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    Ok(certs?)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

fn load_roots(settings: &TlsSettings) -> Result<RootCertStore> {
    let path = settings.trust_store_file.as_ref().ok_or_else(|| {
        Error::Tls("peer validation requested but no trust store configured".into())
    })?;
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("invalid trust store certificate: {e}")))?;
    }
    Ok(roots)
}

fn protocol_versions(
    version: TlsVersion,
) -> Result<&'static [&'static rustls::SupportedProtocolVersion]> {
    static TLS12_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12];
    static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];
    match version {
        TlsVersion::Tls12 => Ok(TLS12_ONLY),
        TlsVersion::Tls13 => Ok(TLS13_ONLY),
        TlsVersion::Any => Ok(rustls::ALL_VERSIONS),
        TlsVersion::Tls10 | TlsVersion::Tls11 => {
            Err(Error::Tls("TLS 1.0/1.1 are not supported by the backend".into()))
        }
    }
}

/// Accepts any server certificate. Selected by an empty peer mode.
#[derive(Debug)]
struct NoVerification(rustls::crypto::WebPkiSupportedAlgorithms);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.supported_schemes()
    }
}

/// Builds the rustls client configuration for [`TlsStream::connect`].
pub fn build_client_config(settings: &TlsSettings) -> Result<Arc<rustls::ClientConfig>> {
    let versions = protocol_versions(settings.version)?;
    let builder = rustls::ClientConfig::builder_with_protocol_versions(versions);

    let builder = if settings
        .peer_mode
        .intersects(TlsPeerMode::CHECK_PEER | TlsPeerMode::TRUSTED_CERT)
    {
        builder.with_root_certificates(load_roots(settings)?)
    } else {
        let algs = rustls::crypto::ring::default_provider().signature_verification_algorithms;
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(algs)))
    };

    let config = match (&settings.cert_chain_file, &settings.private_key_file) {
        (Some(chain), Some(key)) => builder
            .with_client_auth_cert(load_certs(chain)?, load_key(key)?)
            .map_err(|e| Error::Tls(e.to_string()))?,
        _ => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Builds the rustls server configuration for [`TlsStream::accept`].
pub fn build_server_config(settings: &TlsSettings) -> Result<Arc<rustls::ServerConfig>> {
    let chain = settings
        .cert_chain_file
        .as_ref()
        .ok_or_else(|| Error::Tls("server TLS requires a certificate chain".into()))?;
    let key = settings
        .private_key_file
        .as_ref()
        .ok_or_else(|| Error::Tls("server TLS requires a private key".into()))?;

    let versions = protocol_versions(settings.version)?;
    let builder = rustls::ServerConfig::builder_with_protocol_versions(versions);

    let builder = if settings.peer_mode.contains(TlsPeerMode::REQUIRE_CERT) {
        let verifier = WebPkiClientVerifier::builder(Arc::new(load_roots(settings)?))
            .build()
            .map_err(|e| Error::Tls(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let config = builder
        .with_single_cert(load_certs(chain)?, load_key(key)?)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

enum TlsConn {
    Client(Box<ClientConnection>),
    Server(Box<ServerConnection>),
}

macro_rules! with_conn {
    ($conn:expr, $c:ident => $body:expr) => {
        match $conn {
            TlsConn::Client($c) => $body,
            TlsConn::Server($c) => $body,
        }
    };
}

struct TlsInner<C> {
    conn: TlsConn,
    io: C,
    /// Decrypted bytes known to be readable from the record layer.
    plain: usize,
    eof: bool,
    finalized: bool,
}

/// Adapter for reading bare records from the transport.
struct RecordIo<'a, C>(&'a mut C);

impl<C: ConnectionStream> Read for RecordIo<'_, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0
            .read(buf, IoMode::Once)
            .map_err(crate::stream::to_io)
    }
}

impl<C: ConnectionStream> Write for RecordIo<'_, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .write(buf, IoMode::All)
            .map_err(crate::stream::to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush().map_err(crate::stream::to_io)
    }
}

/// A TLS session over an underlying connection.
pub struct TlsStream<C> {
    state: Arc<Mutex<TlsInner<C>>>,
    /// Separate transport handle used to wait for readability without
    /// holding the session lock.
    waiter: C,
}

impl<C> Clone for TlsStream<C>
where
    C: Clone,
{
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            waiter: self.waiter.clone(),
        }
    }
}

impl<C: ConnectionStream + Clone + Send> TlsStream<C> {
    /// Client-side session; the handshake runs during the first read or
    /// write.
    pub fn connect(
        inner: C,
        server_name: &str,
        config: Arc<rustls::ClientConfig>,
    ) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::Tls(format!("invalid server name: {server_name}")))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(Self::from_conn(inner, TlsConn::Client(Box::new(conn))))
    }

    /// Server-side session over an accepted connection.
    pub fn accept(inner: C, config: Arc<rustls::ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config)?;
        Ok(Self::from_conn(inner, TlsConn::Server(Box::new(conn))))
    }

    fn from_conn(inner: C, conn: TlsConn) -> Self {
        let waiter = inner.clone();
        Self {
            state: Arc::new(Mutex::new(TlsInner {
                conn,
                io: inner,
                plain: 0,
                eof: false,
                finalized: false,
            })),
            waiter,
        }
    }

    fn ensure_handshake(st: &mut TlsInner<C>) -> Result<()> {
        while with_conn!(&st.conn, c => c.is_handshaking()) {
            let io = &mut st.io;
            let done = with_conn!(&mut st.conn, c => {
                c.complete_io(&mut RecordIo(io))
                    .map_err(crate::stream::from_io)?;
                !c.is_handshaking()
            });
            if done {
                break;
            }
        }
        Ok(())
    }

    /// Pulls one batch of records into the session. Returns `false` at
    /// transport eof.
    fn pump(st: &mut TlsInner<C>) -> Result<bool> {
        let io = &mut st.io;
        let n = with_conn!(&mut st.conn, c => c
            .read_tls(&mut RecordIo(io))
            .map_err(crate::stream::from_io))?;
        if n == 0 {
            st.eof = true;
            return Ok(false);
        }
        let state = with_conn!(&mut st.conn, c => c
            .process_new_packets()
            .map_err(|e| Error::Tls(e.to_string())))?;
        st.plain = state.plaintext_bytes_to_read();
        Ok(true)
    }

    fn drain_writes(st: &mut TlsInner<C>) -> Result<()> {
        while with_conn!(&st.conn, c => c.wants_write()) {
            let io = &mut st.io;
            with_conn!(&mut st.conn, c => c
                .write_tls(&mut RecordIo(io))
                .map_err(crate::stream::from_io))?;
        }
        Ok(())
    }

    fn read_plain(st: &mut TlsInner<C>, buf: &mut [u8]) -> Result<usize> {
        let res = with_conn!(&mut st.conn, c => c.reader().read(buf));
        match res {
            Ok(n) => {
                st.plain = st.plain.saturating_sub(n);
                if n == 0 {
                    st.eof = true;
                }
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                // Peer vanished without close_notify; surface a plain eof
                // the way the HTTP layers expect.
                st.eof = true;
                Ok(0)
            }
            Err(e) => Err(crate::stream::from_io(e)),
        }
    }

    fn read_once(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            {
                let mut st = self.state.lock();
                Self::ensure_handshake(&mut st)?;
                if st.plain > 0 {
                    let n = Self::read_plain(&mut st, buf)?;
                    if n > 0 {
                        return Ok(n);
                    }
                }
                if st.eof {
                    return Ok(0);
                }
                if st.io.data_available() > 0 {
                    if !Self::pump(&mut st)? {
                        return Ok(0);
                    }
                    continue;
                }
            }
            self.waiter.wait_for_data(INFINITY)?;
            let mut st = self.state.lock();
            if st.plain == 0 && !st.eof && !Self::pump(&mut st)? {
                return Ok(0);
            }
        }
    }
}

impl<C: ConnectionStream + Clone + Send> InputStream for TlsStream<C> {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        match mode {
            IoMode::All => {
                let mut done = 0;
                while done < buf.len() {
                    let n = self.read_once(&mut buf[done..])?;
                    if n == 0 {
                        return Err(crate::stream::unexpected_eof());
                    }
                    done += n;
                }
                Ok(done)
            }
            IoMode::Once => self.read_once(buf),
            IoMode::Immediate => {
                let mut st = self.state.lock();
                if st.plain == 0 {
                    return Ok(0);
                }
                Self::read_plain(&mut st, buf)
            }
        }
    }

    fn least_size(&mut self) -> Result<u64> {
        loop {
            {
                let mut st = self.state.lock();
                Self::ensure_handshake(&mut st)?;
                if st.plain > 0 {
                    return Ok(st.plain as u64);
                }
                if st.eof {
                    return Ok(0);
                }
                if st.io.data_available() > 0 {
                    Self::pump(&mut st)?;
                    continue;
                }
            }
            self.waiter.wait_for_data(INFINITY)?;
            let mut st = self.state.lock();
            if st.plain == 0 && !st.eof {
                Self::pump(&mut st)?;
            }
        }
    }

    fn data_available(&self) -> usize {
        // Without the lock this is a best-effort snapshot.
        match self.state.try_lock() {
            Some(st) => st.plain,
            None => 0,
        }
    }

    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        {
            let st = self.state.lock();
            if st.plain > 0 || st.eof {
                return Ok(true);
            }
        }
        self.waiter.wait_for_data(timeout)
    }
}

impl<C: ConnectionStream + Clone + Send> OutputStream for TlsStream<C> {
    fn write(&mut self, buf: &[u8], _mode: IoMode) -> Result<usize> {
        let mut st = self.state.lock();
        if st.finalized {
            return Err(Error::usage("write after finalize"));
        }
        Self::ensure_handshake(&mut st)?;
        with_conn!(&mut st.conn, c => c
            .writer()
            .write_all(buf)
            .map_err(crate::stream::from_io))?;
        Self::drain_writes(&mut st)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        let mut st = self.state.lock();
        Self::drain_writes(&mut st)?;
        st.io.flush()
    }

    fn finalize(&mut self) -> Result<()> {
        let mut st = self.state.lock();
        if st.finalized {
            return Ok(());
        }
        st.finalized = true;
        with_conn!(&mut st.conn, c => c.send_close_notify());
        Self::drain_writes(&mut st)?;
        st.io.flush()
    }
}

impl<C: ConnectionStream + Clone + Send + 'static> ConnectionStream for TlsStream<C> {
    fn connected(&self) -> bool {
        match self.state.try_lock() {
            Some(st) => !st.eof && st.io.connected(),
            None => true,
        }
    }

    fn close(&mut self) -> Result<()> {
        let mut st = self.state.lock();
        with_conn!(&mut st.conn, c => c.send_close_notify());
        let _ = Self::drain_writes(&mut st);
        st.io.close()
    }

    fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.waiter.peer_addr()
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.waiter.local_addr()
    }

    fn try_clone(&self) -> Result<Box<dyn ConnectionStream + Send>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retired_versions_are_rejected() {
        for v in [TlsVersion::Tls10, TlsVersion::Tls11] {
            assert!(protocol_versions(v).is_err());
        }
        assert!(protocol_versions(TlsVersion::Any).is_ok());
    }

    #[test]
    fn validation_requires_trust_store() {
        let settings = TlsSettings {
            peer_mode: TlsPeerMode::TRUSTED_CERT,
            ..TlsSettings::default()
        };
        assert!(build_client_config(&settings).is_err());
    }

    #[test]
    fn no_validation_config_builds() {
        let settings = TlsSettings {
            peer_mode: TlsPeerMode::empty(),
            ..TlsSettings::default()
        };
        build_client_config(&settings).unwrap();
    }
}
