//! TLS over TDS.
//!
//! During the handshake TLS records travel inside TDS packets:
//! - client records are wrapped in PRELOGIN packets (type 0x12)
//! - server records arrive in packets whose headers are stripped here
//!
//! Once the handshake completes the wrapper switches to pass-through and the
//! TLS stream carries the TDS packets of the rest of the session.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::BytesMut;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::error::{codes, ConnectionError, ConnectionResult};
use super::protocol::{packet_status, packet_type, PacketHeader, DEFAULT_PACKET_SIZE, HEADER_SIZE};
use super::transport::BoxStream;

/// Stream adapter that frames handshake records as TDS packets.
pub struct TdsTlsStream<S> {
    inner: S,
    header: [u8; HEADER_SIZE],
    header_filled: usize,
    /// Bytes left in the payload of the packet being read
    payload_remaining: usize,
    /// TLS bytes written since the last flush
    pending: Vec<u8>,
    /// Framed packets being flushed, kept across polls with the write offset
    write_buf: BytesMut,
    written: usize,
    passthrough: bool,
}

impl<S> TdsTlsStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            header: [0; HEADER_SIZE],
            header_filled: 0,
            payload_remaining: 0,
            pending: Vec::with_capacity(DEFAULT_PACKET_SIZE),
            write_buf: BytesMut::with_capacity(DEFAULT_PACKET_SIZE),
            written: 0,
            passthrough: false,
        }
    }

    /// Stop framing once the handshake is over.
    pub fn set_passthrough(&mut self, enabled: bool) {
        debug!("TLS framing pass-through = {}", enabled);
        self.passthrough = enabled;
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn frame_pending(&mut self) {
        let max_payload = DEFAULT_PACKET_SIZE - HEADER_SIZE;
        let mut packet_id: u8 = 1;
        let mut chunks = self.pending.chunks(max_payload).peekable();
        while let Some(chunk) = chunks.next() {
            let status = if chunks.peek().is_none() {
                packet_status::END_OF_MESSAGE
            } else {
                packet_status::NORMAL
            };
            PacketHeader::new(packet_type::PRELOGIN, status, (HEADER_SIZE + chunk.len()) as u16, packet_id)
                .encode(&mut self.write_buf);
            self.write_buf.extend_from_slice(chunk);
            packet_id = packet_id.wrapping_add(1);
        }
        trace!("Framed {} TLS bytes into {} bytes of packets", self.pending.len(), self.write_buf.len());
        self.pending.clear();
        self.written = 0;
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TdsTlsStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.passthrough {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if this.payload_remaining > 0 {
                let limit = buf.remaining().min(this.payload_remaining);
                let n = {
                    let mut dst = ReadBuf::new(buf.initialize_unfilled_to(limit));
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut dst))?;
                    dst.filled().len()
                };
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Connection closed inside a TLS packet",
                    )));
                }
                buf.advance(n);
                this.payload_remaining -= n;
                return Poll::Ready(Ok(()));
            }

            while this.header_filled < HEADER_SIZE {
                let mut dst = ReadBuf::new(&mut this.header[this.header_filled..]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut dst))?;
                let n = dst.filled().len();
                if n == 0 {
                    if this.header_filled == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Connection closed inside a packet header",
                    )));
                }
                this.header_filled += n;
            }

            let header = PacketHeader::decode(&this.header)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            this.header_filled = 0;
            this.payload_remaining = header.payload_len();
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TdsTlsStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.passthrough {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        this.pending.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_buf.is_empty() && !this.pending.is_empty() {
            this.frame_pending();
        }
        while this.written < this.write_buf.len() {
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &this.write_buf[this.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::WriteZero, "Failed to write TLS packet")));
            }
            this.written += n;
        }
        this.write_buf.clear();
        this.written = 0;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Build the client TLS configuration.
///
/// With `trust_server_certificate` the server certificate is not verified.
pub fn client_config(trust_server_certificate: bool) -> ConnectionResult<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectionError::transport(codes::ETLS, format!("Failed to set protocol versions: {}", e)))?;

    let config = if trust_server_certificate {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(config)
}

/// Run the TLS handshake over the PRELOGIN framing and return the encrypted stream.
pub async fn upgrade(stream: BoxStream, host: &str, trust_server_certificate: bool) -> ConnectionResult<BoxStream> {
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config(trust_server_certificate)?));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ConnectionError::transport(codes::ETLS, format!("Invalid server name: {}", host)))?;

    let mut tls = connector
        .connect(server_name, TdsTlsStream::new(stream))
        .await
        .map_err(|e| ConnectionError::transport(codes::ETLS, format!("TLS handshake failed: {}", e)))?;
    tls.get_mut().0.set_passthrough(true);
    debug!("TLS negotiated with {}", host);
    Ok(Box::new(tls))
}

/// Certificate verifier that accepts any server certificate.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
