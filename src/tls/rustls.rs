use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::MaybeTlsStream;
use crate::config::{SslMode, TlsConfig};
use crate::error::{ReaderError, Result};
use crate::protocol::framing::{read_ssl_response, write_ssl_request};

pub(super) async fn upgrade(
    mut tcp: TcpStream,
    tls: &TlsConfig,
    host: &str,
) -> Result<MaybeTlsStream> {
    write_ssl_request(&mut tcp).await?;
    if read_ssl_response(&mut tcp).await? != b'S' {
        if tls.mode == SslMode::Prefer {
            tracing::debug!("server declined TLS, continuing in plaintext");
            return Ok(MaybeTlsStream::Plain(tcp));
        }
        return Err(ReaderError::Tls(
            "server does not support TLS (SSLRequest rejected)".into(),
        ));
    }

    let connector = TlsConnector::from(Arc::new(client_config(tls)?));
    let sni = tls.sni_hostname.clone().unwrap_or_else(|| host.to_string());
    let server_name = ServerName::try_from(sni)
        .map_err(|e| ReaderError::Tls(format!("invalid server name: {e}")))?;

    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ReaderError::Tls(format!("tls handshake failed: {e}")))?;
    Ok(MaybeTlsStream::Tls(Box::new(stream)))
}

fn client_config(tls: &TlsConfig) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ReaderError::Tls(format!("tls protocol versions: {e}")))?;

    let cfg = match tls.mode {
        SslMode::VerifyFull => builder
            .with_root_certificates(root_store(tls)?)
            .with_no_client_auth(),
        SslMode::VerifyCa => {
            let inner = WebPkiServerVerifier::builder_with_provider(
                Arc::new(root_store(tls)?),
                provider,
            )
            .build()
            .map_err(|e| ReaderError::Tls(format!("tls verifier: {e}")))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(ChainOnly { inner }))
                .with_no_client_auth()
        }
        // libpq semantics: require/prefer encrypt but do not authenticate the server
        SslMode::Require | SslMode::Prefer | SslMode::Disable => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AnyCert { provider }))
            .with_no_client_auth(),
    };
    Ok(cfg)
}

fn root_store(tls: &TlsConfig) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match &tls.ca_pem_path {
        Some(path) => {
            let f = File::open(path).map_err(|e| ReaderError::Tls(format!("open CA pem: {e}")))?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(f))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ReaderError::Tls(format!("parse CA pem: {e}")))?;
            let (added, _ignored) = roots.add_parsable_certificates(certs);
            if added == 0 {
                return Err(ReaderError::Tls(format!(
                    "no usable certificates in {}",
                    path.display()
                )));
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

/// verify-ca: the chain must lead to a trusted root, the name may differ.
#[derive(Debug)]
struct ChainOnly {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ChainOnly {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp, now)
        {
            // the chain checks run before the name check, so a name error means the chain is fine
            Err(rustls::Error::InvalidCertificate(ce))
                if format!("{ce:?}").starts_with("NotValidForName") =>
            {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// require / prefer: any certificate, but handshake signatures still checked.
#[derive(Debug)]
struct AnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
