// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2026 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! TLS connector construction for WebSocket connections.
//!
//! The local Client Portal Gateway terminates TLS with a self-signed
//! certificate, so three modes are needed: the webpki trust store (OAuth /
//! hosted endpoints), a caller-supplied CA bundle, and verification disabled.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use rustls::{
    RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio_tungstenite::Connector;

use super::error::{IbkrWsError, IbkrWsResult};

/// Builds the connector for a WebSocket URL.
///
/// Plain `ws://` URLs bypass TLS entirely. For `wss://`, the connector trusts
/// the webpki roots plus `cacert` when provided; with `verify_ssl` off the
/// certificate checks are skipped (gateway mode only).
///
/// # Errors
///
/// Returns a transport error if the CA bundle cannot be read or the TLS
/// configuration fails to build.
pub fn build_connector(
    url: &str,
    cacert: Option<&Path>,
    verify_ssl: bool,
) -> IbkrWsResult<Connector> {
    if url.starts_with("ws://") {
        return Ok(Connector::Plain);
    }

    // Pin the provider rather than relying on a process-wide default.
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| IbkrWsError::Transport(format!("cannot build TLS config: {e}")))?;

    let config = if verify_ssl {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = cacert {
            let file = File::open(path).map_err(|e| {
                IbkrWsError::Transport(format!("cannot read cacert {}: {e}", path.display()))
            })?;
            for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
                let cert = cert.map_err(|e| {
                    IbkrWsError::Transport(format!("cannot parse cacert {}: {e}", path.display()))
                })?;
                roots.add(cert).map_err(|e| {
                    IbkrWsError::Transport(format!("cannot add cacert {}: {e}", path.display()))
                })?;
            }
        }

        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        let mut config = builder
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification::new()));
        config
    };

    Ok(Connector::Rustls(Arc::new(config)))
}

/// Accepts any server certificate. Used only for the local gateway's
/// self-signed certificate when no CA bundle is configured.
#[derive(Debug)]
struct NoCertificateVerification(CryptoProvider);

impl NoCertificateVerification {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
