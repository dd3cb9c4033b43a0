//! TLS for the PostgreSQL target.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{info, warn};

use crate::error::{MigrateError, Result};

/// PostgreSQL `sslmode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    /// Encrypt without verifying the server certificate.
    #[default]
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn requires_tls(&self) -> bool {
        *self != SslMode::Disable
    }
}

impl FromStr for SslMode {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(MigrateError::Config(format!(
                "invalid ssl_mode '{}' (expected disable, require, verify-ca or verify-full)",
                other
            ))),
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SslMode::Disable => "disable",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        })
    }
}

/// Builds the rustls connector for a given [`SslMode`].
pub struct TlsBuilder {
    mode: SslMode,
    provider: Arc<CryptoProvider>,
}

impl TlsBuilder {
    pub fn new(mode: SslMode) -> Self {
        Self {
            mode,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Connector for deadpool-postgres, `None` when TLS is disabled.
    pub fn build(&self) -> Result<Option<MakeRustlsConnect>> {
        if !self.mode.requires_tls() {
            return Ok(None);
        }
        Ok(Some(MakeRustlsConnect::new(self.client_config()?)))
    }

    fn client_config(&self) -> Result<ClientConfig> {
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| MigrateError::Config(format!("TLS setup failed: {}", e)))?;

        let config = match self.mode {
            SslMode::Disable => {
                return Err(MigrateError::Config("TLS is disabled for this connection".into()))
            }
            SslMode::Require => {
                warn!("ssl_mode=require: the server certificate is not verified");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCert {
                        provider: self.provider.clone(),
                    }))
                    .with_no_client_auth()
            }
            SslMode::VerifyCa | SslMode::VerifyFull => {
                // rustls always checks the host name, so verify-ca behaves as verify-full.
                info!("ssl_mode={}: verifying server certificate", self.mode);
                let roots = RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                };
                builder.with_root_certificates(roots).with_no_client_auth()
            }
        };
        Ok(config)
    }
}

/// Accepts any server certificate. Signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_from_str() {
        assert_eq!("disable".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!("REQUIRE".parse::<SslMode>().unwrap(), SslMode::Require);
        assert_eq!("verify-ca".parse::<SslMode>().unwrap(), SslMode::VerifyCa);
        assert_eq!("verify-full".parse::<SslMode>().unwrap(), SslMode::VerifyFull);
        assert!("prefer".parse::<SslMode>().is_err());
    }

    #[test]
    fn test_ssl_mode_yaml_names() {
        let mode: SslMode = serde_yaml::from_str("verify-ca").unwrap();
        assert_eq!(mode, SslMode::VerifyCa);
        assert_eq!(SslMode::default(), SslMode::Require);
        assert_eq!(SslMode::Require.to_string(), "require");
    }

    #[test]
    fn test_disable_builds_no_connector() {
        assert!(TlsBuilder::new(SslMode::Disable).build().unwrap().is_none());
    }

    #[test]
    fn test_tls_modes_build_connector() {
        assert!(TlsBuilder::new(SslMode::Require).build().unwrap().is_some());
        assert!(TlsBuilder::new(SslMode::VerifyFull).build().unwrap().is_some());
    }
}
