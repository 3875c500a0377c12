/*
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Assembles terminator and dialer TLS settings from static files, ACME,
//! or a backend-TLS config. No single `g3proxy` file builds exactly this
//! shape — it splits terminator/dialer config across several
//! `g3-types::net::tls` stub types with no available source in the
//! retrieval pack — so this is written directly against `rustls`,
//! structured the way `config/server/sni_proxy/mod.rs` structures nested
//! config builders (one `build_*` function per config shape, `anyhow`
//! context on every fallible step).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::config::acme::AcmeConfig;
use crate::config::backend_tls::BackendTlsConfig;
use crate::config::tls::TlsConfig;
use crate::serve::acme::AcmeCertManager;
use crate::serve::error::{ServerError, ServerResult};

/// The terminator half of a built TLS setup: a `rustls::ServerConfig`
/// ready to be wrapped around accepted sockets, plus (for the ACME path)
/// the certificate manager whose background renewal loop needs starting
/// alongside the rest of the server.
pub enum Terminator {
    Static(Arc<rustls::ServerConfig>),
    Acme {
        config: Arc<rustls::ServerConfig>,
        manager: Arc<AcmeCertManager>,
    },
}

impl Terminator {
    pub fn rustls_config(&self) -> Arc<rustls::ServerConfig> {
        match self {
            Terminator::Static(cfg) => Arc::clone(cfg),
            Terminator::Acme { config, .. } => Arc::clone(config),
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        if let Terminator::Acme { manager, .. } = self {
            manager.start().await?;
        }
        Ok(())
    }
}

pub struct TlsConfigBuilder;

impl TlsConfigBuilder {
    /// Builds the terminator config for a `protocol: tls` listener, from
    /// `cfg.acme` if present, else `cfg.tls` — the two terminator sources.
    /// `Server::new` calls this at construction time so unreadable cert/key
    /// material fails fast as a `ConfigError`.
    pub fn build_terminator(
        tls: Option<&TlsConfig>,
        acme: Option<&AcmeConfig>,
    ) -> ServerResult<Terminator> {
        match acme {
            Some(acme_cfg) => {
                let manager = Arc::new(AcmeCertManager::new(
                    acme_cfg.hosts.clone(),
                    acme_cfg.cache_dir.clone(),
                    acme_cfg.directory_url.clone(),
                    acme_cfg.contact_email.clone(),
                ));
                let versions = protocol_versions(tls)?;
                let resolver = Arc::new(AcmeResolver {
                    manager: Arc::clone(&manager),
                });
                let mut config = rustls::ServerConfig::builder_with_provider(default_crypto_provider())
                    .with_protocol_versions(&versions)
                    .map_err(|e| ServerError::ConfigError(format!("invalid tls protocol versions: {e}")))?
                    .with_no_client_auth()
                    .with_cert_resolver(resolver);
                apply_session_ticket_policy(&mut config, tls);
                config.alpn_protocols.push(b"acme-tls/1".to_vec());
                Ok(Terminator::Acme {
                    config: Arc::new(config),
                    manager,
                })
            }
            None => {
                let tls =
                    tls.ok_or_else(|| ServerError::ConfigError("tls protocol requires tls or acme config".into()))?;
                let certs = load_certs(&tls.cert_path)?;
                let key = load_key(&tls.key_path)?;
                let versions = protocol_versions(Some(tls))?;
                let mut config = rustls::ServerConfig::builder_with_provider(default_crypto_provider())
                    .with_protocol_versions(&versions)
                    .map_err(|e| ServerError::ConfigError(format!("invalid tls protocol versions: {e}")))?
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .map_err(|e| ServerError::ConfigError(format!("invalid cert/key pair: {e}")))?;
                apply_session_ticket_policy(&mut config, Some(tls));
                Ok(Terminator::Static(Arc::new(config)))
            }
        }
    }

    /// Builds the dialer config used to TLS-dial backends when
    /// `backends_tls` is configured.
    pub fn build_dialer(cfg: &BackendTlsConfig) -> ServerResult<Arc<rustls::ClientConfig>> {
        let provider = default_crypto_provider();

        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ServerError::ConfigError(format!("invalid tls protocol versions: {e}")))?;

        if cfg.insecure_skip_verify {
            let client_cfg = builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier { provider }))
                .with_no_client_auth();
            return Ok(Arc::new(client_cfg));
        }

        let mut roots = rustls::RootCertStore::empty();
        roots.add_parsable_certificates(rustls_native_roots());

        if let Some(ca_path) = &cfg.root_ca_cert_path {
            let certs = load_root_ca_certs(ca_path)?;
            if certs.is_empty() {
                log::warn!(
                    "root CA file {} contained no usable certificates, proceeding without an added root",
                    ca_path.display()
                );
            } else {
                let (added, ignored) = roots.add_parsable_certificates(certs);
                if ignored > 0 {
                    log::warn!(
                        "root CA file {} contained {ignored} unparseable certificate(s), proceeding with {added} usable one(s)",
                        ca_path.display()
                    );
                }
            }
        }

        let client_cfg = builder
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(client_cfg))
    }
}

/// The process may not have installed a default `CryptoProvider` (this
/// crate's `rustls` feature set has no `install_default` call anywhere),
/// so every `rustls` config builder here takes an explicit provider
/// instead of relying on `builder_with_protocol_versions`/
/// `with_safe_default_protocol_versions`, which both panic without one.
fn default_crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// `webpki-roots`/`rustls-native-certs` aren't in this crate's dependency
/// set; backend dialing with default verification relies solely on
/// `root_ca_cert_path` when the backend doesn't use a publicly trusted
/// CA. An empty built-in set here is intentional, not an oversight.
fn rustls_native_roots() -> Vec<CertificateDer<'static>> {
    Vec::new()
}

fn protocol_versions(
    tls: Option<&TlsConfig>,
) -> ServerResult<Vec<&'static rustls::SupportedProtocolVersion>> {
    let (min, max) = match tls {
        Some(tls) => (tls.min_version.as_deref(), tls.max_version.as_deref()),
        None => (None, None),
    };
    let mut versions = Vec::new();
    let allow_12 = matches!(min, None | Some("TLSv1.2") | Some("TLS1.2"))
        && matches!(max, None | Some("TLSv1.3") | Some("TLS1.3") | Some("TLSv1.2") | Some("TLS1.2"));
    let allow_13 = matches!(min, None | Some("TLSv1.2") | Some("TLS1.2") | Some("TLSv1.3") | Some("TLS1.3"))
        && matches!(max, None | Some("TLSv1.3") | Some("TLS1.3"));
    if allow_12 {
        versions.push(&rustls::version::TLS12);
    }
    if allow_13 {
        versions.push(&rustls::version::TLS13);
    }
    if versions.is_empty() {
        return Err(ServerError::ConfigError(format!(
            "no usable tls protocol version range for min={min:?} max={max:?}"
        )));
    }
    Ok(versions)
}

/// `rustls` always negotiates cipher suites in the server's listed order
/// (there is no OpenSSL-style `prefer_server_ciphers` toggle to set), so
/// `prefer_server_ciphers` is accepted for config compatibility but has
/// no additional effect here.
fn apply_session_ticket_policy(config: &mut rustls::ServerConfig, tls: Option<&TlsConfig>) {
    let session_tickets = tls.map(|t| t.session_tickets).unwrap_or(true);
    if !session_tickets {
        config.send_tls13_tickets = 0;
        config.session_storage = Arc::new(rustls::server::NoServerSessionStorage {});
    }
}

fn load_certs(path: &Path) -> ServerResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ServerError::ConfigError(format!("failed to open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| {
        ServerError::ConfigError(format!("failed to parse certificates in {}: {e}", path.display()))
    })?;
    if certs.is_empty() {
        return Err(ServerError::ConfigError(format!(
            "{} contains no certificates",
            path.display()
        )));
    }
    Ok(certs)
}

/// Like `load_certs`, but for the optional `backends_tls.root_ca_cert_path`:
/// a missing file still fails construction, but a present file with
/// unparseable or zero certificates only warns and yields an empty root
/// set — the caller falls back to the built-in roots.
fn load_root_ca_certs(path: &Path) -> ServerResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ServerError::ConfigError(format!("failed to open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let mut certs = Vec::new();
    for entry in rustls_pemfile::certs(&mut reader) {
        match entry {
            Ok(cert) => certs.push(cert),
            Err(e) => log::warn!("root CA file {}: skipping unparseable entry: {e}", path.display()),
        }
    }
    Ok(certs)
}

fn load_key(path: &Path) -> ServerResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| ServerError::ConfigError(format!("failed to open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::ConfigError(format!("failed to parse private key in {}: {e}", path.display())))?
        .ok_or_else(|| ServerError::ConfigError(format!("{} contains no private key", path.display())))
}

/// Resolves server certificates from the ACME manager's cache by SNI
/// hostname, answering `acme-tls/1` ALPN challenge requests with the
/// in-flight self-signed challenge certificate instead of the real one.
struct AcmeResolver {
    manager: Arc<AcmeCertManager>,
}

impl ResolvesServerCert for AcmeResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name()?;
        let is_acme_challenge = client_hello
            .alpn()
            .map(|mut protos| protos.any(|p| p == b"acme-tls/1"))
            .unwrap_or(false);
        if is_acme_challenge {
            self.manager.challenge_cert_for(host)
        } else {
            self.manager.cert_for(host)
        }
    }
}

/// Accepts any backend certificate (`insecure_skip_verify`). Signature
/// checks still run against the negotiated scheme so handshakes with a
/// tampered signature still fail — only chain-of-trust verification is
/// skipped.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unreadable_cert_file() {
        let tls = TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
            ciphers: None,
            min_version: None,
            max_version: None,
            prefer_server_ciphers: false,
            session_tickets: true,
        };
        let err = TlsConfigBuilder::build_terminator(Some(&tls), None).unwrap_err();
        assert!(matches!(err, ServerError::ConfigError(_)));
    }

    fn unique_temp_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "relaygate-tls-builder-test-{label}-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ))
    }

    /// A present but garbage root CA file must only warn and leave the
    /// dialer usable with no added root (spec §4.8), never fail
    /// construction — only a *missing* file should do that.
    #[test]
    fn unparseable_root_ca_file_warns_and_builds_dialer() {
        let path = unique_temp_path("garbage-ca");
        std::fs::write(&path, b"this is not a PEM certificate\n").unwrap();

        let cfg = BackendTlsConfig {
            root_ca_cert_path: Some(path.clone()),
            ..BackendTlsConfig::default()
        };
        let result = TlsConfigBuilder::build_dialer(&cfg);
        let _ = std::fs::remove_file(&path);
        assert!(result.is_ok());
    }

    /// A missing root CA file must fail construction rather than silently
    /// proceeding without it.
    #[test]
    fn missing_root_ca_file_fails_dialer_construction() {
        let cfg = BackendTlsConfig {
            root_ca_cert_path: Some(unique_temp_path("does-not-exist")),
            ..BackendTlsConfig::default()
        };
        let err = TlsConfigBuilder::build_dialer(&cfg).unwrap_err();
        assert!(matches!(err, ServerError::ConfigError(_)));
    }

    /// `build_dialer` must not rely on a process-installed default
    /// `CryptoProvider` (this crate's `rustls` feature set never installs
    /// one) — it builds successfully with no root CA configured at all.
    #[test]
    fn build_dialer_without_root_ca_does_not_need_installed_provider() {
        let cfg = BackendTlsConfig::default();
        assert!(TlsConfigBuilder::build_dialer(&cfg).is_ok());
    }

    #[test]
    fn protocol_version_range_rejects_inverted_bounds() {
        let tls = TlsConfig {
            cert_path: "/dev/null".into(),
            key_path: "/dev/null".into(),
            ciphers: None,
            min_version: Some("TLSv1.3".into()),
            max_version: Some("TLSv1.2".into()),
            prefer_server_ciphers: false,
            session_tickets: true,
        };
        assert!(protocol_versions(Some(&tls)).is_err());
    }
}
