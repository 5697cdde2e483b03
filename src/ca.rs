//! Certificate authority glue — mints per-hostname leaf certificates so the
//! proxy can terminate a client-initiated TLS handshake on the fly.
//!
//! The distilled proxy design treats `sign_host(ca, [name]) -> leaf_cert` as
//! an externally-supplied collaborator; this module is that collaborator
//! made concrete with `rcgen`, so the crate is runnable and its TLS-sniff
//! path has something real to call.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::info;

use crate::error::{ProxyError, ProxyResult};

/// A signed leaf certificate and its private key, ready to hand to a
/// `rustls::ServerConfig`.
pub struct CertifiedLeaf {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

/// A self-signed root certificate authority used to sign per-hostname leaf
/// certificates for intercepted TLS connections.
pub struct CaCertificate {
    key: KeyPair,
    cert: rcgen::Certificate,
}

impl CaCertificate {
    /// Generate a fresh self-signed CA. Intended for development/test use
    /// and for deployments that provision their own root out of band —
    /// loading an operator-supplied root is the caller's responsibility
    /// (out of scope for this crate, per the proxy's own non-goals).
    pub fn generate() -> ProxyResult<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "WarpGrid");
        dn.push(DnType::CommonName, "WarpGrid Proxy CA");
        params.distinguished_name = dn;

        // Long-lived: this CA only ever signs short-lived leaves.
        params.not_after = rcgen::date_time_ymd(2046, 1, 1);

        let key = KeyPair::generate()
            .map_err(|e| ProxyError::CertificateSigningFailed(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| ProxyError::CertificateSigningFailed(e.to_string()))?;

        info!("generated proxy CA certificate");

        Ok(Self { key, cert })
    }

    /// PEM encoding of the CA's own certificate, for distribution to clients
    /// that need to trust intercepted connections.
    pub fn root_cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// Mint a leaf certificate covering `names`, signed by this CA.
    ///
    /// This is the crate's concrete stand-in for the distilled spec's
    /// `sign_host(ca, [name]) -> leaf_cert`.
    pub fn sign_host(&self, names: &[String]) -> ProxyResult<CertifiedLeaf> {
        if names.is_empty() {
            return Err(ProxyError::CertificateSigningFailed(
                "no hostnames supplied".to_string(),
            ));
        }

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, names[0].as_str());
        params.distinguished_name = dn;

        for name in names {
            if let Ok(ip) = name.parse::<std::net::IpAddr>() {
                params.subject_alt_names.push(SanType::IpAddress(ip));
            } else {
                let dns_name = name
                    .clone()
                    .try_into()
                    .map_err(|_| ProxyError::CertificateSigningFailed(format!("invalid hostname: {name}")))?;
                params.subject_alt_names.push(SanType::DnsName(dns_name));
            }
        }

        // Short-lived: leaves are re-minted on every intercepted handshake.
        params.not_after = rcgen::date_time_ymd(2030, 1, 1);

        let leaf_key = KeyPair::generate()
            .map_err(|e| ProxyError::CertificateSigningFailed(e.to_string()))?;
        let leaf_cert = params
            .signed_by(&leaf_key, &self.cert, &self.key)
            .map_err(|e| ProxyError::CertificateSigningFailed(e.to_string()))?;

        info!(hosts = ?names, "signed leaf certificate");

        Ok(CertifiedLeaf {
            cert_der: CertificateDer::from(leaf_cert.der().to_vec()),
            key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        })
    }
}
