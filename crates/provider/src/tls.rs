//! Certificate for the plugin's mTLS handshake
//!
//! Terraform passes its client certificate in `PLUGIN_CLIENT_CERT`; the
//! provider answers with a fresh self-signed server certificate announced
//! on stdout.

use anyhow::Result;
use base64::Engine;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};

/// Server identity generated at startup
pub struct ServerCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    cert_der: Vec<u8>,
}

impl ServerCertificate {
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::new(vec!["localhost".to_string()])?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::KeyCertSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "HashiCorp");
        dn.push(DnType::CommonName, "localhost");
        params.distinguished_name = dn;

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().to_vec(),
        })
    }

    /// DER certificate as go-plugin expects it in the handshake line:
    /// standard base64 without padding.
    pub fn handshake_encoding(&self) -> String {
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(&self.cert_der)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate() {
        let cert = ServerCertificate::generate().unwrap();
        assert!(cert.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
        let encoded = cert.handshake_encoding();
        assert!(!encoded.ends_with('='));
        let decoded = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(&encoded)
            .unwrap();
        assert_eq!(decoded, cert.cert_der);
    }
}
