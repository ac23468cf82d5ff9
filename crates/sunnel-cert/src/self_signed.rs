//! Self-signed certificate generation for development and testing
//!
//! Lets the listeners run TLS without any certificate files. Clients have to skip
//! verification or pin the generated certificate.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::{CertError, Certificate};

const VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Generate a certificate valid for localhost, 127.0.0.1 and ::1
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, CertError> {
    generate_self_signed_cert_with_domains(&["localhost", "127.0.0.1", "::1"])
}

/// Generate a certificate for the given names; IP literals become IP SANs
pub fn generate_self_signed_cert_with_domains(
    domains: &[&str],
) -> Result<SelfSignedCertificate, CertError> {
    let names: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
    let mut params =
        CertificateParams::new(names).map_err(|e| CertError::Generation(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Sunnel Development Certificate");
    params.distinguished_name = dn;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    params.not_before = time::OffsetDateTime::from_unix_timestamp(now.as_secs() as i64)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    params.not_after =
        time::OffsetDateTime::from_unix_timestamp((now + VALIDITY).as_secs() as i64)
            .map_err(|e| CertError::Generation(e.to_string()))?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: cert.der().clone(),
        key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub pem_cert: String,
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }

    pub fn into_certificate(self) -> Certificate {
        Certificate::new(vec![self.cert_der], self.key_der)
    }
}
