//! Certificate generation for TLS interception
//!
//! The proxy owns a self-signed CA and mints short-lived leaf certificates
//! for intercepted hostnames on demand. All keys are EC P-256.

use crate::error::{Error, Result};
use base64::{engine::general_purpose, Engine as _};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    PKCS_ECDSA_P256_SHA256,
};
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// CA certificates are valid for ten years.
const CA_VALIDITY_DAYS: u32 = 3650;

/// Leaf certificates are valid for 825 days, the maximum lifetime current
/// clients accept for privately trusted certificates.
const LEAF_VALIDITY_DAYS: u32 = 825;

/// Backdating applied to leaf `notBefore` to absorb client clock skew.
const LEAF_NOT_BEFORE_SLACK: Duration = Duration::from_secs(60);

/// Subject fields for a generated CA certificate.
#[derive(Debug, Clone)]
pub struct CaSubject {
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub common_name: String,
}

impl Default for CaSubject {
    fn default() -> Self {
        Self {
            country: "FR".to_string(),
            state: "Ile-de-France".to_string(),
            locality: "Paris".to_string(),
            organization: "HTTPS Intercept Proxy".to_string(),
            common_name: "HTTPS Intercept Proxy CA".to_string(),
        }
    }
}

/// The SAN form a leaf certificate is bound to.
#[derive(Debug, Clone)]
pub(crate) enum LeafHost {
    Dns(String),
    Ip(IpAddr),
}

impl LeafHost {
    fn san(&self) -> SanType {
        match self {
            LeafHost::Dns(name) => SanType::DnsName(name.clone()),
            LeafHost::Ip(addr) => SanType::IpAddress(*addr),
        }
    }

    fn common_name(&self) -> String {
        match self {
            LeafHost::Dns(name) => name.clone(),
            LeafHost::Ip(addr) => addr.to_string(),
        }
    }
}

/// CA key and certificate. The rcgen certificate carries the signing key;
/// the DER is serialized exactly once so the bytes served in chains and
/// written to disk stay identical.
pub(crate) struct CaMaterial {
    pub cert: Certificate,
    pub cert_der: Vec<u8>,
    pub organization: String,
}

/// Leaf key and certificate, both DER-encoded, signed by the CA.
pub(crate) struct LeafMaterial {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

fn random_serial() -> SerialNumber {
    SerialNumber::from(rand::random::<u64>().to_be_bytes().to_vec())
}

/// Generate a fresh self-signed CA with the given subject.
pub(crate) fn generate_ca(subject: &CaSubject) -> Result<CaMaterial> {
    let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::default();
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.key_pair = Some(key_pair);
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, subject.country.as_str());
    dn.push(DnType::StateOrProvinceName, subject.state.as_str());
    dn.push(DnType::LocalityName, subject.locality.as_str());
    dn.push(DnType::OrganizationName, subject.organization.as_str());
    dn.push(DnType::CommonName, subject.common_name.as_str());
    params.distinguished_name = dn;

    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + CA_VALIDITY_DAYS * DAY).into();

    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let cert = Certificate::from_params(params)?;
    let cert_der = cert.serialize_der()?;
    Ok(CaMaterial {
        cert,
        cert_der,
        organization: subject.organization.clone(),
    })
}

/// Adopt an existing CA from PEM material. The key must be EC P-256 and the
/// certificate must carry `CA:TRUE`; the original certificate bytes are kept
/// for chain building.
pub(crate) fn load_ca(key_pem: &[u8], cert_pem: &[u8]) -> Result<CaMaterial> {
    let key_str = std::str::from_utf8(key_pem)
        .map_err(|_| Error::InvalidCa("CA key is not valid PEM".to_string()))?;
    let key_pair = KeyPair::from_pem(key_str)?;
    if !key_pair.is_compatible(&PKCS_ECDSA_P256_SHA256) {
        return Err(Error::InvalidCa("CA key must be EC P-256".to_string()));
    }

    let cert_der = rustls_pemfile::certs(&mut &cert_pem[..])
        .map_err(|err| Error::InvalidCa(format!("unreadable CA certificate: {err}")))?
        .into_iter()
        .next()
        .ok_or_else(|| Error::InvalidCa("no certificate found in CA PEM".to_string()))?;

    let cert_str = std::str::from_utf8(cert_pem)
        .map_err(|_| Error::InvalidCa("CA certificate is not valid PEM".to_string()))?;
    let params = CertificateParams::from_ca_cert_pem(cert_str, key_pair)?;
    if !matches!(params.is_ca, IsCa::Ca(_)) {
        return Err(Error::InvalidCa(
            "certificate is not a CA (missing CA:TRUE)".to_string(),
        ));
    }
    let organization = dn_value_string(params.distinguished_name.get(&DnType::OrganizationName))
        .unwrap_or_else(|| CaSubject::default().organization);

    let cert = Certificate::from_params(params)?;
    Ok(CaMaterial {
        cert,
        cert_der,
        organization,
    })
}

fn dn_value_string(value: Option<&DnValue>) -> Option<String> {
    match value {
        Some(DnValue::Utf8String(s)) | Some(DnValue::PrintableString(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Issue a leaf for `host`, signed by `ca`.
pub(crate) fn issue_leaf(ca: &CaMaterial, host: &LeafHost) -> Result<LeafMaterial> {
    let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::default();
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.key_pair = Some(key_pair);
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ca.organization.as_str());
    dn.push(DnType::CommonName, host.common_name());
    params.distinguished_name = dn;

    params.subject_alt_names = vec![host.san()];

    let now = SystemTime::now();
    params.not_before = (now - LEAF_NOT_BEFORE_SLACK).into();
    params.not_after = (now + LEAF_VALIDITY_DAYS * DAY).into();

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = Certificate::from_params(params)?;
    let cert_der = cert.serialize_der_with_signer(&ca.cert)?;
    let key_der = cert.serialize_private_key_der();
    Ok(LeafMaterial { cert_der, key_der })
}

/// Render DER bytes as a PEM block with 64-column base64 lines.
pub(crate) fn pem_encode(label: &str, der: &[u8]) -> String {
    let encoded = general_purpose::STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {label}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap_or(""));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {label}-----\n"));
    pem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ca_roundtrips_through_pem() {
        let ca = generate_ca(&CaSubject::default()).unwrap();
        let cert_pem = pem_encode("CERTIFICATE", &ca.cert_der);
        let key_pem = ca.cert.serialize_private_key_pem();

        let loaded = load_ca(key_pem.as_bytes(), cert_pem.as_bytes()).unwrap();
        assert_eq!(loaded.cert_der, ca.cert_der);
        assert_eq!(loaded.organization, "HTTPS Intercept Proxy");
    }

    #[test]
    fn load_rejects_garbage_material() {
        assert!(load_ca(b"not a key", b"not a cert").is_err());
    }

    #[test]
    fn load_rejects_non_ca_certificates() {
        let ca = generate_ca(&CaSubject::default()).unwrap();
        let leaf = issue_leaf(&ca, &LeafHost::Dns("example.test".to_string())).unwrap();
        let leaf_pem = pem_encode("CERTIFICATE", &leaf.cert_der);
        // A leaf's key paired with a leaf cert must be refused as CA material.
        let key_pem = ca.cert.serialize_private_key_pem();
        let result = load_ca(key_pem.as_bytes(), leaf_pem.as_bytes());
        assert!(matches!(result, Err(Error::InvalidCa(_))));
    }

    #[test]
    fn leaf_serials_are_unique() {
        let ca = generate_ca(&CaSubject::default()).unwrap();
        let a = issue_leaf(&ca, &LeafHost::Dns("a.test".to_string())).unwrap();
        let b = issue_leaf(&ca, &LeafHost::Dns("a.test".to_string())).unwrap();
        assert_ne!(a.cert_der, b.cert_der);
    }

    #[test]
    fn pem_encoding_wraps_lines() {
        let pem = pem_encode("CERTIFICATE", &[0u8; 100]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        assert!(pem.lines().all(|line| line.len() <= 64));
    }
}
