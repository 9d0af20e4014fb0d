use anyhow::{Result, anyhow};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

/// A freshly generated leaf key pair and the CSR that goes with it.
pub struct CsrBundle {
    pub csr_pem: String,
    pub private_key_pem: String,
}

/// Generates a per-order leaf key and a CSR with `domain` as both the
/// subject common name and the sole SAN entry.
pub fn generate_for_domain(domain: &str) -> Result<CsrBundle> {
    let key = KeyPair::generate().map_err(|e| anyhow!("failed to generate leaf key: {e}"))?;

    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| anyhow!("invalid subject name {domain}: {e}"))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key)
        .map_err(|e| anyhow!("failed to build CSR for {domain}: {e}"))?;

    Ok(CsrBundle {
        csr_pem: csr.pem().map_err(|e| anyhow!("failed to encode CSR: {e}"))?,
        private_key_pem: key.serialize_pem(),
    })
}
