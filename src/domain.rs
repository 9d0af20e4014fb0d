use anyhow::{Result, anyhow};

/// Normalizes a caller-supplied domain name to its ASCII (punycode) form.
///
/// The result is what gets stored on the order and used for the challenge
/// fetch, so garbage has to be rejected here before it reaches the network.
/// An explicit `:port` suffix is preserved for targets not listening on 80.
pub fn normalize_domain(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    if trimmed.contains("://") || trimmed.contains('/') {
        return Err(anyhow!("domain must be a bare host name, not a URL"));
    }
    if trimmed.contains(char::is_whitespace) {
        return Err(anyhow!("domain cannot contain whitespace"));
    }
    if trimmed.starts_with('.') {
        return Err(anyhow!("domain cannot start with a dot"));
    }

    let (host, port) = match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            (host, Some(port))
        }
        _ => (trimmed, None),
    };

    let normalized_host = if host.parse::<std::net::IpAddr>().is_ok() {
        host.to_string()
    } else {
        idna::domain_to_ascii(host)
            .map_err(|err| anyhow!("invalid domain name: {err}"))?
            .to_lowercase()
    };
    Ok(match port {
        Some(port) => format!("{normalized_host}:{port}"),
        None => normalized_host,
    })
}

/// Minimal contact-address check; the CA performs its own verification.
pub fn validate_contact_email(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("contact email is required"));
    }
    let (local, host) = trimmed
        .split_once('@')
        .ok_or_else(|| anyhow!("contact email must contain '@'"))?;
    if local.is_empty() || host.is_empty() || host.contains('@') {
        return Err(anyhow!("invalid contact email: {trimmed}"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_domain_lowercases_and_strips() {
        assert_eq!(normalize_domain(" Example.COM. ").unwrap(), "example.com");
        assert_eq!(
            normalize_domain("sub.example.com").unwrap(),
            "sub.example.com"
        );
    }

    #[test]
    fn normalize_domain_preserves_explicit_port() {
        assert_eq!(
            normalize_domain("Example.com:8080").unwrap(),
            "example.com:8080"
        );
        assert_eq!(
            normalize_domain("127.0.0.1:9090").unwrap(),
            "127.0.0.1:9090"
        );
    }

    #[test]
    fn normalize_domain_punycodes_unicode() {
        assert_eq!(normalize_domain("bücher.de").unwrap(), "xn--bcher-kva.de");
    }

    #[test]
    fn normalize_domain_rejects_bad_input() {
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("   ").is_err());
        assert!(normalize_domain("http://example.com").is_err());
        assert!(normalize_domain("example.com/path").is_err());
        assert!(normalize_domain("bad domain.com").is_err());
        assert!(normalize_domain(".example.com").is_err());
    }

    #[test]
    fn validate_contact_email_accepts_plain_addresses() {
        assert_eq!(
            validate_contact_email("admin@example.com").unwrap(),
            "admin@example.com"
        );
    }

    #[test]
    fn validate_contact_email_rejects_malformed() {
        assert!(validate_contact_email("").is_err());
        assert!(validate_contact_email("not-an-email").is_err());
        assert!(validate_contact_email("@example.com").is_err());
        assert!(validate_contact_email("admin@").is_err());
        assert!(validate_contact_email("a@b@c").is_err());
    }
}
