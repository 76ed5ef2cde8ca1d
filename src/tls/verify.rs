use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use std::sync::Arc;
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509Certificate};

/// Matches a hostname against a certificate name pattern.
///
/// Wildcard rules: only the left-most label may contain a wildcard, as a
/// bare `*`, a `*` suffix (`foo*`), or a `*` prefix (`*bar`). The wildcard
/// never matches a dot, so `*.example.com` matches `a.example.com` but not
/// `a.b.example.com`. All comparisons are case-insensitive.
pub(crate) fn match_name(host: &str, pattern: &str) -> bool {
    if host.is_empty() || pattern.is_empty() {
        return false;
    }
    if host.eq_ignore_ascii_case(pattern) {
        return true;
    }

    let mut host_labels = host.split('.');
    let mut pattern_labels = pattern.split('.');
    let host_first = host_labels.next().unwrap_or("");
    let pattern_first = pattern_labels.next().unwrap_or("");

    let host_rest: Vec<&str> = host_labels.collect();
    let pattern_rest: Vec<&str> = pattern_labels.collect();
    if host_rest.len() != pattern_rest.len() {
        return false;
    }
    if !host_rest
        .iter()
        .zip(&pattern_rest)
        .all(|(h, p)| h.eq_ignore_ascii_case(p))
    {
        return false;
    }

    let Some(star) = pattern_first.find('*') else {
        return host_first.eq_ignore_ascii_case(pattern_first);
    };
    let prefix = &pattern_first[..star];
    let suffix = &pattern_first[star + 1..];
    if suffix.contains('*') {
        return false;
    }
    if host_first.is_empty() || host_first.len() < prefix.len() + suffix.len() {
        return false;
    }
    host_first[..prefix.len()].eq_ignore_ascii_case(prefix)
        && host_first[host_first.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

/// Extracts the subject common name and the DNS subject alternative names.
pub(crate) fn certificate_names(cert: &CertificateDer<'_>) -> (Option<String>, Vec<String>) {
    let Ok((_, parsed)) = X509Certificate::from_der(cert.as_ref()) else {
        return (None, Vec::new());
    };
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    let sans = parsed
        .extensions()
        .iter()
        .find_map(|ext| match ext.parsed_extension() {
            ParsedExtension::SubjectAlternativeName(san) => Some(san),
            _ => None,
        })
        .map(|san| {
            san.general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    (cn, sans)
}

fn is_name_mismatch(err: &RustlsError) -> bool {
    matches!(
        err,
        RustlsError::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

fn dns_name(server_name: &ServerName<'_>) -> Option<String> {
    match server_name {
        ServerName::DnsName(dns) => Some(dns.as_ref().to_string()),
        _ => None,
    }
}

/// Accepts any certificate without validation.
///
/// Used for the no-verify peer mode; handshake signatures are still checked
/// so the engine state machine stays honest.
#[derive(Debug)]
pub(crate) struct NoVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl NoVerification {
    pub(crate) fn new(algorithms: WebPkiSupportedAlgorithms) -> Self {
        Self { algorithms }
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Full chain validation with the peer-name check disabled.
#[derive(Debug)]
pub(crate) struct IgnoreNameVerifier {
    inner: Arc<dyn ServerCertVerifier>,
}

impl IgnoreNameVerifier {
    pub(crate) fn new(inner: Arc<dyn ServerCertVerifier>) -> Self {
        Self { inner }
    }
}

impl ServerCertVerifier for IgnoreNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(err) if is_name_mismatch(&err) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Chain validation plus hostname matching against the common name *and*
/// the DNS subject alternative names, with the wildcard rules of
/// [`match_name`].
///
/// webpki refuses to fall back to the common name; the wrapper applies the
/// crate's own matcher when webpki rejects the certificate purely for its
/// name.
#[derive(Debug)]
pub(crate) struct HostnameVerifier {
    inner: Arc<dyn ServerCertVerifier>,
}

impl HostnameVerifier {
    pub(crate) fn new(inner: Arc<dyn ServerCertVerifier>) -> Self {
        Self { inner }
    }
}

impl ServerCertVerifier for HostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(err) if is_name_mismatch(&err) => {
                let Some(host) = dns_name(server_name) else {
                    return Err(err);
                };
                let (cn, sans) = certificate_names(end_entity);
                let matched = sans.iter().any(|san| match_name(&host, san))
                    || cn.map(|cn| match_name(&host, &cn)).unwrap_or(false);
                if matched {
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(err)
                }
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Chain validation plus an exact (case-insensitive) comparison of the
/// certificate common name against a fixed string, ignoring the connect
/// hostname entirely.
#[derive(Debug)]
pub(crate) struct FixedNameVerifier {
    inner: Arc<dyn ServerCertVerifier>,
    fixed_name: String,
}

impl FixedNameVerifier {
    pub(crate) fn new(inner: Arc<dyn ServerCertVerifier>, fixed_name: String) -> Self {
        Self { inner, fixed_name }
    }
}

impl ServerCertVerifier for FixedNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        // Chain validation comes from the inner verifier; a name mismatch
        // there is irrelevant because the name policy here is the fixed
        // string, not the connect hostname.
        if let Err(err) = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            if !is_name_mismatch(&err) {
                return Err(err);
            }
        }
        let (cn, _) = certificate_names(end_entity);
        match cn {
            Some(cn) if cn.eq_ignore_ascii_case(&self.fixed_name) => {
                Ok(ServerCertVerified::assertion())
            }
            _ => Err(RustlsError::InvalidCertificate(
                CertificateError::NotValidForName,
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::match_name;

    #[test]
    fn exact_names_match_case_insensitively() {
        assert!(match_name("example.com", "example.com"));
        assert!(match_name("Example.COM", "example.com"));
        assert!(!match_name("example.com", "example.org"));
        assert!(!match_name("", "example.com"));
        assert!(!match_name("example.com", ""));
    }

    #[test]
    fn wildcard_matches_leftmost_label_only() {
        assert!(match_name("a.example.com", "*.example.com"));
        assert!(match_name("abc.example.com", "*.example.com"));
        // The wildcard never matches a dot.
        assert!(!match_name("a.b.example.com", "*.example.com"));
        // Wildcards outside the first label are not wildcards.
        assert!(!match_name("a.x.com", "a.*.com"));
    }

    #[test]
    fn prefix_and_suffix_wildcards() {
        assert!(match_name("mail.example.com", "ma*.example.com"));
        assert!(match_name("mail.example.com", "*il.example.com"));
        assert!(match_name("mail.example.com", "m*l.example.com"));
        assert!(!match_name("web.example.com", "ma*.example.com"));
        // The concrete parts must fit within the label.
        assert!(!match_name("m.example.com", "ma*il.example.com"));
    }

    #[test]
    fn label_counts_must_agree() {
        assert!(!match_name("example.com", "*.example.com"));
        assert!(!match_name("a.b.example.com", "*.b.example.com.extra"));
        assert!(match_name("a.b.example.com", "*.b.example.com"));
    }
}
