//! SIP digest authentication (RFC 2617 subset used by §4.6): MD5 only,
//! `qop` not sent, `algorithm=MD5` echoed back.

/// A `WWW-Authenticate`/`Proxy-Authenticate` challenge parsed out of a
/// 401/407 response.
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
}

/// Parse `realm` and `nonce` out of a `Digest ...` challenge header value.
/// Returns `None` if either is missing.
pub fn parse_challenge(header_value: &str) -> Option<DigestChallenge> {
    let mut realm = None;
    let mut nonce = None;

    for field in header_value.trim_start_matches("Digest").split(',') {
        let field = field.trim();
        if let Some(v) = field.strip_prefix("realm=") {
            realm = Some(v.trim_matches('"').to_string());
        } else if let Some(v) = field.strip_prefix("nonce=") {
            nonce = Some(v.trim_matches('"').to_string());
        }
    }

    Some(DigestChallenge {
        realm: realm?,
        nonce: nonce?,
    })
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Compute the `Authorization` header's `response` field:
/// `md5(HA1:nonce:HA2)` where `HA1 = md5(user:realm:password)` and
/// `HA2 = md5(method:uri)`.
pub fn compute_response(username: &str, realm: &str, password: &str, nonce: &str, method: &str, uri: &str) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

/// Build the full `Authorization` header value for a digest-challenged
/// request.
pub fn build_authorization_header(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let response = compute_response(username, realm, password, nonce, method, uri);
    format!(
        "Digest username=\"{username}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\", algorithm=MD5"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_realm_and_nonce_from_challenge() {
        let challenge = parse_challenge(r#"Digest realm="asterisk", nonce="abc123", algorithm=MD5"#).unwrap();
        assert_eq!(challenge.realm, "asterisk");
        assert_eq!(challenge.nonce, "abc123");
    }

    #[test]
    fn returns_none_without_nonce() {
        assert!(parse_challenge(r#"Digest realm="asterisk""#).is_none());
    }

    #[test]
    fn response_matches_rfc2617_construction() {
        let ha1 = md5_hex("alice:asterisk:secret");
        let ha2 = md5_hex("REGISTER:sip:example.com");
        let expected = md5_hex(&format!("{ha1}:n0nce:{ha2}"));
        let actual = compute_response("alice", "asterisk", "secret", "n0nce", "REGISTER", "sip:example.com");
        assert_eq!(actual, expected);
    }

    #[test]
    fn same_inputs_produce_same_response() {
        let a = compute_response("bob", "r", "p", "n", "INVITE", "sip:x");
        let b = compute_response("bob", "r", "p", "n", "INVITE", "sip:x");
        assert_eq!(a, b);
    }
}
