//! Proxy authentication credentials
//!
//! Builds the `Proxy-Authorization` value answering a `Proxy-Authenticate` challenge,
//! with the `Basic` scheme or the `Digest` scheme using MD5.
//!
//! refer: https://www.rfc-editor.org/rfc/rfc7617 and https://www.rfc-editor.org/rfc/rfc7616

use std::fmt::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use tracing::trace;

use crate::protocol::ProxyError;

const CLIENT_NONCE_BYTES: usize = 4;

/// `Basic` credentials, `base64(user:password)`.
pub fn basic_authorization(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
}

impl DigestAlgorithm {
    fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
        }
    }
}

/// A parsed `Digest` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: Option<String>,
    pub nonce: String,
    pub opaque: Option<String>,
    /// `true` when the server offered `qop=auth`
    pub qop_auth: bool,
    /// `None` when the server did not name an algorithm
    pub algorithm: Option<DigestAlgorithm>,
    pub stale: bool,
}

impl DigestChallenge {
    /// Parses the parameters that follow the `Digest` scheme token.
    pub fn parse(params: &str) -> Result<Self, ProxyError> {
        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;
        let mut algorithm = None;
        let mut stale = false;

        for (key, value) in Params::new(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                "qop" => {
                    if value.is_empty() {
                        continue;
                    }
                    if !value.split(',').any(|option| option.trim().eq_ignore_ascii_case("auth")) {
                        return Err(ProxyError::UnsupportedQop { qop: value });
                    }
                    qop_auth = true;
                }
                "algorithm" => {
                    algorithm = Some(match value.to_ascii_lowercase().as_str() {
                        "md5" => DigestAlgorithm::Md5,
                        "md5-sess" => DigestAlgorithm::Md5Sess,
                        _ => return Err(ProxyError::invalid_challenge(format!("unsupported digest algorithm {value}"))),
                    });
                }
                _ => trace!(key, "ignoring digest challenge parameter"),
            }
        }

        let nonce = nonce.ok_or_else(|| ProxyError::invalid_challenge("digest challenge without nonce"))?;
        Ok(Self { realm, nonce, opaque, qop_auth, algorithm, stale })
    }
}

/// Answers one digest challenge, counting the requests made with its nonce.
#[derive(Debug)]
pub struct DigestAuthenticator {
    challenge: DigestChallenge,
    nonce_count: u32,
}

impl DigestAuthenticator {
    pub fn new(challenge: DigestChallenge) -> Self {
        Self { challenge, nonce_count: 0 }
    }

    pub fn authorization(&mut self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let mut client_nonce = [0_u8; CLIENT_NONCE_BYTES];
        rand::rng().fill_bytes(&mut client_nonce);
        self.authorization_with_cnonce(username, password, method, uri, &hex(&client_nonce))
    }

    fn authorization_with_cnonce(&mut self, username: &str, password: &str, method: &str, uri: &str, cnonce: &str) -> String {
        let challenge = &self.challenge;
        let realm = challenge.realm.as_deref().unwrap_or("");

        let mut ha1 = md5_hex(&[username, realm, password]);
        if challenge.algorithm == Some(DigestAlgorithm::Md5Sess) {
            ha1 = md5_hex(&[&ha1, &challenge.nonce, cnonce]);
        }
        let ha2 = md5_hex(&[method, uri]);

        let mut header = String::with_capacity(256);
        header.push_str("Digest ");
        append(&mut header, "username", username, true);
        if let Some(realm) = &challenge.realm {
            append(&mut header, "realm", realm, true);
        }
        append(&mut header, "nonce", &challenge.nonce, true);
        if let Some(opaque) = &challenge.opaque {
            append(&mut header, "opaque", opaque, true);
        }
        if let Some(algorithm) = challenge.algorithm {
            append(&mut header, "algorithm", algorithm.as_str(), false);
        }
        if challenge.qop_auth {
            append(&mut header, "qop", "auth", false);
        }
        append(&mut header, "uri", uri, true);

        let response = if challenge.qop_auth {
            self.nonce_count += 1;
            let nc = format!("{:08x}", self.nonce_count);
            append(&mut header, "cnonce", cnonce, true);
            append(&mut header, "nc", &nc, false);
            md5_hex(&[&ha1, &self.challenge.nonce, &nc, cnonce, "auth", &ha2])
        } else {
            md5_hex(&[&ha1, &challenge.nonce, &ha2])
        };
        append(&mut header, "response", &response, true);
        header
    }
}

fn append(header: &mut String, key: &str, value: &str, quoted: bool) {
    if !header.ends_with(' ') {
        header.push_str(", ");
    }
    if quoted {
        let _ = write!(header, "{key}=\"{value}\"");
    } else {
        let _ = write!(header, "{key}={value}");
    }
}

fn md5_hex(tokens: &[&str]) -> String {
    let mut context = md5::Context::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            context.consume(b":");
        }
        context.consume(token.as_bytes());
    }
    format!("{:x}", context.compute())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Iterates `key=value` and `key="quoted, value"` pairs separated by commas.
struct Params<'a> {
    rest: &'a str,
}

impl<'a> Params<'a> {
    fn new(params: &'a str) -> Self {
        Self { rest: params }
    }
}

impl Iterator for Params<'_> {
    type Item = (String, String);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        let eq = rest.find('=')?;
        let key = rest[..eq].trim().to_owned();
        let after = rest[eq + 1..].trim_start();

        if let Some(quoted) = after.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut end = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        end = i + 1;
                        break;
                    }
                    c => value.push(c),
                }
            }
            self.rest = &quoted[end..];
            Some((key, value))
        } else {
            let end = after.find(',').unwrap_or(after.len());
            self.rest = &after[end..];
            Some((key, after[..end].trim().to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credentials() {
        assert_eq!(basic_authorization("Aladdin", "open sesame"), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn parse_challenge() {
        let challenge =
            DigestChallenge::parse(r#"realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#)
                .unwrap();
        assert_eq!(challenge.realm.as_deref(), Some("testrealm@host.com"));
        assert_eq!(challenge.nonce, "dcd98b7102dd2f0e8b11d0f600bfb0c093");
        assert_eq!(challenge.opaque.as_deref(), Some("5ccc069c403ebaf9f0171e9517f40e41"));
        assert!(challenge.qop_auth);
        assert_eq!(challenge.algorithm, None);
    }

    #[test]
    fn unsupported_qop() {
        let result = DigestChallenge::parse(r#"realm="r", nonce="n", qop="auth-int""#);
        assert!(matches!(result, Err(ProxyError::UnsupportedQop { qop }) if qop == "auth-int"));
    }

    #[test]
    fn missing_nonce() {
        assert!(matches!(DigestChallenge::parse(r#"realm="r""#), Err(ProxyError::InvalidChallenge { .. })));
    }

    #[test]
    fn digest_response_with_qop() {
        // the worked example of RFC 2617 section 3.5
        let challenge =
            DigestChallenge::parse(r#"realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#)
                .unwrap();
        let mut authenticator = DigestAuthenticator::new(challenge);
        let header = authenticator.authorization_with_cnonce("Mufasa", "Circle Of Life", "GET", "/dir/index.html", "0a4f113b");

        assert!(header.starts_with(r#"Digest username="Mufasa", realm="testrealm@host.com""#));
        assert!(header.contains("qop=auth, "));
        assert!(header.contains("nc=00000001"));
        assert!(header.ends_with(r#"response="6629fae49393a05397450978507c4ef1""#));

        let header = authenticator.authorization_with_cnonce("Mufasa", "Circle Of Life", "GET", "/dir/index.html", "0a4f113b");
        assert!(header.contains("nc=00000002"));
    }

    #[test]
    fn digest_response_without_qop() {
        let challenge = DigestChallenge::parse(r#"realm="proxy", nonce="abc", algorithm=MD5"#).unwrap();
        let mut authenticator = DigestAuthenticator::new(challenge);
        let header = authenticator.authorization_with_cnonce("user", "pass", "CONNECT", "example.com:443", "unused");

        let ha1 = md5_hex(&["user", "proxy", "pass"]);
        let ha2 = md5_hex(&["CONNECT", "example.com:443"]);
        let expected = md5_hex(&[&ha1, "abc", &ha2]);
        assert!(header.contains("algorithm=MD5, "));
        assert!(!header.contains("cnonce"));
        assert!(header.ends_with(&format!("response=\"{expected}\"")));
    }
}
