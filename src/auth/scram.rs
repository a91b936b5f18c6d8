//! SCRAM-SHA-256 (RFC 5802 / RFC 7677) as PostgreSQL uses it.
//!
//! The exchange is three messages. [`ScramSession`] produces the first,
//! consumes the server's challenge and yields a [`ScramFinal`], which holds
//! the client proof to send and the server signature to expect back.
//!
//! PostgreSQL takes the user name from the startup packet and ignores the
//! one inside SCRAM, so the client-first message carries an empty `n=`,
//! the same as libpq. Channel binding is not offered (`n,,`).

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{ReaderError, Result};

pub const MECHANISM: &str = "SCRAM-SHA-256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct ScramSession {
    nonce: String,
    client_first_bare: String,
}

/// Second half of the exchange: what to send, and what the server must prove.
#[derive(Debug, Clone)]
pub struct ScramFinal {
    pub client_final: String,
    server_signature: Vec<u8>,
}

struct ServerFirst<'a> {
    nonce: &'a str,
    salt: Vec<u8>,
    iterations: u32,
}

impl ScramSession {
    pub fn new() -> Self {
        let mut raw = [0u8; 18];
        rand::rng().fill_bytes(&mut raw);
        Self::with_nonce(&B64.encode(raw))
    }

    fn with_nonce(nonce: &str) -> Self {
        Self {
            nonce: nonce.to_string(),
            client_first_bare: format!("n=,r={nonce}"),
        }
    }

    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// SASLInitialResponse body: `mechanism\0` + int32 length + client-first.
    pub fn initial_response(&self) -> Vec<u8> {
        let first = self.client_first();
        let mut out = Vec::with_capacity(MECHANISM.len() + 5 + first.len());
        out.extend_from_slice(MECHANISM.as_bytes());
        out.push(0);
        out.extend_from_slice(&(first.len() as i32).to_be_bytes());
        out.extend_from_slice(first.as_bytes());
        out
    }

    /// Answer the server-first message.
    pub fn respond(&self, password: &str, server_first: &str) -> Result<ScramFinal> {
        let sf = parse_server_first(server_first)?;
        if !sf.nonce.starts_with(&self.nonce) || sf.nonce.len() == self.nonce.len() {
            return Err(ReaderError::Auth(
                "SCRAM nonce mismatch: server nonce does not extend ours".into(),
            ));
        }

        let without_proof = format!("c=biws,r={}", sf.nonce);
        let auth_message = format!(
            "{},{server_first},{without_proof}",
            self.client_first_bare
        );

        let salted = pbkdf2_sha256(password.as_bytes(), &sf.salt, sf.iterations);
        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac_sha256(&salted, b"Server Key");
        Ok(ScramFinal {
            client_final: format!("{without_proof},p={}", B64.encode(proof)),
            server_signature: hmac_sha256(&server_key, auth_message.as_bytes()),
        })
    }
}

impl Default for ScramSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ScramFinal {
    /// Check the server-final message; this is what authenticates the server.
    pub fn verify(&self, server_final: &str) -> Result<()> {
        let attr = |key: &str| {
            server_final
                .split(',')
                .find_map(|p| p.strip_prefix(key))
                .map(str::trim)
        };
        if let Some(e) = attr("e=") {
            return Err(ReaderError::Auth(format!("SCRAM server error: {e}")));
        }
        let v = attr("v=")
            .ok_or_else(|| ReaderError::Auth("SCRAM server-final missing signature".into()))?;
        let got = B64
            .decode(v)
            .map_err(|e| ReaderError::Auth(format!("SCRAM server signature base64: {e}")))?;
        if !constant_time_eq(&got, &self.server_signature) {
            return Err(ReaderError::Auth("SCRAM server signature mismatch".into()));
        }
        Ok(())
    }
}

fn parse_server_first(msg: &str) -> Result<ServerFirst<'_>> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;
    for part in msg.split(',') {
        if let Some(v) = part.strip_prefix("r=") {
            nonce = Some(v);
        } else if let Some(v) = part.strip_prefix("s=") {
            salt = Some(v);
        } else if let Some(v) = part.strip_prefix("i=") {
            iterations = v.parse::<u32>().ok().filter(|&i| i > 0);
        }
    }

    let missing = |what: &str| ReaderError::Auth(format!("SCRAM server-first missing {what}"));
    let salt = B64
        .decode(salt.ok_or_else(|| missing("salt"))?)
        .map_err(|e| ReaderError::Auth(format!("SCRAM salt base64: {e}")))?;
    Ok(ServerFirst {
        nonce: nonce.ok_or_else(|| missing("nonce"))?,
        salt,
        iterations: iterations.ok_or_else(|| missing("iteration count"))?,
    })
}

/// RFC 5802 `Hi()`: PBKDF2 with HMAC-SHA-256 and a single output block.
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac_sha256(password, &block);
    let mut acc = u.clone();
    for _ in 1..iterations {
        u = hmac_sha256(password, &u);
        acc.iter_mut().zip(&u).for_each(|(a, b)| *a ^= b);
    }
    acc
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_first_has_gs2_header_and_nonce() {
        let s = ScramSession::with_nonce("abc");
        assert_eq!(s.client_first(), "n,,n=,r=abc");

        let init = s.initial_response();
        assert!(init.starts_with(b"SCRAM-SHA-256\0"));
        let len_at = MECHANISM.len() + 1;
        let len = i32::from_be_bytes(init[len_at..len_at + 4].try_into().unwrap());
        assert_eq!(len as usize, "n,,n=,r=abc".len());
    }

    #[test]
    fn random_nonces_differ() {
        assert_ne!(ScramSession::new().nonce, ScramSession::new().nonce);
    }

    #[test]
    fn full_exchange_verifies() {
        let s = ScramSession::with_nonce("fyko+d2lbbFgONRv9qkxdawL");
        let server_first = "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        let fin = s.respond("pencil", server_first).unwrap();
        assert!(fin.client_final.starts_with("c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfc"));
        assert!(fin.client_final.contains(",p="));

        let server_final = format!("v={}", B64.encode(&fin.server_signature));
        fin.verify(&server_final).unwrap();
    }

    #[test]
    fn wrong_server_signature_rejected() {
        let s = ScramSession::with_nonce("n1");
        let fin = s.respond("pw", "r=n1srv,s=c2FsdA==,i=2").unwrap();
        let err = fin
            .verify("v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert!(err.to_string().contains("mismatch"));
        assert!(fin.verify("e=invalid-proof").unwrap_err().to_string().contains("invalid-proof"));
        assert!(fin.verify("").unwrap_err().to_string().contains("missing signature"));
    }

    #[test]
    fn server_nonce_must_extend_client_nonce() {
        let s = ScramSession::with_nonce("client");
        assert!(s.respond("pw", "r=other,s=c2FsdA==,i=4096").is_err());
        assert!(s.respond("pw", "r=client,s=c2FsdA==,i=4096").is_err());
    }

    #[test]
    fn server_first_fields_required() {
        let s = ScramSession::with_nonce("c");
        let err = s.respond("pw", "r=cX,i=4096").unwrap_err();
        assert!(err.to_string().contains("salt"));
        let err = s.respond("pw", "r=cX,s=c2FsdA==,i=zero").unwrap_err();
        assert!(err.to_string().contains("iteration"));
        let err = s.respond("pw", "r=cX,s=!!!,i=1").unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn pbkdf2_depends_on_iterations() {
        let salt = B64.decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
        let salted = pbkdf2_sha256(b"pencil", &salt, 4096);
        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        assert_eq!(salted.len(), 32);
        assert_eq!(stored_key.len(), 32);
        assert_ne!(pbkdf2_sha256(b"pencil", &salt, 1), salted);
    }

    #[test]
    fn constant_time_eq_lengths() {
        assert!(constant_time_eq(&[1, 2], &[1, 2]));
        assert!(!constant_time_eq(&[1, 2], &[1, 3]));
        assert!(!constant_time_eq(&[1], &[1, 2]));
    }
}
