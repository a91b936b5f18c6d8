//! Presenting credentials to the server.
//!
//! The session answers whatever `AuthenticationRequest` the server sends:
//! - cleartext password (code 3), always available
//! - MD5 (code 5), feature `md5`
//! - SCRAM-SHA-256 (code 10), feature `scram`, on by default
//!
//! GSSAPI, SSPI and certificate-only auth are not supported.

#[cfg(feature = "scram")]
pub mod scram;

#[cfg(feature = "scram")]
pub use scram::{ScramFinal, ScramSession};

pub const AUTH_OK: i32 = 0;
pub const AUTH_CLEARTEXT: i32 = 3;
pub const AUTH_MD5: i32 = 5;
pub const AUTH_SASL: i32 = 10;
pub const AUTH_SASL_CONTINUE: i32 = 11;
pub const AUTH_SASL_FINAL: i32 = 12;

/// NUL-terminated password message body.
pub fn cleartext_password(password: &str) -> Vec<u8> {
    let mut p = Vec::with_capacity(password.len() + 1);
    p.extend_from_slice(password.as_bytes());
    p.push(0);
    p
}

/// `md5` + hex(md5(hex(md5(password || user)) || salt)), NUL-terminated.
#[cfg(feature = "md5")]
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> Vec<u8> {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut outer = Vec::with_capacity(inner.len() + 4);
    outer.extend_from_slice(inner.as_bytes());
    outer.extend_from_slice(salt);
    cleartext_password(&format!("md5{:x}", md5::compute(&outer)))
}

/// Mechanism names out of an AuthenticationSASL body (cstring list).
pub fn sasl_mechanisms(body: &[u8]) -> Vec<String> {
    body.split(|&b| b == 0)
        .take_while(|m| !m.is_empty())
        .map(|m| String::from_utf8_lossy(m).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanisms_list() {
        let body = b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0";
        assert_eq!(
            sasl_mechanisms(body),
            vec!["SCRAM-SHA-256-PLUS".to_string(), "SCRAM-SHA-256".to_string()]
        );
        assert!(sasl_mechanisms(b"\0").is_empty());
    }

    #[test]
    fn cleartext_is_nul_terminated() {
        assert_eq!(cleartext_password("pw"), b"pw\0");
    }

    #[cfg(feature = "md5")]
    #[test]
    fn md5_shape() {
        let p = md5_password("postgres", "secret", &[1, 2, 3, 4]);
        assert_eq!(p.len(), 3 + 32 + 1);
        assert!(p.starts_with(b"md5"));
        assert_eq!(*p.last().unwrap(), 0);
    }
}
