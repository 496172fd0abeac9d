//! Authentication messages and password hashing.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::codec::MessageBuilder;

/// SASL mechanism implemented by [`ScramClient`].
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Write a PasswordMessage (cleartext or MD5 hashed password).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(password);
    msg.finish();
}

/// Compute the MD5 password response.
///
/// Format: "md5" + md5(md5(password + username) + salt)
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::Md5;

    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let inner = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}

/// Write a SASLInitialResponse message.
pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, initial_response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(mechanism);
    msg.write_i32(initial_response.len() as i32);
    msg.write_bytes(initial_response);
    msg.finish();
}

/// Write a SASLResponse message.
pub fn write_sasl_response(buf: &mut Vec<u8>, response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_bytes(response);
    msg.finish();
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| Error::Auth(format!("HMAC error: {e}")))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// SCRAM-SHA-256 client without channel binding.
pub struct ScramClient {
    nonce: String,
    password: String,
    /// (salted password, auth message) once the server-first-message is processed
    proof_state: Option<([u8; 32], String)>,
}

impl ScramClient {
    /// GS2 header for "client does not support channel binding".
    const GS2_HEADER: &'static str = "n,,";

    /// Create a new SCRAM client with a random nonce.
    pub fn new(password: &str) -> Self {
        use rand::Rng;

        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill(&mut nonce_bytes);
        Self::with_nonce(password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(password: &str, nonce: String) -> Self {
        Self {
            nonce,
            password: password.to_string(),
            proof_state: None,
        }
    }

    /// The client-first-message. The user name is left empty since the
    /// server takes it from the startup packet.
    pub fn client_first_message(&self) -> String {
        format!("{}{}", Self::GS2_HEADER, self.client_first_bare())
    }

    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.nonce)
    }

    /// Process the server-first-message and build the client-final-message.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String> {
        let mut combined_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(value);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = value.parse::<u32>().ok();
            }
        }

        let missing = |what: &str| Error::Auth(format!("server-first-message without {what}"));
        let combined_nonce = combined_nonce.ok_or_else(|| missing("nonce"))?;
        let salt = salt.ok_or_else(|| missing("salt"))?;
        let iterations = iterations.ok_or_else(|| missing("iteration count"))?;

        if !combined_nonce.starts_with(&self.nonce) {
            return Err(Error::Auth(
                "server nonce does not extend the client nonce".into(),
            ));
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|e| Error::Auth(format!("invalid salt: {e}")))?;

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);

        let without_proof = format!(
            "c={},r={}",
            BASE64.encode(Self::GS2_HEADER),
            combined_nonce
        );
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.proof_state = Some((salted_password, auth_message));
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Verify the server-final-message signature.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(Error::Auth(format!("server rejected SCRAM exchange: {err}")));
        }
        let signature = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::Auth("malformed server-final-message".into()))?;
        let signature = BASE64
            .decode(signature)
            .map_err(|e| Error::Auth(format!("invalid server signature: {e}")))?;

        let (salted_password, auth_message) = self
            .proof_state
            .as_ref()
            .ok_or_else(|| Error::Auth("server-final-message before server-first".into()))?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;
        if signature.as_slice() != expected.as_slice() {
            return Err(Error::Auth("server signature mismatch".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password() {
        let result = md5_password("postgres", "password", &[0x01, 0x02, 0x03, 0x04]);
        assert!(result.starts_with("md5"));
        assert_eq!(result.len(), 35);
    }

    #[test]
    fn test_password_message() {
        let mut buf = Vec::new();
        write_password(&mut buf, "secret");
        assert_eq!(buf[0], b'p');
        assert!(buf.ends_with(b"secret\0"));
    }

    // RFC 7677 example exchange.
    #[test]
    fn test_scram_rfc7677() {
        let mut client = ScramClient::with_nonce("pencil", "rOprNGfwEbeRWgbNEkqO".into());
        assert_eq!(client.client_first_message(), "n,,n=,r=rOprNGfwEbeRWgbNEkqO");

        let server_first = "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
                            s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let client_final = client.process_server_first(server_first).unwrap();
        assert!(client_final.starts_with("c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p="));

        assert!(client.verify_server_final("v=AAAA").is_err());
        assert!(client.verify_server_final("e=invalid-proof").is_err());
    }

    #[test]
    fn test_scram_rejects_foreign_nonce() {
        let mut client = ScramClient::with_nonce("pencil", "abc".into());
        let err = client
            .process_server_first("r=xyz123,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }
}
