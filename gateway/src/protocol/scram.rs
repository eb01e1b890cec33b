//! SCRAM-SHA-256 server-side primitives
//!
//! Key derivation and proof verification for the SASL exchange, per
//! RFC 5802 and the PostgreSQL SASL authentication flow. The server
//! derives its stored/server keys from the configured cleartext secret
//! with a per-connection random salt; the client proof is verified by
//! XOR-recovering the client key from the proof and checking its hash
//! against the stored key.

use crate::error::{GatewayError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};

/// Length of every SCRAM-SHA-256 key and signature
pub const SCRAM_KEY_LEN: usize = 32;

/// Default PBKDF2 iteration count, matching PostgreSQL's default
pub const DEFAULT_ITERATIONS: u32 = 4096;

/// Server-side SCRAM credentials derived from a cleartext secret
#[derive(Debug, Clone)]
pub struct ServerSecret {
    /// Base64-encoded salt advertised in the server-first message
    pub salt_base64: String,

    /// PBKDF2 iteration count advertised in the server-first message
    pub iterations: u32,

    /// H(ClientKey); verifies the client proof
    pub stored_key: [u8; SCRAM_KEY_LEN],

    /// Signs the server-final message
    pub server_key: [u8; SCRAM_KEY_LEN],
}

impl ServerSecret {
    /// Derive credentials from a cleartext secret with a fresh random salt
    pub fn derive(password: &str, iterations: u32) -> Self {
        let salt: [u8; 16] = thread_rng().gen();
        let salted_password =
            pbkdf2::pbkdf2_hmac_array::<Sha256, SCRAM_KEY_LEN>(password.as_bytes(), &salt, iterations);

        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let server_key = hmac_sha256(&salted_password, b"Server Key");

        Self {
            salt_base64: BASE64.encode(salt),
            iterations,
            stored_key,
            server_key,
        }
    }
}

/// Parsed SASL client-first-message
#[derive(Debug, PartialEq)]
pub struct ClientFirstMessage {
    /// The message without its GS2 header; first half of the auth message
    pub bare: String,

    /// Client nonce (`r=` attribute)
    pub nonce: String,
}

/// Parse `gs2-cbind-flag,authzid,n=user,r=nonce`
pub fn parse_client_first(message: &str) -> Result<ClientFirstMessage> {
    let mut parts = message.splitn(3, ',');
    let cbind_flag = parts
        .next()
        .ok_or_else(|| GatewayError::Auth("Empty SASL client-first message".into()))?;

    // Channel binding is not advertised, so a client demanding it ("p=")
    // is misbehaving
    match cbind_flag {
        "n" | "y" => {}
        _ => {
            return Err(GatewayError::Auth(
                "Unsupported SASL channel binding".into(),
            ))
        }
    }

    let _authzid = parts
        .next()
        .ok_or_else(|| GatewayError::Auth("Malformed SASL client-first message".into()))?;
    let bare = parts
        .next()
        .ok_or_else(|| GatewayError::Auth("Malformed SASL client-first message".into()))?
        .to_string();

    let nonce = bare
        .split(',')
        .find_map(|attr| attr.strip_prefix("r="))
        .ok_or_else(|| GatewayError::Auth("SASL client-first message has no nonce".into()))?
        .to_string();

    Ok(ClientFirstMessage { bare, nonce })
}

/// Parsed SASL client-final-message
#[derive(Debug, PartialEq)]
pub struct ClientFinalMessage {
    /// Full nonce echoed by the client (`r=` attribute)
    pub nonce: String,

    /// Decoded client proof (`p=` attribute)
    pub proof: [u8; SCRAM_KEY_LEN],

    /// The message with the trailing `,p=...` stripped; last part of the
    /// auth message
    pub without_proof: String,
}

/// Parse `c=...,r=...,p=...`
pub fn parse_client_final(message: &str) -> Result<ClientFinalMessage> {
    let (without_proof, proof_base64) = message
        .rsplit_once(",p=")
        .ok_or_else(|| GatewayError::Auth("SASL client-final message has no proof".into()))?;

    let nonce = without_proof
        .split(',')
        .find_map(|attr| attr.strip_prefix("r="))
        .ok_or_else(|| GatewayError::Auth("SASL client-final message has no nonce".into()))?
        .to_string();

    let proof_bytes = BASE64
        .decode(proof_base64)
        .map_err(|_| GatewayError::Auth("SASL client proof is not valid base64".into()))?;
    let proof: [u8; SCRAM_KEY_LEN] = proof_bytes
        .try_into()
        .map_err(|_| GatewayError::Auth("SASL client proof has the wrong length".into()))?;

    Ok(ClientFinalMessage {
        nonce,
        proof,
        without_proof: without_proof.to_string(),
    })
}

/// Server nonce: the client nonce extended with fresh random data
pub fn extend_nonce(client_nonce: &str) -> String {
    let fresh: [u8; 18] = thread_rng().gen();
    format!("{}{}", client_nonce, BASE64.encode(fresh))
}

/// Server-first message: `r=<nonce>,s=<salt>,i=<iterations>`
pub fn server_first_message(nonce: &str, secret: &ServerSecret) -> String {
    format!(
        "r={},s={},i={}",
        nonce, secret.salt_base64, secret.iterations
    )
}

/// The auth message both sides sign
pub fn auth_message(
    client_first_bare: &str,
    server_first: &str,
    client_final_without_proof: &str,
) -> String {
    format!(
        "{},{},{}",
        client_first_bare, server_first, client_final_without_proof
    )
}

/// Verify the client proof against the stored key.
///
/// The proof is ClientKey XOR ClientSignature, so XORing with the
/// signature recovers the presumed ClientKey, whose hash must equal the
/// stored key. Comparison is constant-time.
pub fn verify_client_proof(
    stored_key: &[u8; SCRAM_KEY_LEN],
    auth_message: &str,
    proof: &[u8; SCRAM_KEY_LEN],
) -> bool {
    let client_signature = hmac_sha256(stored_key, auth_message.as_bytes());

    let mut client_key = [0u8; SCRAM_KEY_LEN];
    for (i, (sig, p)) in client_signature.iter().zip(proof).enumerate() {
        client_key[i] = sig ^ p;
    }

    constant_time_eq(&sha256(&client_key), stored_key)
}

/// Server-final message: `v=<base64 server signature>`
pub fn server_final_message(secret: &ServerSecret, auth_message: &str) -> String {
    let signature = hmac_sha256(&secret.server_key, auth_message.as_bytes());
    format!("v={}", BASE64.encode(signature))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; SCRAM_KEY_LEN] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; SCRAM_KEY_LEN] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Client-side proof computation, used to exercise the server side
    fn client_proof(password: &str, secret: &ServerSecret, auth_message: &str) -> [u8; 32] {
        let salt = BASE64.decode(&secret.salt_base64).unwrap();
        let salted = pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(
            password.as_bytes(),
            &salt,
            secret.iterations,
        );
        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key = sha256(&client_key);
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes());

        let mut proof = [0u8; 32];
        for (i, (k, s)) in client_key.iter().zip(&signature).enumerate() {
            proof[i] = k ^ s;
        }
        proof
    }

    #[test]
    fn test_parse_client_first() {
        let parsed = parse_client_first("n,,n=demo,r=rOprNGfwEbeRWgbNEkqO").unwrap();
        assert_eq!(parsed.bare, "n=demo,r=rOprNGfwEbeRWgbNEkqO");
        assert_eq!(parsed.nonce, "rOprNGfwEbeRWgbNEkqO");
    }

    #[test]
    fn test_parse_client_first_rejects_channel_binding() {
        assert!(parse_client_first("p=tls-server-end-point,,n=demo,r=abc").is_err());
        assert!(parse_client_first("garbage").is_err());
    }

    #[test]
    fn test_parse_client_final() {
        let proof = BASE64.encode([7u8; 32]);
        let message = format!("c=biws,r=abcdef,p={}", proof);
        let parsed = parse_client_final(&message).unwrap();
        assert_eq!(parsed.nonce, "abcdef");
        assert_eq!(parsed.without_proof, "c=biws,r=abcdef");
        assert_eq!(parsed.proof, [7u8; 32]);
    }

    #[test]
    fn test_full_exchange_verifies() {
        let secret = ServerSecret::derive("hunter2", DEFAULT_ITERATIONS);

        let client_first = parse_client_first("n,,n=demo,r=clientnonce").unwrap();
        let nonce = extend_nonce(&client_first.nonce);
        let server_first = server_first_message(&nonce, &secret);

        let without_proof = format!("c=biws,r={}", nonce);
        let auth = auth_message(&client_first.bare, &server_first, &without_proof);

        let proof = client_proof("hunter2", &secret, &auth);
        assert!(verify_client_proof(&secret.stored_key, &auth, &proof));

        let final_message = server_final_message(&secret, &auth);
        assert!(final_message.starts_with("v="));
    }

    #[test]
    fn test_wrong_password_fails_verification() {
        let secret = ServerSecret::derive("hunter2", DEFAULT_ITERATIONS);

        let client_first = parse_client_first("n,,n=demo,r=clientnonce").unwrap();
        let nonce = extend_nonce(&client_first.nonce);
        let server_first = server_first_message(&nonce, &secret);

        let without_proof = format!("c=biws,r={}", nonce);
        let auth = auth_message(&client_first.bare, &server_first, &without_proof);

        let proof = client_proof("wrong", &secret, &auth);
        assert!(!verify_client_proof(&secret.stored_key, &auth, &proof));
    }

    #[test]
    fn test_extend_nonce_preserves_client_prefix() {
        let nonce = extend_nonce("abc123");
        assert!(nonce.starts_with("abc123"));
        assert!(nonce.len() > "abc123".len());
    }
}
