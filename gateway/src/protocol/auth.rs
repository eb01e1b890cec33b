//! Authentication flows for the PostgreSQL wire protocol
//!
//! One authentication method is configured per server, before any byte is
//! read from a client. Each method implements [`AuthFlow`]: `begin` emits
//! the initial challenge (or settles immediately), `handle_message`
//! consumes one client response and either succeeds, fails, or requests
//! another round. Failure is terminal for the connection.

use crate::error::{GatewayError, Result};
use crate::protocol::buffer::BufferReader;
use crate::protocol::message::{AuthenticationRequest, BackendMessage};
use crate::protocol::scram::{self, ServerSecret, DEFAULT_ITERATIONS};
use crate::tls::PeerIdentity;
use bytes::Bytes;
use constant_time_eq::constant_time_eq;
use log::warn;
use pgbridge_core::error::{sqlstate, BackendError};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

fn default_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

/// Authentication configuration, fixed at server construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum AuthOptions {
    /// No authentication; every startup succeeds
    Trust,

    /// Cleartext password authentication
    Password {
        /// Usernames and their cleartext secrets
        users: HashMap<String, String>,
    },

    /// MD5 password authentication with a per-connection random salt
    Md5 {
        /// Usernames and their cleartext secrets
        users: HashMap<String, String>,
    },

    /// SCRAM-SHA-256 SASL authentication
    #[serde(rename = "scram-sha-256")]
    ScramSha256 {
        /// Usernames and their cleartext secrets
        users: HashMap<String, String>,
        /// PBKDF2 iteration count advertised to clients
        #[serde(default = "default_iterations")]
        iterations: u32,
    },

    /// Client-certificate authentication over a mandatory TLS upgrade
    Cert,
}

impl AuthOptions {
    /// Whether this method can only run on a TLS-secured transport
    pub fn requires_tls(&self) -> bool {
        matches!(self, AuthOptions::Cert)
    }

    /// Whether the TLS handshake must request a client certificate
    pub fn requires_client_cert(&self) -> bool {
        matches!(self, AuthOptions::Cert)
    }
}

impl fmt::Display for AuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthOptions::Trust => write!(f, "trust"),
            AuthOptions::Password { .. } => write!(f, "password"),
            AuthOptions::Md5 { .. } => write!(f, "md5"),
            AuthOptions::ScramSha256 { .. } => write!(f, "scram-sha-256"),
            AuthOptions::Cert => write!(f, "cert"),
        }
    }
}

/// Result of one step of an authentication exchange
#[derive(Debug)]
pub enum AuthOutcome {
    /// More exchange needed; send these challenges and await the client
    Continue(Vec<BackendMessage>),

    /// Authenticated; send these trailing messages before AuthenticationOk
    Complete(Vec<BackendMessage>),

    /// Terminal failure, reported with SQLSTATE class 28 and then close
    Fail(BackendError),
}

/// One authentication exchange, owned by a single connection
pub trait AuthFlow: Send {
    /// Begin the exchange: emit the initial challenge, or settle
    /// immediately for methods with no message exchange
    fn begin(&mut self) -> AuthOutcome;

    /// Consume the payload of one Password ('p') message from the client
    fn handle_message(&mut self, payload: &Bytes) -> AuthOutcome;
}

/// Build the flow for this connection from the server-wide options
pub fn create_auth_flow(
    options: &AuthOptions,
    username: &str,
    peer: Option<&PeerIdentity>,
) -> Box<dyn AuthFlow> {
    match options {
        AuthOptions::Trust => Box::new(TrustFlow),
        AuthOptions::Password { users } => Box::new(CleartextPasswordFlow {
            username: username.to_string(),
            expected: users.get(username).cloned(),
        }),
        AuthOptions::Md5 { users } => Box::new(Md5Flow {
            username: username.to_string(),
            expected: users.get(username).cloned(),
            salt: thread_rng().gen(),
        }),
        AuthOptions::ScramSha256 { users, iterations } => Box::new(ScramFlow {
            username: username.to_string(),
            secret: users
                .get(username)
                .map(|password| ServerSecret::derive(password, *iterations)),
            state: ScramState::Initial,
        }),
        AuthOptions::Cert => Box::new(CertFlow {
            username: username.to_string(),
            peer: peer.cloned(),
        }),
    }
}

fn auth_failed(username: &str) -> BackendError {
    BackendError::fatal(
        sqlstate::INVALID_PASSWORD,
        format!("password authentication failed for user \"{}\"", username),
    )
}

fn unexpected_message() -> AuthOutcome {
    AuthOutcome::Fail(BackendError::fatal(
        sqlstate::PROTOCOL_VIOLATION,
        "unexpected message during authentication",
    ))
}

/// Trust: succeeds immediately, no message exchange
struct TrustFlow;

impl AuthFlow for TrustFlow {
    fn begin(&mut self) -> AuthOutcome {
        AuthOutcome::Complete(Vec::new())
    }

    fn handle_message(&mut self, _payload: &Bytes) -> AuthOutcome {
        unexpected_message()
    }
}

/// Cleartext password exchange
struct CleartextPasswordFlow {
    username: String,
    expected: Option<String>,
}

impl AuthFlow for CleartextPasswordFlow {
    fn begin(&mut self) -> AuthOutcome {
        AuthOutcome::Continue(vec![BackendMessage::Authentication(
            AuthenticationRequest::CleartextPassword,
        )])
    }

    fn handle_message(&mut self, payload: &Bytes) -> AuthOutcome {
        let password = match read_password(payload) {
            Ok(password) => password,
            Err(_) => return unexpected_message(),
        };

        match &self.expected {
            Some(expected) if constant_time_eq(password.as_bytes(), expected.as_bytes()) => {
                AuthOutcome::Complete(Vec::new())
            }
            _ => AuthOutcome::Fail(auth_failed(&self.username)),
        }
    }
}

/// MD5 salted double-hash exchange
struct Md5Flow {
    username: String,
    expected: Option<String>,
    salt: [u8; 4],
}

impl AuthFlow for Md5Flow {
    fn begin(&mut self) -> AuthOutcome {
        AuthOutcome::Continue(vec![BackendMessage::Authentication(
            AuthenticationRequest::Md5Password { salt: self.salt },
        )])
    }

    fn handle_message(&mut self, payload: &Bytes) -> AuthOutcome {
        let response = match read_password(payload) {
            Ok(response) => response,
            Err(_) => return unexpected_message(),
        };

        let Some(expected_password) = &self.expected else {
            return AuthOutcome::Fail(auth_failed(&self.username));
        };

        let expected = hash_md5_password(&self.username, expected_password, &self.salt);
        if constant_time_eq(response.as_bytes(), expected.as_bytes()) {
            AuthOutcome::Complete(Vec::new())
        } else {
            AuthOutcome::Fail(auth_failed(&self.username))
        }
    }
}

/// Hash a password with PostgreSQL's nested MD5 scheme:
/// `"md5" + hex(md5(hex(md5(password + username)) + salt))`
pub fn hash_md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, username));
    let inner_hex = format!("{:x}", inner);

    let mut outer_input = Vec::with_capacity(inner_hex.len() + salt.len());
    outer_input.extend_from_slice(inner_hex.as_bytes());
    outer_input.extend_from_slice(salt);
    let outer = md5::compute(outer_input);

    format!("md5{:x}", outer)
}

#[derive(Debug, PartialEq)]
enum ScramState {
    Initial,
    SentServerFirst {
        client_first_bare: String,
        server_first: String,
        nonce: String,
    },
    Done,
}

/// SCRAM-SHA-256 three-message SASL exchange
struct ScramFlow {
    username: String,
    secret: Option<ServerSecret>,
    state: ScramState,
}

impl ScramFlow {
    fn handle_client_first(&mut self, payload: &Bytes) -> Result<AuthOutcome> {
        let mut reader = BufferReader::new(payload);
        let mechanism = reader.read_cstring()?;
        if mechanism != "SCRAM-SHA-256" {
            return Ok(AuthOutcome::Fail(BackendError::fatal(
                sqlstate::INVALID_AUTHORIZATION,
                "Unsupported SASL authentication mechanism",
            )));
        }

        let response_length = reader.read_i32()?;
        if response_length < 0 {
            return Ok(AuthOutcome::Fail(BackendError::fatal(
                sqlstate::INVALID_AUTHORIZATION,
                "SASL initial response is required",
            )));
        }
        let client_first = std::str::from_utf8(reader.read_bytes(response_length as usize)?)
            .map_err(|e| GatewayError::Auth(format!("Invalid SASL message encoding: {}", e)))?;

        let Some(secret) = &self.secret else {
            return Ok(AuthOutcome::Fail(auth_failed(&self.username)));
        };

        let parsed = scram::parse_client_first(client_first)?;
        let nonce = scram::extend_nonce(&parsed.nonce);
        let server_first = scram::server_first_message(&nonce, secret);

        let challenge = BackendMessage::Authentication(AuthenticationRequest::SaslContinue {
            data: Bytes::from(server_first.clone().into_bytes()),
        });
        self.state = ScramState::SentServerFirst {
            client_first_bare: parsed.bare,
            server_first,
            nonce,
        };

        Ok(AuthOutcome::Continue(vec![challenge]))
    }

    fn handle_client_final(&mut self, payload: &Bytes) -> Result<AuthOutcome> {
        let ScramState::SentServerFirst {
            client_first_bare,
            server_first,
            nonce,
        } = &self.state
        else {
            return Ok(unexpected_message());
        };

        let client_final = std::str::from_utf8(payload)
            .map_err(|e| GatewayError::Auth(format!("Invalid SASL message encoding: {}", e)))?;
        let parsed = scram::parse_client_final(client_final)?;

        if parsed.nonce != *nonce {
            return Ok(AuthOutcome::Fail(BackendError::fatal(
                sqlstate::INVALID_AUTHORIZATION,
                "SASL nonce mismatch",
            )));
        }

        // The first step fails for unknown users, so a secret is present
        // whenever the exchange reaches this state
        let Some(secret) = self.secret.as_ref() else {
            return Ok(AuthOutcome::Fail(auth_failed(&self.username)));
        };
        let auth_message =
            scram::auth_message(client_first_bare, server_first, &parsed.without_proof);

        if !scram::verify_client_proof(&secret.stored_key, &auth_message, &parsed.proof) {
            return Ok(AuthOutcome::Fail(auth_failed(&self.username)));
        }

        let server_final = scram::server_final_message(secret, &auth_message);
        self.state = ScramState::Done;

        Ok(AuthOutcome::Complete(vec![BackendMessage::Authentication(
            AuthenticationRequest::SaslFinal {
                data: Bytes::from(server_final.into_bytes()),
            },
        )]))
    }
}

impl AuthFlow for ScramFlow {
    fn begin(&mut self) -> AuthOutcome {
        AuthOutcome::Continue(vec![BackendMessage::Authentication(
            AuthenticationRequest::Sasl {
                mechanisms: vec!["SCRAM-SHA-256".to_string()],
            },
        )])
    }

    fn handle_message(&mut self, payload: &Bytes) -> AuthOutcome {
        let step = match self.state {
            ScramState::Initial => self.handle_client_first(payload),
            ScramState::SentServerFirst { .. } => self.handle_client_final(payload),
            ScramState::Done => return unexpected_message(),
        };

        step.unwrap_or_else(|err| {
            warn!("SASL exchange failed for {}: {}", self.username, err);
            AuthOutcome::Fail(err.to_backend_error())
        })
    }
}

/// Client-certificate authentication: the TLS handshake has already
/// verified the chain against the configured authority; here the
/// certificate identity must match the startup user
struct CertFlow {
    username: String,
    peer: Option<PeerIdentity>,
}

impl AuthFlow for CertFlow {
    fn begin(&mut self) -> AuthOutcome {
        let Some(peer) = &self.peer else {
            return AuthOutcome::Fail(BackendError::fatal(
                sqlstate::INVALID_AUTHORIZATION,
                "certificate authentication requires a verified client certificate",
            ));
        };

        match peer.common_name.as_deref() {
            Some(cn) if cn == self.username => AuthOutcome::Complete(Vec::new()),
            Some(cn) => AuthOutcome::Fail(BackendError::fatal(
                sqlstate::INVALID_AUTHORIZATION,
                format!(
                    "client certificate CN \"{}\" does not match user \"{}\"",
                    cn, self.username
                ),
            )),
            None => AuthOutcome::Fail(BackendError::fatal(
                sqlstate::INVALID_AUTHORIZATION,
                "client certificate has no common name",
            )),
        }
    }

    fn handle_message(&mut self, _payload: &Bytes) -> AuthOutcome {
        unexpected_message()
    }
}

/// Password payloads are null-terminated strings
fn read_password(payload: &Bytes) -> Result<String> {
    let mut reader = BufferReader::new(payload);
    reader.read_cstring()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use bytes::{BufMut, BytesMut};
    use hmac::{Hmac, Mac};
    use sha2::{Digest, Sha256};

    fn users(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(user, password)| (user.to_string(), password.to_string()))
            .collect()
    }

    fn password_payload(password: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(password.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }

    #[rstest::rstest]
    #[case::trust(r#"{"method": "trust"}"#, "trust")]
    #[case::password(r#"{"method": "password", "users": {}}"#, "password")]
    #[case::md5(r#"{"method": "md5", "users": {}}"#, "md5")]
    #[case::scram(r#"{"method": "scram-sha-256", "users": {}}"#, "scram-sha-256")]
    #[case::cert(r#"{"method": "cert"}"#, "cert")]
    fn test_method_names_round_trip(#[case] json: &str, #[case] name: &str) {
        let options: AuthOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.to_string(), name);
    }

    #[test]
    fn test_scram_options_default_iterations() {
        let options: AuthOptions = serde_json::from_str(
            r#"{"method": "scram-sha-256", "users": {"demo": "secret"}}"#,
        )
        .unwrap();
        match options {
            AuthOptions::ScramSha256 { iterations, .. } => {
                assert_eq!(iterations, DEFAULT_ITERATIONS)
            }
            other => panic!("Expected scram options, got {}", other),
        }
    }

    #[test]
    fn test_trust_completes_immediately() {
        let mut flow = create_auth_flow(&AuthOptions::Trust, "demo", None);
        assert!(matches!(flow.begin(), AuthOutcome::Complete(messages) if messages.is_empty()));
    }

    #[test]
    fn test_cleartext_password_matrix() {
        let options = AuthOptions::Password {
            users: users(&[("demo", "hunter2")]),
        };

        let mut flow = create_auth_flow(&options, "demo", None);
        assert!(matches!(flow.begin(), AuthOutcome::Continue(_)));
        assert!(matches!(
            flow.handle_message(&password_payload("hunter2")),
            AuthOutcome::Complete(_)
        ));

        let mut flow = create_auth_flow(&options, "demo", None);
        flow.begin();
        match flow.handle_message(&password_payload("wrong")) {
            AuthOutcome::Fail(err) => assert_eq!(err.code, "28P01"),
            other => panic!("Expected failure, got {:?}", other),
        }

        // Unknown user fails the same way as a wrong password
        let mut flow = create_auth_flow(&options, "mallory", None);
        flow.begin();
        assert!(matches!(
            flow.handle_message(&password_payload("hunter2")),
            AuthOutcome::Fail(_)
        ));
    }

    #[test]
    fn test_md5_password_matrix() {
        let options = AuthOptions::Md5 {
            users: users(&[("demo", "hunter2")]),
        };

        let mut flow = create_auth_flow(&options, "demo", None);
        let salt = match flow.begin() {
            AuthOutcome::Continue(messages) => match &messages[0] {
                BackendMessage::Authentication(AuthenticationRequest::Md5Password { salt }) => {
                    *salt
                }
                other => panic!("Expected MD5 challenge, got {:?}", other),
            },
            other => panic!("Expected Continue, got {:?}", other),
        };

        let good = hash_md5_password("demo", "hunter2", &salt);
        assert!(matches!(
            flow.handle_message(&password_payload(&good)),
            AuthOutcome::Complete(_)
        ));

        let mut flow = create_auth_flow(&options, "demo", None);
        flow.begin();
        let bad = hash_md5_password("demo", "wrong", &[0, 0, 0, 0]);
        match flow.handle_message(&password_payload(&bad)) {
            AuthOutcome::Fail(err) => assert_eq!(err.code, "28P01"),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_md5_hash_shape() {
        let hash = hash_md5_password("demo", "hunter2", &[1, 2, 3, 4]);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 35); // "md5" + 32 hex digits
    }

    fn sasl_initial_payload(client_first: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(b"SCRAM-SHA-256\0");
        buf.put_i32(client_first.len() as i32);
        buf.put_slice(client_first.as_bytes());
        buf.freeze()
    }

    fn scram_client_proof(password: &str, server_first: &str, auth_message: &str) -> [u8; 32] {
        let salt_base64 = server_first
            .split(',')
            .find_map(|attr| attr.strip_prefix("s="))
            .unwrap();
        let iterations: u32 = server_first
            .split(',')
            .find_map(|attr| attr.strip_prefix("i="))
            .unwrap()
            .parse()
            .unwrap();
        let salt = BASE64.decode(salt_base64).unwrap();

        let salted =
            pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), &salt, iterations);
        let mut mac = Hmac::<Sha256>::new_from_slice(&salted).unwrap();
        mac.update(b"Client Key");
        let client_key: [u8; 32] = mac.finalize().into_bytes().into();
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let mut mac = Hmac::<Sha256>::new_from_slice(&stored_key).unwrap();
        mac.update(auth_message.as_bytes());
        let signature: [u8; 32] = mac.finalize().into_bytes().into();

        let mut proof = [0u8; 32];
        for (i, (k, s)) in client_key.iter().zip(&signature).enumerate() {
            proof[i] = k ^ s;
        }
        proof
    }

    #[test]
    fn test_scram_full_exchange() {
        let options = AuthOptions::ScramSha256 {
            users: users(&[("demo", "hunter2")]),
            iterations: 1024,
        };

        let mut flow = create_auth_flow(&options, "demo", None);
        assert!(matches!(flow.begin(), AuthOutcome::Continue(_)));

        let client_first = "n,,n=demo,r=clientnonce";
        let server_first = match flow.handle_message(&sasl_initial_payload(client_first)) {
            AuthOutcome::Continue(messages) => match &messages[0] {
                BackendMessage::Authentication(AuthenticationRequest::SaslContinue { data }) => {
                    String::from_utf8(data.to_vec()).unwrap()
                }
                other => panic!("Expected SASL continue, got {:?}", other),
            },
            other => panic!("Expected Continue, got {:?}", other),
        };

        let nonce = server_first
            .split(',')
            .find_map(|attr| attr.strip_prefix("r="))
            .unwrap();
        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "n=demo,r=clientnonce,{},{}",
            server_first, without_proof
        );
        let proof = scram_client_proof("hunter2", &server_first, &auth_message);

        let client_final = format!("{},p={}", without_proof, BASE64.encode(proof));
        match flow.handle_message(&Bytes::from(client_final.into_bytes())) {
            AuthOutcome::Complete(messages) => match &messages[0] {
                BackendMessage::Authentication(AuthenticationRequest::SaslFinal { data }) => {
                    assert!(data.starts_with(b"v="));
                }
                other => panic!("Expected SASL final, got {:?}", other),
            },
            other => panic!("Expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_scram_rejects_bad_proof_and_mechanism() {
        let options = AuthOptions::ScramSha256 {
            users: users(&[("demo", "hunter2")]),
            iterations: 1024,
        };

        // Wrong mechanism
        let mut flow = create_auth_flow(&options, "demo", None);
        flow.begin();
        let mut buf = BytesMut::new();
        buf.put_slice(b"PLAIN\0");
        buf.put_i32(0);
        assert!(matches!(
            flow.handle_message(&buf.freeze()),
            AuthOutcome::Fail(_)
        ));

        // Wrong password
        let mut flow = create_auth_flow(&options, "demo", None);
        flow.begin();
        let server_first =
            match flow.handle_message(&sasl_initial_payload("n,,n=demo,r=clientnonce")) {
                AuthOutcome::Continue(messages) => match &messages[0] {
                    BackendMessage::Authentication(AuthenticationRequest::SaslContinue {
                        data,
                    }) => String::from_utf8(data.to_vec()).unwrap(),
                    other => panic!("Expected SASL continue, got {:?}", other),
                },
                other => panic!("Expected Continue, got {:?}", other),
            };

        let nonce = server_first
            .split(',')
            .find_map(|attr| attr.strip_prefix("r="))
            .unwrap();
        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!("n=demo,r=clientnonce,{},{}", server_first, without_proof);
        let proof = scram_client_proof("wrong", &server_first, &auth_message);

        let client_final = format!("{},p={}", without_proof, BASE64.encode(proof));
        match flow.handle_message(&Bytes::from(client_final.into_bytes())) {
            AuthOutcome::Fail(err) => assert_eq!(err.code, "28P01"),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_cert_flow_checks_common_name() {
        let peer = PeerIdentity {
            common_name: Some("demo".to_string()),
        };
        let mut flow = create_auth_flow(&AuthOptions::Cert, "demo", Some(&peer));
        assert!(matches!(flow.begin(), AuthOutcome::Complete(_)));

        let mut flow = create_auth_flow(&AuthOptions::Cert, "other", Some(&peer));
        match flow.begin() {
            AuthOutcome::Fail(err) => assert_eq!(err.code, "28000"),
            other => panic!("Expected failure, got {:?}", other),
        }

        let mut flow = create_auth_flow(&AuthOptions::Cert, "demo", None);
        assert!(matches!(flow.begin(), AuthOutcome::Fail(_)));
    }
}
