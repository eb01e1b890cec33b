//! Message types for the PostgreSQL wire protocol
use bytes::Bytes;
use pgbridge_core::BackendError;
use std::collections::HashMap;

/// Frontend (client-to-server) message types
///
/// Only the messages the gateway itself interprets are decoded; anything
/// else arrives as [`FrontendMessage::Unknown`] and is forwarded to the
/// engine as raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    /// Startup message with protocol version and parameters
    Startup {
        /// Major protocol version (should be 3)
        version_major: i16,
        /// Minor protocol version (should be 0)
        version_minor: i16,
        /// Parameters (key-value pairs)
        parameters: HashMap<String, String>,
    },

    /// SSL upgrade probe (magic code 80877103)
    SslRequest,

    /// Cancel request (magic code 80877102)
    CancelRequest {
        /// Process ID to cancel
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },

    /// Password-carrying message ('p')
    ///
    /// The payload is left raw: depending on the active auth flow it is a
    /// cleartext password, an MD5 hash, a SASL initial response, or a SASL
    /// response.
    Password {
        /// Raw message payload (without tag and length header)
        payload: Bytes,
    },

    /// Query message (simple query protocol)
    Query(String),

    /// Terminate message
    Terminate,

    /// Any message the gateway does not interpret
    Unknown {
        /// Message type
        tag: u8,
        /// Message body
        body: Bytes,
    },
}

/// A decoded frontend message together with its original wire bytes
///
/// The raw bytes are kept so steady-state messages can be forwarded to the
/// engine verbatim, without re-encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The complete frame as received, including framing header
    pub raw: Bytes,

    /// The decoded message
    pub message: FrontendMessage,
}

impl Frame {
    /// Tag byte of the frame, or `None` for the untagged startup messages
    pub fn tag(&self) -> Option<u8> {
        match self.message {
            FrontendMessage::Startup { .. }
            | FrontendMessage::SslRequest
            | FrontendMessage::CancelRequest { .. } => None,
            _ => self.raw.first().copied(),
        }
    }
}

/// Backend (server-to-client) message types
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    /// Authentication request
    Authentication(AuthenticationRequest),

    /// Backend key data
    BackendKeyData {
        /// Process ID
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },

    /// Parameter status
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },

    /// Ready for query
    ReadyForQuery(TransactionStatus),

    /// Error response
    ErrorResponse(BackendError),

    /// Notice response
    NoticeResponse(BackendError),

    /// SSL response: a single unframed byte, 'S' to accept the upgrade or
    /// 'N' to decline it
    SslResponse(bool),

    /// Raw engine response, forwarded byte-for-byte without re-encoding
    Raw(Bytes),
}

/// Authentication request types
#[derive(Debug, Clone, PartialEq)]
pub enum AuthenticationRequest {
    /// Authentication successful
    Ok,

    /// Cleartext password required
    CleartextPassword,

    /// MD5 password required
    Md5Password {
        /// Salt for MD5 authentication
        salt: [u8; 4],
    },

    /// SASL authentication required
    Sasl {
        /// SASL authentication mechanisms
        mechanisms: Vec<String>,
    },

    /// SASL continuation
    SaslContinue {
        /// SASL data
        data: Bytes,
    },

    /// SASL final
    SaslFinal {
        /// SASL data
        data: Bytes,
    },
}

/// Transaction status reported in ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction)
    Idle,

    /// In a transaction block
    InTransaction,

    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    /// Convert from a byte to a transaction status
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    /// Convert to a byte
    pub fn to_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Frontend message type codes the gateway inspects
pub mod frontend_code {
    /// Simple query
    pub const QUERY: u8 = b'Q';
    /// Parse (extended query)
    pub const PARSE: u8 = b'P';
    /// Bind (extended query)
    pub const BIND: u8 = b'B';
    /// Close (extended query)
    pub const CLOSE: u8 = b'C';
    /// Sync (extended query)
    pub const SYNC: u8 = b'S';
    /// Password / SASL response
    pub const PASSWORD: u8 = b'p';
    /// Terminate
    pub const TERMINATE: u8 = b'X';
}

/// Backend message type codes the gateway inspects
pub mod backend_code {
    /// Authentication request
    pub const AUTHENTICATION: u8 = b'R';
    /// Parameter status
    pub const PARAMETER_STATUS: u8 = b'S';
    /// Backend key data
    pub const BACKEND_KEY_DATA: u8 = b'K';
    /// Ready for query
    pub const READY_FOR_QUERY: u8 = b'Z';
    /// Error response
    pub const ERROR_RESPONSE: u8 = b'E';
    /// Notice response
    pub const NOTICE_RESPONSE: u8 = b'N';
}
