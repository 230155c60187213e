pub mod auth;
pub mod message;
pub mod sdp;
pub mod transaction;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Transaction timeout: {0}")]
    Timeout(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
}

pub type Result<T> = std::result::Result<T, SipError>;

pub use auth::{digest_response, random_nonce, ChallengeStore, DigestAuthorization};
pub use message::{Headers, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::SdpOffer;
pub use transaction::TransactionPool;
pub use transport::{Inbound, SipConnection, SipTransport};
