use thiserror::Error;

/// Vigil 统一错误类型
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Device offline: {0}")]
    DeviceOffline(String),

    #[error("Media server error: code={code} msg={msg}")]
    MediaServer { code: i64, msg: String },

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, VigilError>;

impl From<anyhow::Error> for VigilError {
    fn from(err: anyhow::Error) -> Self {
        VigilError::Internal(err.to_string())
    }
}

impl VigilError {
    /// 是否为「未找到」类错误
    pub fn is_not_found(&self) -> bool {
        matches!(self, VigilError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        let err = VigilError::NotFound("channel abc".into());
        assert!(err.is_not_found());
        assert!(!VigilError::Auth("bad digest".into()).is_not_found());
    }
}
