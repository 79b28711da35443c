use actix_web::{
    error::ResponseError,
    http::{header::ContentType, StatusCode},
    HttpResponse,
};
use kalatori_engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Could not initialize server. {0}")]
    InitializeError(String),
    #[error("An error occurred on the backend of the server. {0}")]
    BackendError(String),
    #[error("Could not read request body: {0}")]
    InvalidRequestBody(String),
    #[error("An I/O error happened in the server. {0}")]
    IOError(#[from] std::io::Error),
    #[error("Invalid server configuration. {0}")]
    ConfigurationError(String),
    #[error("UnspecifiedError. {0}")]
    Unspecified(String),
    #[error("Order not found")]
    OrderNotFound,
    #[error("{0}")]
    UnsupportedCurrency(String),
    #[error("{0}")]
    InvalidAmount(String),
    #[error("{0}")]
    DuplicateOrder(String),
    #[error("{0}")]
    WithdrawalNotAllowed(String),
}

impl ResponseError for ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequestBody(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedCurrency(_) => StatusCode::BAD_REQUEST,
            Self::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            Self::OrderNotFound => StatusCode::NOT_FOUND,
            Self::DuplicateOrder(_) => StatusCode::CONFLICT,
            Self::WithdrawalNotAllowed(_) => StatusCode::CONFLICT,
            Self::InitializeError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BackendError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IOError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unspecified(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .body(serde_json::json!({ "error": self.to_string() }).to_string())
    }
}

impl From<EngineError> for ServerError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::OrderNotFound(_) => Self::OrderNotFound,
            EngineError::DuplicateOrderMismatch(_) => Self::DuplicateOrder(e.to_string()),
            EngineError::UnsupportedCurrency(_) => Self::UnsupportedCurrency(e.to_string()),
            EngineError::InvalidAmount(_) => Self::InvalidAmount(e.to_string()),
            EngineError::WithdrawalNotAllowed(_) => Self::WithdrawalNotAllowed(e.to_string()),
            EngineError::DerivationError(_) | EngineError::DatabaseError(_) => Self::BackendError(e.to_string()),
        }
    }
}
