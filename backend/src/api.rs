//! API protocol types for Jest socket communication
//!
//! This module defines the REST-like JSON-over-Unix-socket protocol used for
//! communicating with the Jest backend. Every reply is a [`Response`]
//! carrying an HTTP-like status, a message, an optional error and optional
//! data.

use serde::{Deserialize, Serialize};

use crate::bootstrap::BootstrapError;
use crate::jail::JailError;
use crate::mirror::MirrorError;
use crate::store::StoreError;
use crate::template::TemplateError;
use crate::zfs::ZfsError;

/// HTTP-like methods for API requests
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Create a resource or trigger an action
    Post,
    /// Retrieve a resource
    Get,
    /// Delete a resource
    Delete,
}

/// API endpoints
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Endpoint {
    /// Initialisation status: GET /init; bootstrap a template: POST /init
    Init,
    /// Datasets carrying jest tags: GET /init/datasets
    InitDatasets,
    /// Bootstrap progress: GET /init/status/{template}
    InitStatus(String),

    /// List templates: GET /templates
    Templates,
    /// Get a template: GET /templates/{name}
    Template(String),
    /// Disable a template: POST /templates/{name}/disable
    DisableTemplate(String),
    /// Enable a template: POST /templates/{name}/enable
    EnableTemplate(String),

    /// List jails: GET /jails; create a jail: POST /jails
    Jails,
    /// Get or delete a jail: GET|DELETE /jails/{name}
    Jail(String),
    /// Start a jail: POST /jails/{name}/start
    StartJail(String),
    /// Stop a jail: POST /jails/{name}/stop
    StopJail(String),
    /// Destroy a deleted jail's dataset: DELETE /jails/{name}/dataset
    JailDataset(String),

    /// Host config records: GET /config
    Config,
}

impl Endpoint {
    /// Get the endpoint path as a string
    pub fn path(&self) -> String {
        match self {
            Endpoint::Init => "init".to_string(),
            Endpoint::InitDatasets => "init/datasets".to_string(),
            Endpoint::InitStatus(name) => format!("init/status/{}", name),

            Endpoint::Templates => "templates".to_string(),
            Endpoint::Template(name) => format!("templates/{}", name),
            Endpoint::DisableTemplate(name) => format!("templates/{}/disable", name),
            Endpoint::EnableTemplate(name) => format!("templates/{}/enable", name),

            Endpoint::Jails => "jails".to_string(),
            Endpoint::Jail(name) => format!("jails/{}", name),
            Endpoint::StartJail(name) => format!("jails/{}/start", name),
            Endpoint::StopJail(name) => format!("jails/{}/stop", name),
            Endpoint::JailDataset(name) => format!("jails/{}/dataset", name),

            Endpoint::Config => "config".to_string(),
        }
    }
}

/// HTTP-like status codes for API responses
pub type StatusCode = u16;

/// Common status codes
pub mod status {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    pub const GATEWAY_TIMEOUT: u16 = 504;
}

/// API request with REST-like method and endpoint
#[derive(Debug, Deserialize, Serialize)]
pub struct Request {
    /// HTTP-like method (GET, POST, DELETE)
    pub method: Method,

    /// API endpoint path
    pub endpoint: String,

    /// Optional request body (as JSON value)
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Request {
    /// Create a new request
    pub fn new(method: Method, endpoint: Endpoint, body: serde_json::Value) -> Self {
        Self {
            method,
            endpoint: endpoint.path(),
            body,
        }
    }

    /// Create a GET request
    pub fn get(endpoint: Endpoint) -> Self {
        Self::new(Method::Get, endpoint, serde_json::Value::Null)
    }

    /// Create a POST request with a body
    pub fn post(endpoint: Endpoint, body: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self::new(Method::Post, endpoint, serde_json::to_value(&body)?))
    }

    /// Create a DELETE request
    pub fn delete(endpoint: Endpoint) -> Self {
        Self::new(Method::Delete, endpoint, serde_json::Value::Null)
    }

    /// Parse the endpoint string into an Endpoint enum
    pub fn parse_endpoint(&self) -> Result<Endpoint, ApiError> {
        let parts: Vec<&str> = self.endpoint.trim_matches('/').split('/').collect();

        match parts.as_slice() {
            ["init"] => Ok(Endpoint::Init),
            ["init", "datasets"] => Ok(Endpoint::InitDatasets),
            ["init", "status", name] => Ok(Endpoint::InitStatus(name.to_string())),

            ["templates"] => Ok(Endpoint::Templates),
            ["templates", name] => Ok(Endpoint::Template(name.to_string())),
            ["templates", name, "disable"] => Ok(Endpoint::DisableTemplate(name.to_string())),
            ["templates", name, "enable"] => Ok(Endpoint::EnableTemplate(name.to_string())),

            ["jails"] => Ok(Endpoint::Jails),
            ["jails", name] => Ok(Endpoint::Jail(name.to_string())),
            ["jails", name, "start"] => Ok(Endpoint::StartJail(name.to_string())),
            ["jails", name, "stop"] => Ok(Endpoint::StopJail(name.to_string())),
            ["jails", name, "dataset"] => Ok(Endpoint::JailDataset(name.to_string())),

            ["config"] => Ok(Endpoint::Config),

            _ => Err(ApiError::BadRequest(format!("Unknown endpoint: {}", self.endpoint))),
        }
    }
}

/// API response
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// HTTP-like status code
    pub status: StatusCode,

    /// Human-readable summary
    #[serde(default)]
    pub message: String,

    /// Error information (on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,

    /// Response data (on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    /// Create a success response with data
    pub fn ok(status: StatusCode, message: impl Into<String>, data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                status,
                message: message.into(),
                error: None,
                data: Some(data),
            },
            Err(e) => Self::internal_error(format!("Failed to serialize response data: {}", e)),
        }
    }

    /// Create a 200 OK response with data
    pub fn success(message: impl Into<String>, data: impl Serialize) -> Self {
        Self::ok(status::OK, message, data)
    }

    /// Create a 201 Created response with data
    pub fn created(message: impl Into<String>, data: impl Serialize) -> Self {
        Self::ok(status::CREATED, message, data)
    }

    /// Create an error response
    pub fn error(status: StatusCode, error: ApiError) -> Self {
        Self {
            status,
            message: error.message.clone(),
            error: Some(error),
            data: None,
        }
    }

    /// Create an error response with the status implied by the error code
    pub fn failure(error: impl Into<ApiError>) -> Self {
        let error = error.into();
        Self::error(error.status(), error)
    }

    /// Create a 400 Bad Request error response
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::error(status::BAD_REQUEST, ApiError::BadRequest(message.into()))
    }

    /// Create a 404 Not Found error response
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::error(status::NOT_FOUND, ApiError::NotFound(resource.into()))
    }

    /// Create a 409 Conflict error response
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::error(status::CONFLICT, ApiError::Conflict(message.into()))
    }

    /// Create a 500 Internal Server Error response
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::error(status::INTERNAL_SERVER_ERROR, ApiError::Internal(message.into()))
    }

    /// Create a 504 response for an operation that ran past its deadline
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::failure(ApiError::Timeout(operation.into()))
    }

    /// Check if the response indicates success
    pub fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// API error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "VALIDATION_FAILED")
    pub code: String,

    /// Human-readable error message
    pub message: String,
}

impl ApiError {
    /// Create a new API error
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Status code a response carrying this error is sent with
    pub fn status(&self) -> StatusCode {
        match self.code.as_str() {
            "BAD_REQUEST" | "VALIDATION_FAILED" => status::BAD_REQUEST,
            "NOT_FOUND" => status::NOT_FOUND,
            "CONFLICT" | "INVALID_STATE" => status::CONFLICT,
            "NOT_INITIALISED" => status::SERVICE_UNAVAILABLE,
            "TIMEOUT" => status::GATEWAY_TIMEOUT,
            _ => status::INTERNAL_SERVER_ERROR,
        }
    }

    /// Bad request error (400)
    #[allow(non_snake_case)]
    pub fn BadRequest(message: String) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    /// Validation error (400), message passed through unchanged
    #[allow(non_snake_case)]
    pub fn Validation(message: String) -> Self {
        Self::new("VALIDATION_FAILED", message)
    }

    /// Not found error (404)
    #[allow(non_snake_case)]
    pub fn NotFound(resource: String) -> Self {
        Self::new("NOT_FOUND", format!("Resource not found: {}", resource))
    }

    /// Conflict error (409)
    #[allow(non_snake_case)]
    pub fn Conflict(message: String) -> Self {
        Self::new("CONFLICT", message)
    }

    /// Host not yet initialised (503)
    #[allow(non_snake_case)]
    pub fn NotInitialised(message: String) -> Self {
        Self::new("NOT_INITIALISED", message)
    }

    /// Operation timed out (504)
    #[allow(non_snake_case)]
    pub fn Timeout(operation: String) -> Self {
        Self::new("TIMEOUT", format!("Operation timed out: {}", operation))
    }

    /// Internal server error (500)
    #[allow(non_snake_case)]
    pub fn Internal(message: String) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<ZfsError> for ApiError {
    fn from(err: ZfsError) -> Self {
        match err {
            ZfsError::DatasetNotFound(_) | ZfsError::SnapshotNotFound(_) => Self::new("NOT_FOUND", err.to_string()),
            ZfsError::DatasetExists(_) | ZfsError::MountpointInUse { .. } => Self::Conflict(err.to_string()),
            _ => Self::new("STORAGE_ERROR", err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::new("STORE_ERROR", err.to_string())
    }
}

/// Convert JailError to ApiError with appropriate status code
impl From<JailError> for ApiError {
    fn from(err: JailError) -> Self {
        match err {
            JailError::Validation(msg) => Self::Validation(msg),
            JailError::NotFound(name) => Self::NotFound(format!("Jail '{}'", name)),
            JailError::InvalidState(msg) => Self::new("INVALID_STATE", msg),
            JailError::NotInitialised => Self::NotInitialised(err.to_string()),
            JailError::Storage(e) => Self::from(e),
            JailError::Store(e) => Self::from(e),
            JailError::HostControl(e) => Self::new("HOST_CONTROL_ERROR", e.to_string()),
        }
    }
}

impl From<TemplateError> for ApiError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::NotFound(name) => Self::NotFound(format!("Template '{}'", name)),
            TemplateError::Store(e) => Self::from(e),
        }
    }
}

impl From<BootstrapError> for ApiError {
    fn from(err: BootstrapError) -> Self {
        match err {
            BootstrapError::InvalidRequest(msg) => Self::Validation(msg),
            BootstrapError::AlreadyExists(_) => Self::Conflict(err.to_string()),
            BootstrapError::Storage(e) => Self::from(e),
            BootstrapError::Transfer(MirrorError::InvalidSite(_)) => Self::BadRequest(err.to_string()),
            BootstrapError::Transfer(_) => Self::new("TRANSFER_FAILED", err.to_string()),
            BootstrapError::Extraction(_) => Self::new("EXTRACTION_FAILED", err.to_string()),
            BootstrapError::Store(e) => Self::from(e),
            _ => Self::Internal(err.to_string()),
        }
    }
}
