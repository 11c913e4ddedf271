use thiserror::Error;

/// Errors that can occur while driving a DLNA/UPnP renderer session.
#[derive(Debug, Clone, Error)]
pub enum DlnaError {
    /// The underlying HTTP transport failed (timeout, DNS, connection refused).
    #[error("network error: {0}")]
    Network(String),
    /// The renderer replied with a body that could not be parsed as XML.
    #[error("malformed XML reply: {0}")]
    MalformedXml(String),
    /// The renderer replied with a well-formed SOAP fault envelope.
    #[error("SOAP fault {error_code}: {fault_string}")]
    SoapFault {
        fault_string: String,
        error_code: String,
        error_description: String,
    },
    /// The requested action or service is not present in the device's advertised schema.
    #[error("device does not support {0}")]
    DeviceUnsupported(String),
    /// The operation was abandoned because the owning session was disposed.
    #[error("operation cancelled")]
    Cancelled,
    /// The host application rejected a media source lookup.
    #[error("host rejected request: {0}")]
    HostRejected(String),
}

/// A specialized `Result` type for DLNA session operations.
pub type Result<T> = std::result::Result<T, DlnaError>;
