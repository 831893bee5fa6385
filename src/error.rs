// Licensed under the Apache-2.0 license

/// Classified error kinds surfaced by requester procedures.
///
/// Internal modules keep their own cause enums; procedures map them
/// into these kinds at the public boundary. Retry loops consume only
/// `NoResponse`; `Timeout` is always surfaced to the caller as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpdmError {
    /// Capability not advertised, wrong connection state or a missing
    /// negotiated algorithm.
    Unsupported,
    /// Caller misuse, e.g. slot out of range without a provisioned chain.
    InvalidParam,
    /// Transport or framing problem, malformed or unexpected reply.
    DeviceError,
    /// Transport exceeded its deadline.
    Timeout,
    /// Responder temporarily busy; drives the outer retry loop.
    NoResponse,
    /// A cryptographic check failed or an out-of-contract length was seen.
    SecurityViolation,
}

pub type SpdmResult<T> = Result<T, SpdmError>;
