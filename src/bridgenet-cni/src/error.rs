//! Error types
//!
//! `IpamError` covers the address allocator and its store. `CniError` is what the
//! plugin reports back to the container runtime, using the codes from CNI Spec 1.0.0.

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use thiserror::Error;

/// CNI error codes as defined in the CNI specification
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CniErrorCode {
    /// 1: Incompatible CNI version
    IncompatibleVersion = 1,

    /// 3: Container unknown or does not exist
    UnknownContainer = 3,

    /// 4: Invalid necessary environment variables
    InvalidEnvironmentVariables = 4,

    /// 5: I/O failure
    IoFailure = 5,

    /// 6: Failed to decode content
    DecodingFailure = 6,

    /// 7: Invalid network config
    InvalidNetworkConfig = 7,

    // Plugin-specific errors (100+)

    /// 100: Bridge creation failed
    BridgeCreationFailed = 100,

    /// 101: Veth creation failed
    VethCreationFailed = 101,

    /// 102: IPAM failure
    IpamFailure = 102,

    /// 103: Namespace operation failed
    NamespaceFailure = 103,

    /// 104: Route configuration failed
    RouteFailure = 104,

    /// 105: No free address left in the subnet
    AddressExhausted = 105,
}

/// CNI error with code, message, and optional details
#[derive(Debug, Error)]
#[error("{msg}")]
pub struct CniError {
    code: CniErrorCode,
    msg: String,
    details: Option<String>,
}

impl CniError {
    pub fn new(code: CniErrorCode, msg: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: &str) -> Self {
        self.details = Some(details.to_string());
        self
    }

    pub fn code(&self) -> CniErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }
}

// Convenience constructors for common errors

impl CniError {
    pub fn io_error(msg: &str) -> Self {
        Self::new(CniErrorCode::IoFailure, msg)
    }

    pub fn decode_error(msg: &str) -> Self {
        Self::new(CniErrorCode::DecodingFailure, msg)
    }

    pub fn config_error(msg: &str) -> Self {
        Self::new(CniErrorCode::InvalidNetworkConfig, msg)
    }

    pub fn env_error(msg: &str) -> Self {
        Self::new(CniErrorCode::InvalidEnvironmentVariables, msg)
    }

    pub fn bridge_error(msg: &str) -> Self {
        Self::new(CniErrorCode::BridgeCreationFailed, msg)
    }

    pub fn veth_error(msg: &str) -> Self {
        Self::new(CniErrorCode::VethCreationFailed, msg)
    }

    pub fn namespace_error(msg: &str) -> Self {
        Self::new(CniErrorCode::NamespaceFailure, msg)
    }

    pub fn route_error(msg: &str) -> Self {
        Self::new(CniErrorCode::RouteFailure, msg)
    }
}

/// Failures of the address allocator and its persistent store
#[derive(Debug, Error)]
pub enum IpamError {
    #[error("invalid subnet {cidr:?}")]
    InvalidSubnet {
        cidr: String,
        #[source]
        source: ipnet::AddrParseError,
    },

    #[error("subnet {0} has no room for addresses beyond the gateway")]
    SubnetTooSmall(Ipv4Net),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The data file exists but does not parse. Never repaired automatically:
    /// recreating it would forget live allocations.
    #[error("allocation store {} is corrupt", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no available IP address in {subnet}")]
    Exhausted { subnet: Ipv4Net },

    #[error("refusing to record invalid address {0}")]
    InvalidAddress(Ipv4Addr),

    #[error("no address allocated to container {container_id}")]
    NotFound { container_id: String },

    #[error("allocation store was not loaded in this critical section")]
    NotLoaded,

    #[error("failed to encode allocation store")]
    Encode(#[source] serde_json::Error),
}

impl IpamError {
    /// Wrap an I/O error with a description of what was being attempted
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<IpamError> for CniError {
    fn from(err: IpamError) -> Self {
        let code = match &err {
            IpamError::InvalidSubnet { .. } | IpamError::SubnetTooSmall(_) => {
                CniErrorCode::InvalidNetworkConfig
            }
            IpamError::Io { .. } => CniErrorCode::IoFailure,
            IpamError::Exhausted { .. } => CniErrorCode::AddressExhausted,
            IpamError::NotFound { .. } => CniErrorCode::UnknownContainer,
            IpamError::Corrupt { .. }
            | IpamError::InvalidAddress(_)
            | IpamError::NotLoaded
            | IpamError::Encode(_) => CniErrorCode::IpamFailure,
        };

        let cni = CniError::new(code, &err.to_string());
        match std::error::Error::source(&err) {
            Some(source) => cni.with_details(&source.to_string()),
            None => cni,
        }
    }
}
