//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Errors raised while registering services or resolving calls.
///
/// The display text of the lookup and call variants is what the caller sees
/// in the response header.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("rpc server: {0} is not a valid service name")]
    InvalidServiceName(String),

    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),

    #[error("rpc: method {service}.{method} defined twice")]
    DuplicateMethod { service: String, method: String },

    #[error("rpc server: unformed request: service/method {0:?} has no '.'")]
    MalformedServiceMethod(String),

    #[error("rpc server: unknown service {0}")]
    UnknownService(String),

    #[error("rpc server: unknown method {0}")]
    UnknownMethod(String),

    #[error("rpc server: invalid argument for {service_method}: {message}")]
    InvalidArgument {
        service_method: String,
        message: String,
    },

    #[error("rpc server: cannot encode reply of {service_method}: {message}")]
    InvalidReply {
        service_method: String,
        message: String,
    },

    /// The method's own error return, passed through verbatim.
    #[error("{0}")]
    MethodFailed(String),
}

impl RegistryError {
    /// Returns whether the error comes from resolving the call target.
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            RegistryError::MalformedServiceMethod(_)
                | RegistryError::UnknownService(_)
                | RegistryError::UnknownMethod(_)
        )
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] brpc_protocol::ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("codec {0} is not accepted by this server")]
    CodecNotAccepted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_classification() {
        assert!(RegistryError::UnknownMethod("X".into()).is_lookup());
        assert!(RegistryError::UnknownService("Foo".into()).is_lookup());
        assert!(RegistryError::MalformedServiceMethod("Foo".into()).is_lookup());
        assert!(!RegistryError::MethodFailed("boom".into()).is_lookup());
    }

    #[test]
    fn test_method_failure_is_verbatim() {
        let err = ServerError::from(RegistryError::MethodFailed("division by zero".into()));
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn test_lookup_messages() {
        assert_eq!(
            RegistryError::UnknownMethod("DoesNotExist".into()).to_string(),
            "rpc server: unknown method DoesNotExist"
        );
        assert!(RegistryError::MalformedServiceMethod("FooSum".into())
            .to_string()
            .contains("unformed request"));
    }
}
