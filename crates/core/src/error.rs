use thiserror::Error;

use crate::dispatcher::DispatchToken;

/// Errors raised by the dispatcher and by store registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// A token passed to the dispatcher was never issued or was unregistered.
    #[error("unknown dispatch token {0}")]
    UnknownToken(DispatchToken),

    /// The declared handler dependencies would form a cycle.
    #[error("handler dependency cycle involving {0}")]
    Cycle(DispatchToken),

    /// A handler tried to dispatch while the same thread was already dispatching.
    #[error("cannot dispatch in the middle of a dispatch")]
    NestedDispatch,

    /// The store already owns a registration on a dispatcher.
    #[error("store {store} is already registered as {token}")]
    AlreadyRegistered {
        store: String,
        token: DispatchToken,
    },
}

pub type Result<T> = std::result::Result<T, DispatchError>;
