//! Lifecycle orchestration for Stratum.
//!
//! This crate ties the naming scheme from `stratum-schema` to the host
//! collaborators from `stratum-host` in the `Engine`, the API for creating
//! bases, adding bootable layers and inspecting the image chain. It also
//! provides the hook dispatcher, the chain state machine and host-wide
//! locking with graceful Ctrl-C handling.

pub mod concurrency;
pub mod engine;
pub mod hooks;
pub mod lifecycle;

pub use concurrency::{
    install_signal_handler, request_shutdown, shutdown_requested, HostLock, DEFAULT_LOCK_PATH,
};
pub use engine::{
    BaseIntegrity, BaseReport, Engine, EngineConfig, ImageSource, ImageStatus, VolumeInventory,
    BASE_TAG, DEFAULT_HOOKS_DIR, LAYER_TAG, SEAL_TAG_PREFIX,
};
pub use hooks::{
    hook_scripts, script_handler, HandlerId, HookError, HookEvent, Hooks, NEW_BASE_ADDED,
    NEW_BASE_CREATED, NEW_LAYER_ADDED,
};
pub use lifecycle::{validate_transition, ChainState};

use stratum_host::HostError;
use stratum_schema::NamingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("naming error: {0}")]
    Naming(NamingError),
    #[error("host error: {0}")]
    Host(#[from] HostError),
    #[error("hook error: {0}")]
    Hook(#[from] HookError),
    #[error("invalid size {0}, must be greater than zero")]
    InvalidSize(String),
    #[error("'{0}' is not an image of this volume group")]
    NotAnImage(String),
    #[error("'{0}' is not a base")]
    NotABase(String),
    #[error("no base found for '{0}'")]
    NoBaseFound(String),
    #[error("'{volume}' is outside volume group {vg}")]
    ForeignVolumeGroup { volume: String, vg: String },
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("shutdown requested, not starting '{0}'")]
    Interrupted(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A volume listing that failed on the host is a host error, not a naming
/// one, also when it surfaced while building the layout.
impl From<NamingError> for CoreError {
    fn from(e: NamingError) -> Self {
        match e {
            NamingError::Inventory(source) => match source.downcast::<HostError>() {
                Ok(host) => CoreError::Host(*host),
                Err(other) => CoreError::Naming(NamingError::Inventory(other)),
            },
            NamingError::NoValidLayout(inner) if matches!(*inner, NamingError::Inventory(_)) => {
                CoreError::from(*inner)
            }
            other => CoreError::Naming(other),
        }
    }
}
