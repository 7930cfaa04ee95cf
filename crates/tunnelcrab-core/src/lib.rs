pub mod error;
pub mod wire;

pub use error::{Result, TunnelError};
pub use wire::{
    is_valid_subdomain, Greeting, Headers, PoolId, SerializedRequest, SerializedResponse,
    Subdomain,
};
