//! External service integrations.

pub mod gateway_client {
    pub use crate::gateway_client::*;
}
