// Domain-layer modules and shared errors/models
pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}

pub mod rate_limiter {
    pub use crate::rate_limiter::*;
}

pub mod retry {
    pub use crate::retry::*;
}

pub mod classifier {
    pub use crate::classifier::*;
}

pub mod health {
    pub use crate::health::*;
}
