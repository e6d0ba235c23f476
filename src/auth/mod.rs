//! Authorization and identity resolution.

pub mod gate;
pub mod identity;

pub use gate::AuthorizationGate;
pub use identity::{Claims, IdentityResolver, JwtIdentityResolver, role_closure};
