pub mod action;
pub mod forward;
pub mod health;
pub mod ids;

pub use action::*;
pub use forward::*;
pub use health::*;
pub use ids::ConnectionId;
