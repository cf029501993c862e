mod calls;
mod channel;
mod dids;
mod error;
mod groups;
mod routes;

pub use calls::{CallRouter, LegOneReply, LegTwoReply, RouterConfig, VerificationPolicy};
pub use channel::provider_from_channel;
pub use dids::DidPool;
pub use error::Error;
pub use groups::GroupResolver;
pub use routes::RouteResolver;
