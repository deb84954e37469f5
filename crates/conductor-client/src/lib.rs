pub mod http;
pub mod reliable;

pub mod mock;

pub use http::{HttpAgentApi, HttpApiConfig};
pub use mock::MockAgentApi;
pub use reliable::{ReliableAgentApi, ReliableConfig};
