pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod exception;
pub mod hooks;
pub mod input;
pub mod output;
pub mod param;
pub mod request;
pub mod resources;
pub mod router;
pub mod security;
pub mod uri;
pub mod utf8;

pub use cache::{CacheEnvelope, ResponseCache};
pub use config::WebConfig;
pub use dispatcher::{Dispatcher, Fallback};
pub use exception::Exception;
pub use hooks::{Checkpoint, HookRegistry, Priority};
pub use input::{AmbientRequest, InputSnapshot, InputValue, RawInput, Space};
pub use output::{HeaderEntry, ResponseBuffer};
pub use param::{HttpRequestMethod, HttpVersion};
pub use request::Request;
pub use resources::StaticResources;
pub use router::{RequestScope, RouteOutcome, RouteTable, Router};
pub use security::{xss_clean, SecurityGate};
pub use uri::{UriIdentity, UriResolver};
