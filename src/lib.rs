pub mod config;
pub mod counters;
pub mod directory;
pub mod error;
pub mod handlers;
pub mod hierarchy;
pub mod limits;
pub mod metadb;
pub mod middleware;
pub mod notify;
pub mod response;
pub mod server;
pub mod throttle;

pub use config::Config;
pub use error::{Error, Result};
pub use hierarchy::{HierarchyPath, HierarchyQuery, Resolver};
pub use limits::{parse_limit, ByteLimit, Identity, LimitSet};
pub use throttle::{ThrottleEngine, Tier};
