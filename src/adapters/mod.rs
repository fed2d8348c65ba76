pub mod call_meta;
pub mod capture;
pub mod http_client;
pub mod http_server;

/// Re-export commonly used types from adapters
pub use call_meta::MetaCodec;
pub use capture::{BodyCapture, CapturedStream};
pub use http_client::HttpClientAdapter;
pub use http_server::HttpServer;
