mod forward;
mod oauth;
mod types;

pub use forward::UpstreamForwarder;
pub use oauth::OAuthRefresher;
pub use types::{extract_usage_from_chunk, usage_from_value, ByteStream, ClientHeaders, UsageTotals};
