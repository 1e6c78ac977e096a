pub mod errors;
pub mod http;
pub mod link;
pub mod options;
pub mod quality;
pub mod resolver;
pub mod stream;
pub mod user_agent;
pub mod wbi;

pub use errors::BiliApiError;
pub use http::{ApiClient, HttpFetch};
pub use options::ResolveOptions;
pub use resolver::{BiliResolver, PlayInfo, QualityReport, VideoIdentity};
pub use stream::ResolvedSources;
pub use wbi::WbiSigner;
