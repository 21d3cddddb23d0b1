pub(crate) mod http;
pub mod sse;
