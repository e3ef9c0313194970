pub mod local;
pub mod snode_http;
