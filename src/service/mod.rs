pub mod http;
pub mod supervisor;
