pub mod bridge;
pub mod objects;
pub mod pkt;
pub mod smart_http;
