pub mod ca;
pub mod capture;
pub mod codec;
pub mod forward;
pub mod proxy;
pub mod record;
pub mod replay;
pub mod tls;
mod tunnel;

// rustls types appear in this crate's API
pub use rustls;

pub use crate::{
    proxy::Proxy,
    record::{
        CapturedRequest,
        RequestSink,
        Scheme,
    },
    replay::Replayer,
};
