// Core engine for the Gantry proxy
// Event loop, load balancing, session forwarding and the admin applet

pub mod admin;
pub mod buffer;
pub mod error;
pub mod fd;
pub mod lb;
pub mod listener;
pub mod net;
pub mod poller;
pub mod proxy;
pub mod queue;
pub mod rules;
pub mod server;
pub mod session;
pub mod signal;
pub mod slots;
pub mod stats;
pub mod stream;
pub mod task;
pub mod ticks;
pub mod timer;
pub mod worker;

pub use error::{Error, Result};
pub use signal::ProxySignal;
pub use worker::Worker;
