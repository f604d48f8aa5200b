pub mod api;
pub mod browser;
pub mod ca;
pub mod cache;
pub mod config;
pub mod csp;
pub mod event_log;
pub mod fingerprint;
pub mod intercept;
pub mod logging;
pub mod proxy;
pub mod record;
pub mod session;
pub mod tunnel;
pub mod upstream;
