pub mod config;
pub mod event;
pub mod gateway;
pub mod logging;
pub mod proxy;
pub mod supervisor;
