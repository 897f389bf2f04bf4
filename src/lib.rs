//! Greenhouse and grow room controller: polls sensors, drives relays,
//! runs PID loops and timers, and fires conditional actions.
pub mod clock;
pub mod conditional;
pub mod config;
pub mod controllers;
pub mod daemon;
pub mod drivers;
pub mod gpio;
pub mod lock;
pub mod metrics;
pub mod notify;
pub mod rpc;
pub mod store;
