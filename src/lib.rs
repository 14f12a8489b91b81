pub mod api;
pub mod bus;
pub mod clock;
pub mod codec;
pub mod config;
pub mod coordination;
pub mod events;
pub mod hold_gate;
pub mod metrics;
pub mod persistence;
pub mod risk_watchdog;
pub mod shutdown;
pub mod signals;
pub mod topics;
