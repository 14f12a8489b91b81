// Canonical topic catalog for every agent on the bus.
// Producers and consumers in other languages use these exact strings.

// -----------------------------------------------------------------------------
// TOPICS
// -----------------------------------------------------------------------------

pub const NEWS_RAW: &str = "news_raw";
pub const TRADE_SIGNALS: &str = "trade_signals";
pub const ORDERS: &str = "orders";
pub const FILLS: &str = "fills";

/// Shared event topic: playbooks, catalysts, halts and headlines, tagged by `type`.
pub const PLAYBOOK: &str = "playbook";

pub const ALL_TOPICS: [&str; 5] = [NEWS_RAW, TRADE_SIGNALS, ORDERS, FILLS, PLAYBOOK];

// -----------------------------------------------------------------------------
// CONSUMER GROUPS
// -----------------------------------------------------------------------------

pub const GROUP_WATCHDOG: &str = "watchdog";
pub const GROUP_HOLD_GATE: &str = "hold_gate";
pub const GROUP_SIGNAL_MAKER: &str = "signal_maker";

pub const DEFAULT_CONSUMER: &str = "consumer-1";

// -----------------------------------------------------------------------------
// COORDINATION STORE KEYS
// -----------------------------------------------------------------------------

/// Key prefix of the ticker -> hold expiry map (`holds.AAPL`).
pub const HOLDS_PREFIX: &str = "holds";
pub const NOTIONAL_KEY: &str = "portfolio.notional_usd";
pub const DEFAULT_HALT_KEY: &str = "system_halt";

pub fn hold_key(ticker: &str) -> String {
    format!("{}.{}", HOLDS_PREFIX, ticker)
}
