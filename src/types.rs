// =============================================================================
// Shared types used across the Helios market-data and execution core
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A single raw trade delivered by the exchange transport. Consumed by the
/// ingestor's coalescing pass and discarded afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTradeEvent {
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Exchange-assigned trade id.
    pub trade_id: u64,
    pub event_time: DateTime<Utc>,
}

/// One coalesced summary of raw trades (or, for higher timeframes, of
/// lower-timeframe ticks) over a short fixed interval. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedTick {
    /// Arithmetic mean of the batch prices — not volume-weighted.
    pub average: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// The lookback classes the aggregation pipeline maintains per symbol.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    /// Shortest span, evaluated from the seconds window.
    Minute,
    FiveMinutes,
    FifteenMinutes,
    Hour,
}

impl Timeframe {
    /// The summarisation span for this timeframe.
    pub fn lookback(&self) -> Duration {
        match self {
            Self::Minute => Duration::minutes(1),
            Self::FiveMinutes => Duration::minutes(5),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::Hour => Duration::minutes(60),
        }
    }

    pub const ALL: [Timeframe; 4] = [
        Timeframe::Minute,
        Timeframe::FiveMinutes,
        Timeframe::FifteenMinutes,
        Timeframe::Hour,
    ];
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minute => write!(f, "1m"),
            Self::FiveMinutes => write!(f, "5m"),
            Self::FifteenMinutes => write!(f, "15m"),
            Self::Hour => write!(f, "1h"),
        }
    }
}

// ---------------------------------------------------------------------------
// Live feed lifecycle
// ---------------------------------------------------------------------------

/// Connection state of a live ticker feed, driven one-directionally by
/// transport status callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Which account the order trades against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Spot,
    Margin,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Spot
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "Spot"),
            Self::Margin => write!(f, "Margin"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "Market"),
            Self::Limit => write!(f, "Limit"),
        }
    }
}

/// A submission request consumed exactly once by the execution queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub quantity: Decimal,
    /// Required for `OrderKind::Limit`, ignored for market orders.
    pub limit_price: Option<Decimal>,
    pub mode: TradingMode,
    /// Borrow the traded asset before placing (margin only).
    pub borrow: bool,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Zero means fire-and-forget; any other value is forwarded to the
    /// caller's execution-tracking sink together with the result.
    pub correlation_id: u64,
    /// Locally generated id used for log correlation.
    pub client_id: Uuid,
}

impl OrderRequest {
    /// Build a market order with a fresh client id.
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            limit_price: None,
            mode: TradingMode::default(),
            borrow: false,
            side,
            kind: OrderKind::Market,
            correlation_id: 0,
            client_id: Uuid::new_v4(),
        }
    }

    /// Build a limit order with a fresh client id.
    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            limit_price: Some(limit_price),
            mode: TradingMode::default(),
            borrow: false,
            side,
            kind: OrderKind::Limit,
            correlation_id: 0,
            client_id: Uuid::new_v4(),
        }
    }
}

/// Fill data returned by the transport for a successfully placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub exchange_order_id: u64,
    pub filled_quantity: Decimal,
    pub fill_price: Decimal,
}
