// =============================================================================
// helios-core — real-time market-data aggregation & order-execution core
// =============================================================================
//
// The engine room of the Helios trading desktop: clock-offset estimation
// against the exchange, coalescing of the raw trade firehose into sliding
// tick windows, rolling per-timeframe statistics, comparative insight
// signals, reference-counted live feed ownership, and a strictly serialized
// order execution queue.
//
// The GUI, settings storage, and the wire-level exchange client are external
// collaborators; the exchange is reached through the `transport` trait
// boundary, and the presentation layer consumes read-only snapshots plus the
// `events` broadcast.
// =============================================================================

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod execution;
pub mod insight;
pub mod market_data;
pub mod subscription;
pub mod transport;
pub mod types;

pub use aggregator::{PeriodSnapshot, PeriodTracker};
pub use clock::ClockSynchronizer;
pub use config::CoreConfig;
pub use engine::{MarketCore, SymbolPipeline};
pub use events::{CoreEvent, EventBus};
pub use execution::{OrderExecutionQueue, OrderOutcome, OrderResult};
pub use insight::{InsightEngine, InsightState, VolumeLevel};
pub use market_data::{TickWindow, TradeEventIngestor};
pub use subscription::SubscriptionRegistry;
pub use transport::{ExchangeTransport, FeedHandle, FeedSink};
pub use types::{
    AggregatedTick, ConnectionState, OrderFill, OrderKind, OrderRequest, OrderSide,
    RawTradeEvent, Timeframe, TradingMode,
};
