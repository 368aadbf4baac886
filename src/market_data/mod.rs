// =============================================================================
// Market data — tick storage and trade ingestion
// =============================================================================

pub mod ingestor;
pub mod tick_window;

pub use ingestor::{TickCompactor, TradeEventIngestor};
pub use tick_window::TickWindow;
