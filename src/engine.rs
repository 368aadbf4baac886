// =============================================================================
// MarketCore — composition root for the market-data and execution core
// =============================================================================
//
// Owns the single long-lived instances (clock synchroniser, subscription
// registry, order queue) and builds one pipeline per tracked symbol: tick
// windows, ingestor, minute roll-up, period tracker, and insight engine,
// each with its scheduled loop. Dependents receive handles instead of
// reaching for globals.
//
// Every loop holds a child cancellation token; `shutdown()` cancels the root
// and in-flight passes finish before their loops exit.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::Duration;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregator::{run_timeframe, PeriodSnapshot, PeriodTracker};
use crate::clock::ClockSynchronizer;
use crate::config::CoreConfig;
use crate::events::{CoreEvent, EventBus};
use crate::execution::{OrderExecutionQueue, OrderResult};
use crate::insight::{InsightEngine, InsightState};
use crate::market_data::{TickCompactor, TickWindow, TradeEventIngestor};
use crate::subscription::SubscriptionRegistry;
use crate::transport::{ExchangeTransport, FeedSink};
use crate::types::{OrderRequest, Timeframe};

/// Everything the core maintains for one tracked symbol.
pub struct SymbolPipeline {
    pub seconds: Arc<TickWindow>,
    pub minutes: Arc<TickWindow>,
    pub hours: Arc<TickWindow>,
    pub ingestor: Arc<TradeEventIngestor>,
    pub tracker: Arc<PeriodTracker>,
    pub insight: Arc<InsightEngine>,
    cancel: CancellationToken,
}

pub struct MarketCore {
    config: CoreConfig,
    transport: Arc<dyn ExchangeTransport>,
    pub clock: Arc<ClockSynchronizer>,
    pub registry: Arc<SubscriptionRegistry>,
    pub orders: Arc<OrderExecutionQueue>,
    pipelines: RwLock<HashMap<String, Arc<SymbolPipeline>>>,
    bus: EventBus,
    cancel: CancellationToken,
}

impl MarketCore {
    pub fn new(config: CoreConfig, transport: Arc<dyn ExchangeTransport>) -> Arc<Self> {
        let bus = EventBus::default();
        let clock = Arc::new(ClockSynchronizer::new(config.clock_recalibration()));
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&transport),
            bus.clone(),
        ));
        let orders = Arc::new(OrderExecutionQueue::new(bus.clone()));

        Arc::new(Self {
            config,
            transport,
            clock,
            registry,
            orders,
            pipelines: RwLock::new(HashMap::new()),
            bus,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the symbol-independent loops: clock recalibration and order
    /// processing.
    pub fn start(&self) {
        tokio::spawn(Arc::clone(&self.clock).run(
            Arc::clone(&self.transport),
            self.cancel.child_token(),
        ));
        tokio::spawn(Arc::clone(&self.orders).run(
            Arc::clone(&self.transport),
            self.config.order_tick(),
            self.cancel.child_token(),
        ));
        info!("market core started");
    }

    /// Register `owner_tag` on `symbol`'s live feed, building the full
    /// aggregation pipeline on first ownership.
    pub fn track_symbol(&self, symbol: &str, owner_tag: &str) -> Result<Arc<SymbolPipeline>> {
        let pipeline = {
            let mut pipelines = self.pipelines.write();
            match pipelines.get(symbol) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let built = self.build_pipeline(symbol);
                    pipelines.insert(symbol.to_string(), Arc::clone(&built));
                    built
                }
            }
        };

        let (status_tx, status_rx) = mpsc::unbounded_channel();
        self.registry.add_owner(
            symbol,
            owner_tag,
            false,
            FeedSink {
                trades: pipeline.ingestor.sender(),
                status: status_tx,
            },
        )?;
        self.spawn_status_pump(symbol.to_string(), status_rx, pipeline.cancel.clone());
        Ok(pipeline)
    }

    /// Release one ownership of `symbol`. When the feed is torn down the
    /// whole pipeline is dismantled and its loops cancelled.
    pub fn untrack_symbol(&self, symbol: &str, owner_tag: &str) {
        if self.registry.remove_owner(symbol, owner_tag) {
            self.drop_pipeline(symbol);
        }
    }

    /// Record the currently selected symbol; the registry protects it from
    /// feed teardown across a mode switch. A previously protected pipeline
    /// whose feed is swept here is dismantled as well.
    pub fn select_symbol(&self, symbol: Option<&str>) {
        self.registry.set_selected(symbol);

        let orphans: Vec<String> = self
            .pipelines
            .read()
            .keys()
            .filter(|sym| {
                Some(sym.as_str()) != symbol && self.registry.owner_count(sym) == 0
            })
            .cloned()
            .collect();
        for sym in orphans {
            self.drop_pipeline(&sym);
        }
    }

    pub fn snapshot(&self, symbol: &str, timeframe: Timeframe) -> Option<PeriodSnapshot> {
        self.pipelines
            .read()
            .get(symbol)
            .and_then(|p| p.tracker.snapshot(timeframe))
    }

    pub fn insight(&self, symbol: &str) -> Option<InsightState> {
        self.pipelines
            .read()
            .get(symbol)
            .map(|p| p.insight.snapshot())
    }

    pub fn pipeline(&self, symbol: &str) -> Option<Arc<SymbolPipeline>> {
        self.pipelines.read().get(symbol).cloned()
    }

    pub fn enqueue_order(&self, request: OrderRequest) -> Result<()> {
        self.orders.enqueue(request)
    }

    pub fn set_order_tracking_sink(&self, sink: mpsc::UnboundedSender<(u64, OrderResult)>) {
        self.orders.set_tracking_sink(sink);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.bus.subscribe()
    }

    /// Cancel every loop and close every feed. In-flight passes finish
    /// before their loops exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for pipeline in self.pipelines.write().drain().map(|(_, p)| p) {
            pipeline.cancel.cancel();
        }
        self.registry.close_all();
        info!("market core shut down");
    }

    // -----------------------------------------------------------------------
    // Pipeline assembly
    // -----------------------------------------------------------------------

    fn build_pipeline(&self, symbol: &str) -> Arc<SymbolPipeline> {
        let cfg = &self.config;
        let cancel = self.cancel.child_token();

        let seconds = Arc::new(TickWindow::new("seconds"));
        let minutes = Arc::new(TickWindow::new("minutes"));
        let hours = Arc::new(TickWindow::new("hours"));

        let ingestor = Arc::new(TradeEventIngestor::new(
            symbol,
            vec![Arc::clone(&seconds)],
            cfg.drain_budget(),
        ));
        let compactor = Arc::new(TickCompactor::new(
            Arc::clone(&seconds),
            vec![Arc::clone(&minutes), Arc::clone(&hours)],
            Duration::seconds(cfg.rollup_interval_secs as i64),
        ));
        let tracker = Arc::new(PeriodTracker::new(symbol));
        let insight = Arc::new(InsightEngine::new(
            StdDuration::from_secs(cfg.ready_after_secs),
            StdDuration::from_secs(cfg.ready_fifteen_after_secs),
        ));

        tokio::spawn(Arc::clone(&ingestor).run(
            Arc::clone(&self.clock),
            cfg.drain_interval(),
            cancel.clone(),
        ));
        tokio::spawn(Arc::clone(&compactor).run(
            Arc::clone(&self.clock),
            StdDuration::from_secs(cfg.rollup_interval_secs),
            cancel.clone(),
        ));

        for timeframe in Timeframe::ALL {
            let (window, eval_secs) = match timeframe {
                Timeframe::Minute => (Arc::clone(&seconds), cfg.minute_eval_secs),
                Timeframe::FiveMinutes => (Arc::clone(&minutes), cfg.five_eval_secs),
                Timeframe::FifteenMinutes => (Arc::clone(&minutes), cfg.fifteen_eval_secs),
                Timeframe::Hour => (Arc::clone(&hours), cfg.hour_eval_secs),
            };
            tokio::spawn(run_timeframe(
                Arc::clone(&tracker),
                window,
                timeframe,
                StdDuration::from_secs(eval_secs),
                Arc::clone(&self.clock),
                self.bus.clone(),
                cancel.clone(),
            ));
        }

        tokio::spawn(Arc::clone(&insight).run(
            Arc::clone(&tracker),
            StdDuration::from_secs(cfg.insight_interval_secs),
            self.bus.clone(),
            cancel.clone(),
        ));

        self.spawn_prune_loop(
            [
                (Arc::clone(&seconds), cfg.seconds_retention_secs),
                (Arc::clone(&minutes), cfg.minutes_retention_secs),
                (Arc::clone(&hours), cfg.hours_retention_secs),
            ],
            StdDuration::from_secs(cfg.prune_interval_secs),
            cancel.clone(),
        );

        info!(symbol, "symbol pipeline built");
        Arc::new(SymbolPipeline {
            seconds,
            minutes,
            hours,
            ingestor,
            tracker,
            insight,
            cancel,
        })
    }

    fn spawn_prune_loop(
        &self,
        windows: [(Arc<TickWindow>, u64); 3],
        interval: StdDuration,
        cancel: CancellationToken,
    ) {
        let clock = Arc::clone(&self.clock);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = clock.estimate_now();
                        for (window, retention_secs) in &windows {
                            window.prune(Duration::seconds(*retention_secs as i64), now);
                        }
                    }
                }
            }
        });
    }

    /// Forward transport connection-status callbacks into the registry's
    /// state machine.
    fn spawn_status_pump(
        &self,
        symbol: String,
        mut status_rx: mpsc::UnboundedReceiver<crate::types::ConnectionState>,
        cancel: CancellationToken,
    ) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    state = status_rx.recv() => {
                        match state {
                            Some(state) => registry.on_status(&symbol, state),
                            None => break,
                        }
                    }
                }
            }
        });
    }

    fn drop_pipeline(&self, symbol: &str) {
        if let Some(pipeline) = self.pipelines.write().remove(symbol) {
            pipeline.cancel.cancel();
            pipeline.insight.clear();
            info!(symbol, "symbol pipeline dismantled");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::types::RawTradeEvent;
    use rust_decimal_macros::dec;

    fn trade(price: rust_decimal::Decimal, at: chrono::DateTime<chrono::Utc>) -> RawTradeEvent {
        RawTradeEvent {
            symbol: "BTCUSDT".into(),
            price,
            quantity: dec!(1),
            trade_id: 1,
            event_time: at,
        }
    }

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    #[tokio::test(start_paused = true)]
    async fn trades_flow_into_snapshots_end_to_end() {
        init_test_tracing();
        let transport = MockTransport::new();
        let core = MarketCore::new(CoreConfig::default(), transport.clone());
        core.start();

        let pipeline = core.track_symbol("BTCUSDT", "chart").unwrap();
        assert_eq!(transport.feeds_opened.lock().len(), 1);

        // Feed a few trades and let the drain + evaluation loops run.
        let sender = pipeline.ingestor.sender();
        for step in 0u32..3 {
            sender
                .send(trade(
                    dec!(100) + rust_decimal::Decimal::from(step),
                    core.clock.estimate_now(),
                ))
                .unwrap();
            tokio::time::sleep(StdDuration::from_millis(1_100)).await;
        }
        tokio::time::sleep(StdDuration::from_secs(2)).await;

        assert!(!pipeline.seconds.is_empty());
        let snapshot = core.snapshot("BTCUSDT", Timeframe::Minute).unwrap();
        assert!(snapshot.volume >= dec!(1));

        core.shutdown();
        assert_eq!(transport.closed_count("BTCUSDT"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn untracking_the_last_owner_dismantles_the_pipeline() {
        let transport = MockTransport::new();
        let core = MarketCore::new(CoreConfig::default(), transport.clone());
        core.start();

        core.track_symbol("BTCUSDT", "chart").unwrap();
        core.track_symbol("BTCUSDT", "order-panel").unwrap();
        assert_eq!(transport.feeds_opened.lock().len(), 1);

        core.untrack_symbol("BTCUSDT", "chart");
        assert!(core.pipeline("BTCUSDT").is_some());

        core.untrack_symbol("BTCUSDT", "order-panel");
        assert!(core.pipeline("BTCUSDT").is_none());
        assert_eq!(transport.closed_count("BTCUSDT"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn selected_symbol_keeps_its_pipeline_until_deselected() {
        let transport = MockTransport::new();
        let core = MarketCore::new(CoreConfig::default(), transport.clone());
        core.start();

        core.select_symbol(Some("BTCUSDT"));
        core.track_symbol("BTCUSDT", "chart").unwrap();

        core.untrack_symbol("BTCUSDT", "chart");
        assert!(core.pipeline("BTCUSDT").is_some());
        assert_eq!(transport.closed_count("BTCUSDT"), 0);

        core.select_symbol(None);
        assert!(core.pipeline("BTCUSDT").is_none());
        assert_eq!(transport.closed_count("BTCUSDT"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn orders_flow_through_the_queue_loop() {
        let transport = MockTransport::new();
        let core = MarketCore::new(CoreConfig::default(), transport.clone());
        core.start();

        let mut events = core.subscribe_events();
        core.enqueue_order(OrderRequest::market(
            "BTCUSDT",
            crate::types::OrderSide::Buy,
            dec!(1),
        ))
        .unwrap();

        tokio::time::sleep(StdDuration::from_millis(500)).await;
        assert_eq!(transport.placed.lock().len(), 1);

        let mut saw_completion = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CoreEvent::OrderCompleted { .. }) {
                saw_completion = true;
            }
        }
        assert!(saw_completion);

        core.shutdown();
    }
}
