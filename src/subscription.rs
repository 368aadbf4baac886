// =============================================================================
// Subscription Registry — reference-counted live ticker feeds
// =============================================================================
//
// A feed is shared by owner *tags*, not a bare integer count: duplicate tags
// from the same owner are deduplicated unless the caller explicitly allows
// them, so a naive counter cannot replicate the semantics. The transport
// subscription opens lazily with the first owner and is torn down
// synchronously, exactly once, when the tag list empties — unless the symbol
// is the currently selected one, which is deliberately kept alive across a
// mode switch.
//
// Connection state advances one-directionally on transport callbacks;
// re-announcing the current state is a no-op and emits no duplicate event.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::events::{CoreEvent, EventBus};
use crate::transport::{ExchangeTransport, FeedHandle, FeedSink};
use crate::types::ConnectionState;

/// One live feed with its owner tags and connection state.
struct TickerSubscription {
    feed: Box<dyn FeedHandle>,
    owners: Vec<String>,
    state: ConnectionState,
}

pub struct SubscriptionRegistry {
    transport: Arc<dyn ExchangeTransport>,
    subs: Mutex<HashMap<String, TickerSubscription>>,
    /// The symbol currently selected in the application; protected from
    /// teardown even when its owner set empties.
    selected: Mutex<Option<String>>,
    bus: EventBus,
}

impl SubscriptionRegistry {
    pub fn new(transport: Arc<dyn ExchangeTransport>, bus: EventBus) -> Self {
        Self {
            transport,
            subs: Mutex::new(HashMap::new()),
            selected: Mutex::new(None),
            bus,
        }
    }

    /// Register `owner_tag` as a consumer of `symbol`'s live feed, opening
    /// the transport subscription on first ownership.
    ///
    /// A tag already present for the symbol is deduplicated unless
    /// `allow_duplicate` is set.
    pub fn add_owner(
        &self,
        symbol: &str,
        owner_tag: &str,
        allow_duplicate: bool,
        sink: FeedSink,
    ) -> Result<()> {
        let mut subs = self.subs.lock();

        if let Some(sub) = subs.get_mut(symbol) {
            if !allow_duplicate && sub.owners.iter().any(|t| t == owner_tag) {
                debug!(symbol, owner = owner_tag, "duplicate owner tag deduplicated");
                return Ok(());
            }
            sub.owners.push(owner_tag.to_string());
            debug!(symbol, owner = owner_tag, owners = sub.owners.len(), "feed owner added");
            return Ok(());
        }

        let feed = self
            .transport
            .open_trade_feed(symbol, sink)
            .with_context(|| format!("failed to open trade feed for {symbol}"))?;
        subs.insert(
            symbol.to_string(),
            TickerSubscription {
                feed,
                owners: vec![owner_tag.to_string()],
                state: ConnectionState::Disconnected,
            },
        );
        info!(symbol, owner = owner_tag, "ticker feed opened");
        Ok(())
    }

    /// Release one ownership of `symbol`. Returns true when the feed was
    /// torn down as a result.
    ///
    /// Removing an owner that never registered is a contract error: logged
    /// and ignored without touching the tag list.
    pub fn remove_owner(&self, symbol: &str, owner_tag: &str) -> bool {
        let mut subs = self.subs.lock();

        let Some(sub) = subs.get_mut(symbol) else {
            warn!(symbol, owner = owner_tag, "remove_owner for an unknown symbol ignored");
            return false;
        };
        let Some(position) = sub.owners.iter().position(|t| t == owner_tag) else {
            warn!(symbol, owner = owner_tag, "remove_owner for a never-registered owner ignored");
            return false;
        };
        sub.owners.remove(position);

        if !sub.owners.is_empty() {
            debug!(symbol, owner = owner_tag, owners = sub.owners.len(), "feed owner removed");
            return false;
        }
        if self.selected.lock().as_deref() == Some(symbol) {
            debug!(symbol, "owner set empty but symbol is selected; teardown deferred");
            return false;
        }

        if let Some(sub) = subs.remove(symbol) {
            sub.feed.close();
        }
        info!(symbol, "ticker feed torn down");
        self.bus.publish(CoreEvent::FeedStatusChanged {
            symbol: symbol.to_string(),
            state: ConnectionState::Closed,
        });
        true
    }

    /// Record the application's currently selected symbol. A feed whose
    /// owner set already emptied while protected is swept as soon as it is
    /// no longer the selection.
    pub fn set_selected(&self, symbol: Option<&str>) {
        *self.selected.lock() = symbol.map(str::to_string);

        let mut subs = self.subs.lock();
        let orphans: Vec<String> = subs
            .iter()
            .filter(|(sym, sub)| sub.owners.is_empty() && Some(sym.as_str()) != symbol)
            .map(|(sym, _)| sym.clone())
            .collect();
        for sym in orphans {
            if let Some(sub) = subs.remove(&sym) {
                sub.feed.close();
            }
            info!(symbol = %sym, "deferred ticker feed teardown completed");
            self.bus.publish(CoreEvent::FeedStatusChanged {
                symbol: sym,
                state: ConnectionState::Closed,
            });
        }
    }

    pub fn selected(&self) -> Option<String> {
        self.selected.lock().clone()
    }

    /// Transport connection-status callback. Idempotent: re-announcing the
    /// current state emits no duplicate notification.
    pub fn on_status(&self, symbol: &str, state: ConnectionState) {
        let mut subs = self.subs.lock();
        let Some(sub) = subs.get_mut(symbol) else {
            debug!(symbol, state = %state, "status for an untracked symbol ignored");
            return;
        };
        if sub.state == state {
            return;
        }
        sub.state = state;
        info!(symbol, state = %state, "feed status changed");
        self.bus.publish(CoreEvent::FeedStatusChanged {
            symbol: symbol.to_string(),
            state,
        });
    }

    pub fn owner_count(&self, symbol: &str) -> usize {
        self.subs
            .lock()
            .get(symbol)
            .map_or(0, |sub| sub.owners.len())
    }

    pub fn connection_state(&self, symbol: &str) -> Option<ConnectionState> {
        self.subs.lock().get(symbol).map(|sub| sub.state)
    }

    /// Close every open feed; used on shutdown.
    pub fn close_all(&self) {
        let mut subs = self.subs.lock();
        for (symbol, sub) in subs.drain() {
            sub.feed.close();
            info!(symbol = %symbol, "ticker feed closed on shutdown");
        }
    }
}
