use std::sync::Arc;

use vault_coordination::bridge::CouncilBridge;
use vault_coordination::caller::SharedCaller;
use vault_coordination::chatroom::{ChatroomEngine, ChatroomStore, RollingHistory};
use vault_coordination::council::TradingCouncil;
use vault_coordination::events::{EventBus, SharedEventBus};
use vault_coordination::kv::SharedKv;
use vault_coordination::market::SharedFeed;
use vault_coordination::models::ModelRegistry;
use vault_coordination::trading::PaperTrader;

use crate::config::VaultConfig;

/// Everything a handler, stream or background task needs.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<VaultConfig>,
    pub store: ChatroomStore,
    pub engine: Arc<ChatroomEngine>,
    pub history: RollingHistory,
    pub bus: SharedEventBus,
    pub bridge: Arc<CouncilBridge>,
    pub council: Arc<TradingCouncil>,
    pub trader: Arc<PaperTrader>,
    pub market: SharedFeed,
}

impl AppState {
    pub fn new(
        config: VaultConfig,
        kv: SharedKv,
        caller: SharedCaller,
        market: SharedFeed,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        let bus = EventBus::new().shared();
        let store = ChatroomStore::new(kv.clone());
        let engine = ChatroomEngine::new(
            caller.clone(),
            market.clone(),
            store.clone(),
            config.chatroom.clone(),
        );
        let history = RollingHistory::new(store.clone(), config.history);
        let bridge = CouncilBridge::new(config.bridge.clone(), bus.clone());
        let council = TradingCouncil::new(caller, registry);
        let trader = PaperTrader::new(kv, market.clone(), bus.clone())
            .with_position_size(config.trading.position_size);

        Self {
            config: Arc::new(config),
            store,
            engine: Arc::new(engine),
            history,
            bus,
            bridge: Arc::new(bridge),
            council: Arc::new(council),
            trader: Arc::new(trader),
            market,
        }
    }
}
