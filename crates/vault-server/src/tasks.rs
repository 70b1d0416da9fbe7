//! Background work that runs beside the HTTP server: rolling-history
//! cleanup and the chatroom → council → paper-trading pipeline.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vault_coordination::bridge::{CouncilOutcome, CouncilTrigger, TriggerSource};
use vault_coordination::chatroom::CleanupReport;
use vault_coordination::council::DetailedConsensus;
use vault_coordination::events::{next_event, VaultEvent};
use vault_coordination::kv::KvResult;
use vault_coordination::market::MarketFeed;
use vault_coordination::now_ms;
use vault_coordination::trading::{should_execute, Trade, TradingResult};

use crate::state::AppState;

pub fn spawn_all(app: &AppState, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(history_cleanup_loop(app.clone(), cancel.clone())),
        tokio::spawn(bridge_listener(app.clone(), cancel.clone())),
    ]
}

// ── Rolling history ──

/// Run a cleanup when one is due; `None` when it was not.
pub async fn cleanup_if_due(app: &AppState, now: i64) -> KvResult<Option<CleanupReport>> {
    if !app.history.cleanup_due(now).await? {
        return Ok(None);
    }
    app.history.cleanup(now).await.map(Some)
}

pub async fn history_cleanup_loop(app: AppState, cancel: CancellationToken) {
    let period = Duration::from_millis(app.history.config().cleanup_interval_ms.max(1_000) as u64);
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match cleanup_if_due(&app, now_ms()).await {
            Ok(Some(report)) => debug!(removed = report.removed, "scheduled cleanup finished"),
            Ok(None) => debug!("history cleanup not due"),
            Err(e) => warn!(error = %e, "history cleanup failed"),
        }
    }
    debug!("history cleanup loop stopped");
}

// ── Council bridge ──

pub async fn bridge_listener(app: AppState, cancel: CancellationToken) {
    let mut rx = app.bus.subscribe();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = next_event(&mut rx) => event,
        };
        match event {
            Ok(VaultEvent::ConsensusUpdated(update)) => {
                if let Some(trigger) = app.bridge.handle_consensus_update(&update, now_ms()) {
                    let app = app.clone();
                    tokio::spawn(async move {
                        evaluate_trigger(&app, trigger).await;
                    });
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "event bus closed, bridge listener exiting");
                break;
            }
        }
    }
    debug!("bridge listener stopped");
}

/// Run the council for a chatroom trigger and act on the verdict.
pub async fn evaluate_trigger(app: &AppState, trigger: CouncilTrigger) -> Option<CouncilOutcome> {
    let detailed = match app.council.run(&trigger.asset, Some(&trigger.context)).await {
        Ok(detailed) => detailed,
        Err(e) => {
            warn!(asset = %trigger.asset, error = %e, "council run failed");
            app.bridge.abandon_pending();
            return None;
        }
    };
    let outcome = app
        .bridge
        .record_council_result(detailed, TriggerSource::Chatroom, now_ms());

    if app.config.trading.auto_execute {
        if let Err(e) = apply_verdict(app, &outcome.consensus, &trigger.asset, now_ms()).await {
            warn!(asset = %trigger.asset, error = %e, "paper trading skipped");
        }
    }
    Some(outcome)
}

/// Close positions the verdict reverses, then open one in its direction.
///
/// Returns the closed trades and the newly opened one, if any.
pub async fn apply_verdict(
    app: &AppState,
    detailed: &DetailedConsensus,
    asset: &str,
    now: i64,
) -> TradingResult<(Vec<Trade>, Option<Trade>)> {
    let signal = match detailed.consensus_signal {
        Some(signal) if should_execute(detailed) => signal,
        _ => {
            debug!(status = detailed.consensus_status.as_str(), "verdict not tradeable");
            return Ok((Vec::new(), None));
        }
    };
    let price = app.market.price(asset).await?;
    let closed = app.trader.auto_close_on_reversal(signal, price, now).await?;
    let opened = app.trader.execute(detailed, asset, now).await?;
    Ok((closed, Some(opened)))
}
