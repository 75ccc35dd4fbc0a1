//! Ledger audit: replays every stock key from the transaction log and compares
//! the result with the `stock_balances` hint table.
//!
//! Usage: `fleetshop-audit [--repair]`
//!
//! Exits non-zero when drift was found and not repaired.

use anyhow::{Context, bail};
use tracing::{info, warn};

use fleetshop_infra::ledger_store::MaterializedBalance;
use fleetshop_infra::{AppConfig, LedgerStore, PostgresLedgerStore};
use fleetshop_inventory::StockFold;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    fleetshop_observability::init(&config.log);

    let repair = std::env::args().skip(1).any(|arg| arg == "--repair");

    let Some(url) = config.database.url.as_deref() else {
        bail!("FLEETSHOP__DATABASE__URL is not set; the audit needs the Postgres ledger");
    };
    let store = PostgresLedgerStore::connect(url, config.database.max_connections)
        .await
        .context("connecting to the ledger database")?;

    let keys = store.keys().await?;
    let mut drifted = 0usize;

    for key in &keys {
        let history = store.list_by_key(*key, None).await?;
        let fold = StockFold::replay(*key, &history)
            .with_context(|| format!("replaying {key}"))?;
        let replayed = MaterializedBalance {
            key: *key,
            balance: fold.balance(),
            last_sequence: fold.last_sequence().unwrap_or(0),
        };

        let cached = store.materialized_balance(*key).await?;
        if cached == Some(replayed) {
            continue;
        }

        drifted += 1;
        warn!(
            %key,
            cached_on_hand = cached.map(|c| c.balance.on_hand),
            cached_reserved = cached.map(|c| c.balance.reserved),
            on_hand = replayed.balance.on_hand,
            reserved = replayed.balance.reserved,
            "materialized balance drifted from the ledger"
        );

        if repair {
            store.store_materialized_balance(replayed).await?;
            info!(%key, "materialized balance repaired");
        }
    }

    info!(keys = keys.len(), drifted, repaired = repair, "ledger audit finished");

    if drifted > 0 && !repair {
        bail!("{drifted} of {} stock keys drifted; rerun with --repair", keys.len());
    }
    Ok(())
}
