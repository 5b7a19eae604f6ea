use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use pow_ledger::blockchain::{Amount, Ledger, LedgerEvent, Node, Wallet};
use pow_ledger::config::SimulationConfig;

/// Creates a payout wallet and a node for it, and starts the node's mining loop
fn spawn_miner(
    ledger: &Arc<Ledger>,
    id: &str,
    delay_scale: f64,
    shutdown: &broadcast::Sender<()>,
) -> anyhow::Result<(Wallet, JoinHandle<()>)> {
    let wallet = Wallet::new(ledger.clone());
    let node = Node::join(
        ledger.clone(),
        id,
        wallet.address().clone(),
        Node::random_cpu_power(),
    )
    .with_context(|| format!("starting {}", id))?;
    let handle = tokio::spawn(node.run(delay_scale, shutdown.subscribe()));
    Ok((wallet, handle))
}

/// Tallies committed and rejected blocks until shutdown
fn spawn_event_tally(
    ledger: &Ledger,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<(usize, usize)> {
    let mut events = ledger.subscribe();
    tokio::spawn(async move {
        let (mut committed, mut rejected) = (0, 0);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Ok(LedgerEvent::BlockCommitted { .. }) => committed += 1,
                    Ok(LedgerEvent::BlockRejected { .. }) => rejected += 1,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Event tally missed {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        (committed, rejected)
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let sim = SimulationConfig::from_env().context("reading simulation settings")?;
    let ledger_config = sim.ledger_config().context("loading ledger config")?;
    info!("Starting simulation: {:?}", sim);
    info!("Ledger parameters: {:?}", ledger_config);

    let ledger = Ledger::new(ledger_config);
    let (shutdown, _) = broadcast::channel(1);
    let tally = spawn_event_tally(&ledger, shutdown.subscribe());

    // Genesis miner
    let (satoshi, genesis_handle) = spawn_miner(&ledger, "miner-0", sim.delay_scale, &shutdown)?;
    let mut handles = vec![genesis_handle];

    let alice = Wallet::new(ledger.clone());
    info!("Genesis wallet {}, payee wallet {}", satoshi.address(), alice.address());

    // Satoshi pays Alice once a second with a shrinking fee
    let payer = satoshi.clone();
    let payee = alice.address().clone();
    let payments = sim.payments;
    handles.push(tokio::spawn(async move {
        for i in 0..payments {
            let fee = Amount::from_units(150_000_000).saturating_sub(Amount::from_units(10_000_000 * u64::from(i)));
            if let Err(err) = payer.make_transaction(&payee, Amount::coins(u64::from(i)), fee) {
                warn!("Payment {} failed: {}", i, err);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }));

    tokio::time::sleep(Duration::from_secs(sim.late_join_seconds)).await;
    for i in 1..sim.miners {
        let (_, handle) = spawn_miner(&ledger, &format!("miner-{}", i), sim.delay_scale, &shutdown)?;
        handles.push(handle);
    }

    tokio::time::sleep(Duration::from_secs(
        sim.run_seconds.saturating_sub(sim.late_join_seconds),
    ))
    .await;

    info!("Shutting down");
    // Receivers may already be gone if every task has finished
    let _ = shutdown.send(());
    for handle in handles {
        if let Err(err) = handle.await {
            warn!("Task ended abnormally: {}", err);
        }
    }
    let (committed, rejected) = tally.await.context("event tally task")?;

    info!(
        "Chain height {} ({} committed, {} rejected), difficulty {}, reward {}",
        ledger.height(),
        committed,
        rejected,
        ledger.difficulty_target(),
        ledger.block_reward()
    );
    info!("Current supply: {}", ledger.get_current_supply());
    info!("Satoshi balance: {}", satoshi.balance());
    info!("Alice balance: {}", alice.balance());
    info!("Chain valid: {}", ledger.is_valid());

    Ok(())
}
