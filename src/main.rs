//! Demo binary: spin up a chain, mine some blocks, optionally move coins
//! between two wallets, print the resulting state.

use anyhow::Context;
use clap::Parser;

use ironbit_chain::blockchain::reward::COIN;
use ironbit_chain::consensus::pow::Miner;
use ironbit_chain::wallet::{Wallet, DEFAULT_FEE};
use ironbit_chain::Blockchain;

#[derive(Debug, Parser)]
#[command(name = "ironbit-chain", about = "Educational Bitcoin-compatible blockchain node")]
struct Cli {
    /// Number of blocks to mine.
    #[arg(long, default_value_t = 5)]
    blocks: usize,

    /// Use production (mainnet) difficulty parameters instead of the
    /// development preset. Expect mining to take a very long time.
    #[arg(long)]
    production: bool,

    /// After mining, send this many satoshis to a second wallet and mine
    /// one more block to confirm.
    #[arg(long)]
    send: Option<i64>,

    /// Export the final chain state to this JSON file.
    #[arg(long)]
    export: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut chain = if cli.production {
        Blockchain::production()
    } else {
        Blockchain::development()
    };

    let mut miner_wallet = Wallet::new("miner");
    let miner_address = miner_wallet.generate_address();
    let payout_script = miner_wallet
        .keypair(&miner_address)
        .expect("freshly generated address")
        .pubkey_script();

    log::info!("mining {} blocks to {miner_address}", cli.blocks);
    let mut miner = Miner::new();
    for _ in 0..cli.blocks {
        let block = chain
            .mine_next_block(&payout_script, &mut miner)
            .context("mining failed")?;
        println!(
            "height {:>4}  {}  ({} txs)",
            chain.chain_height(),
            block.hash(),
            block.transactions.len()
        );
    }

    if let Some(amount) = cli.send {
        let mut recipient = Wallet::new("recipient");
        let recipient_address = recipient.generate_address();

        let tx = miner_wallet
            .send(&mut chain, &recipient_address, amount, DEFAULT_FEE)
            .context("send failed")?;
        println!("sent {amount} satoshis to {recipient_address} (txid {})", tx.txid());

        chain
            .mine_next_block(&payout_script, &mut miner)
            .context("confirmation mining failed")?;
        println!(
            "confirmed; recipient balance: {} satoshis",
            recipient.balance(&chain)
        );
    }

    let stats = chain.utxo_set().stats();
    println!();
    println!("chain height:   {}", chain.chain_height());
    println!("best tip:       {}", chain.best_chain_tip());
    println!("known blocks:   {}", chain.block_count());
    println!("utxo entries:   {}", stats.entries);
    println!(
        "total supply:   {} satoshis ({:.8} coins)",
        stats.total_value,
        stats.total_value as f64 / COIN as f64
    );
    println!(
        "miner balance:  {} satoshis",
        miner_wallet.balance(&chain)
    );
    println!("mempool size:   {}", chain.mempool().len());

    if let Some(path) = cli.export {
        chain.export_to_json(&path).context("export failed")?;
        println!("state exported to {}", path.display());
    }

    Ok(())
}
