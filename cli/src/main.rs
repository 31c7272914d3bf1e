use anyhow::Context;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use pool_core::{Page, Pool, PoolId, StakeId, UserId};
use pool_treasury::{Payout, PoolSummary};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod node;

use config::{expand_path, NodeConfig, DEFAULT_CONFIG_PATH};
use node::Node;

#[derive(Parser)]
#[command(name = "pool-node")]
#[command(about = "Staking pool treasury node", version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest treasury transactions and run the accrual scheduler
    Run,

    /// List pools with capacity and liability figures
    Pools {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// List a user's stakes
    Stakes {
        /// User id
        user: UserId,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Pay the reward of a closed stake
    ClaimReward { stake: StakeId },

    /// Pay the insurance of a closed stake whose price dropped past the coating
    ClaimInsurance { stake: StakeId },

    /// Send a closed pool's free reserve back to its owner
    WithdrawReserve {
        pool: PoolId,
        /// Owner user id
        #[arg(long)]
        owner: UserId,
    },

    /// Open or close a pool for new stakes
    SetActive {
        pool: PoolId,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },

    /// Remove an emptied, closed and fully settled pool
    DeletePool { pool: PoolId },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_summary(summary: &PoolSummary) {
    let pool: &Pool = &summary.pool;
    let status = if pool.is_active {
        "open".green().to_string()
    } else {
        "closed".yellow().to_string()
    };
    println!(
        "{} #{} [{}] owner {} token {}",
        "Pool".cyan().bold(),
        pool.id,
        status,
        pool.owner_id,
        pool.token_master.bright_black()
    );
    println!(
        "  reserve {}  temp {}  liability {}",
        pool.reserve.to_string().green(),
        summary.temp_reserve,
        summary.outstanding_liability
    );
    println!(
        "  {}%/day for {} days, coating {}%, commission {}",
        pool.reward_percent,
        pool.period_days,
        pool.insurance_coating_percent,
        if pool.is_commission_paid { "paid" } else { "unpaid" }
    );
    println!(
        "  {} active stakes, principal {}, room {}",
        summary.active_stakes, summary.active_principal, summary.capacity_left
    );
}

fn print_payout(label: &str, payout: &Payout) {
    println!("{} {}", "✓".green(), label.green().bold());
    println!("  Amount:    {}", payout.amount);
    println!("  Recipient: {}", payout.recipient);
    println!("  Tx:        {}", payout.tx_hash.bright_blue());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(expand_path(DEFAULT_CONFIG_PATH)));
    let config = NodeConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    init_logging(&config.log_level);

    let node = Node::build(config)?;
    let ledger = node.ledger().clone();

    match cli.command {
        Command::Run => {
            println!("{}", "Pool Treasury Node".cyan().bold());
            println!("Config file: {}", config_path.display());
            println!("Treasury:    {}\n", node.config().treasury.address);
            node.run().await?;
        }

        Command::Pools { offset, limit } => {
            let pools = ledger.pools(Page::new(offset, limit)).await?;
            if pools.is_empty() {
                println!("{}", "No pools".yellow());
            }
            for pool in pools {
                print_summary(&ledger.pool_summary(pool.id).await?);
            }
        }

        Command::Stakes {
            user,
            offset,
            limit,
        } => {
            let stakes = ledger
                .stakes_by_user(user, Page::new(offset, limit))
                .await?;
            if stakes.is_empty() {
                println!("{}", "No stakes".yellow());
            }
            for stake in stakes {
                let state = if stake.is_reward_paid {
                    "reward paid".bright_black().to_string()
                } else if stake.is_insurance_paid {
                    "insurance paid".bright_black().to_string()
                } else if stake.is_active {
                    "active".green().to_string()
                } else {
                    "awaiting claim".yellow().to_string()
                };
                println!(
                    "{} #{} pool #{} [{}] amount {} balance {} ends {}",
                    "Stake".cyan().bold(),
                    stake.id,
                    stake.pool_id,
                    state,
                    stake.amount,
                    stake.balance,
                    stake.end_date.format("%Y-%m-%d %H:%M UTC")
                );
            }
        }

        Command::ClaimReward { stake } => {
            let payout = node.settlement().claim_reward(stake).await?;
            print_payout("Reward paid", &payout);
        }

        Command::ClaimInsurance { stake } => {
            let payout = node.settlement().claim_insurance(stake).await?;
            print_payout("Insurance paid", &payout);
        }

        Command::WithdrawReserve { pool, owner } => {
            let payout = node.settlement().withdraw_reserve(pool, owner).await?;
            print_payout("Reserve withdrawn", &payout);
        }

        Command::SetActive { pool, active } => {
            let pool = ledger.set_active(pool, active).await?;
            println!(
                "{} Pool #{} is now {}",
                "✓".green(),
                pool.id,
                if pool.is_active { "open" } else { "closed" }
            );
        }

        Command::DeletePool { pool } => {
            ledger.delete_pool(pool).await?;
            println!("{} Pool #{} deleted", "✓".green(), pool);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["pool-node", "--config", "/tmp/c.toml", "run"]).unwrap();
        assert!(matches!(cli.command, Command::Run));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));

        let cli = Cli::try_parse_from(["pool-node", "withdraw-reserve", "3", "--owner", "7"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::WithdrawReserve { pool: 3, owner: 7 }
        ));

        let cli = Cli::try_parse_from(["pool-node", "set-active", "4", "false"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::SetActive {
                pool: 4,
                active: false
            }
        ));

        let cli = Cli::try_parse_from(["pool-node", "pools", "--limit", "5"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Pools {
                offset: 0,
                limit: 5
            }
        ));
    }

    #[test]
    fn test_rejects_bad_arguments() {
        assert!(Cli::try_parse_from(["pool-node", "claim-reward", "abc"]).is_err());
        assert!(Cli::try_parse_from(["pool-node", "withdraw-reserve", "3"]).is_err());
        assert!(Cli::try_parse_from(["pool-node"]).is_err());
    }
}
