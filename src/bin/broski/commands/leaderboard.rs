//! Leaderboard command

use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, timeframe: &str, limit: usize) -> Result<()> {
    print_header(&format!("BROski$ Leaderboard ({})", timeframe));

    let client = crate::client::BroskiClient::new(server);

    match client.get_leaderboard(timeframe, limit).await {
        Ok(entries) => {
            if entries.is_empty() {
                print_info("No deployments in this window yet.");
                return Ok(());
            }

            println!();
            println!(
                "{:>4}  {:<2}  {:<16}  {:>11}  {:>10}",
                "Rank", "", "Address", "Deployments", "Earned"
            );
            println!("{}", "─".repeat(52));

            for entry in &entries {
                let rank = format!("#{}", entry.rank);
                let rank_styled = if entry.rank == 1 {
                    style_yellow(&rank)
                } else if entry.rank <= 3 {
                    style_cyan(&rank)
                } else {
                    rank
                };

                println!(
                    "{:>4}  {:<2}  {:<16}  {:>11}  {:>10}",
                    rank_styled,
                    entry.badge,
                    short_address(&entry.address),
                    entry.deployments,
                    entry.earned
                );
            }

            println!();
            println!("Total deployers: {}", entries.len());
        }
        Err(e) => {
            print_error(&format!("Failed to fetch leaderboard: {}", e));
        }
    }

    Ok(())
}
