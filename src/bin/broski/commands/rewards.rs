//! Rewards command - reward totals for an address

use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, address: &str) -> Result<()> {
    super::check_address(address)?;
    print_header("BROski$ Rewards");

    println!("Address: {}", style_cyan(address));
    println!();

    let client = crate::client::BroskiClient::new(server);
    let totals = client.get_rewards(address).await?;

    if totals.deployments == 0 && totals.contributions == 0 {
        print_info("No rewards yet. Deploy a contract to earn your first 500 BROski$!");
        return Ok(());
    }

    println!(
        "Deployments:      {}  ({} BROski$)",
        style_bold(&totals.deployments.to_string()),
        totals.deployment_earnings
    );
    println!(
        "Contributions:    {}  ({} BROski$)",
        style_bold(&totals.contributions.to_string()),
        totals.contribution_earnings
    );
    println!();
    println!(
        "Total earned:     {}",
        style_green(&format!("{} BROski$", totals.total_earned))
    );

    Ok(())
}
