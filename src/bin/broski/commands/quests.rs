//! Quest commands

use crate::style::*;
use anyhow::Result;

pub async fn list(server: &str, address: Option<&str>) -> Result<()> {
    if let Some(address) = address {
        super::check_address(address)?;
    }
    print_header("Quests");

    let client = crate::client::BroskiClient::new(server);
    let quests = client.get_quests(address).await?;

    if quests.is_empty() {
        print_info("No quests configured.");
        return Ok(());
    }

    for quest in &quests {
        println!();
        let title = format!("{} {}", quest.emoji, quest.title);
        if quest.completed {
            println!("{}  {}", style_green(&title), style_dim("(claimed)"));
        } else {
            println!("{}", style_bold(&title));
        }
        println!("   {}", quest.description);
        println!(
            "   {} {}/{}   reward: {} BROski$   id: {}",
            progress_bar(quest.progress, quest.required, 20),
            quest.progress,
            quest.required,
            quest.reward,
            style_dim(&quest.id)
        );
    }

    if address.is_none() {
        println!();
        print_info("Pass --address to see your progress.");
    }

    Ok(())
}

pub async fn claim(server: &str, quest_id: &str, address: &str) -> Result<()> {
    super::check_address(address)?;

    let client = crate::client::BroskiClient::new(server);
    let response = client.claim_quest(quest_id, address).await?;

    print_success(&response.message);
    println!(
        "Reward: {} BROski$ (payout {})",
        response.reward_amount, response.payout_status
    );
    if let Some(tx_hash) = response.payout_tx_hash {
        println!("Transaction: {}", style_dim(&tx_hash));
    }

    Ok(())
}
