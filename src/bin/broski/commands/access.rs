//! Access command - feature gate status for an address

use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, address: &str, features: &[String]) -> Result<()> {
    super::check_address(address)?;
    print_header("Feature Access");

    println!("Address: {}", style_cyan(address));
    println!();

    let client = crate::client::BroskiClient::new(server);
    let results = client.check_access(address, features).await?;

    for (feature, result) in &results {
        if result.can_access {
            print_success(&format!("{:<24} {}", feature, style_dim(&result.reason)));
        } else {
            println!(
                "{} {:<24} {}",
                style_red("✗"),
                feature,
                style_dim(&result.reason)
            );
        }
    }

    Ok(())
}
