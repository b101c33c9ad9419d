//! BROski Rewards API Client
//!
//! Thin wrapper over the server's `/api` routes.

use anyhow::{anyhow, Result};
use broski_rewards::{AccessResult, LeaderboardEntry, QuestStatus, RewardTotals};
use indexmap::IndexMap;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct BatchAccessRequest<'a> {
    address: &'a str,
    features: &'a [String],
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    address: &'a str,
}

/// Reward response for a claim
#[derive(Debug, Deserialize)]
pub struct ClaimResponse {
    pub reward_amount: u64,
    pub payout_status: String,
    pub payout_tx_hash: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

pub struct BroskiClient {
    client: Client,
    base_url: String,
}

impl BroskiClient {
    pub fn new(server_url: &str) -> Self {
        // Build HTTP client with timeout, falling back to default client if builder fails
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/api/{}", self.base_url, path)
    }

    pub async fn get_rewards(&self, address: &str) -> Result<RewardTotals> {
        let url = self.api_url(&format!("rewards/{}", urlencoding::encode(address)));
        let resp = self.client.get(&url).send().await?;
        parse(resp, "fetch rewards").await
    }

    pub async fn get_leaderboard(&self, timeframe: &str, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let url = self.api_url(&format!(
            "rewards/leaderboard?timeframe={}&limit={}",
            urlencoding::encode(timeframe),
            limit
        ));
        let resp = self.client.get(&url).send().await?;
        parse(resp, "fetch leaderboard").await
    }

    pub async fn check_access(
        &self,
        address: &str,
        features: &[String],
    ) -> Result<IndexMap<String, AccessResult>> {
        let url = self.api_url("access/batch");
        let resp = self
            .client
            .post(&url)
            .json(&BatchAccessRequest { address, features })
            .send()
            .await?;
        parse(resp, "check access").await
    }

    pub async fn get_quests(&self, address: Option<&str>) -> Result<Vec<QuestStatus>> {
        let url = match address {
            Some(a) => self.api_url(&format!("quests?address={}", urlencoding::encode(a))),
            None => self.api_url("quests"),
        };
        let resp = self.client.get(&url).send().await?;
        parse(resp, "fetch quests").await
    }

    pub async fn claim_quest(&self, quest_id: &str, address: &str) -> Result<ClaimResponse> {
        let url = self.api_url(&format!("quests/{}/claim", urlencoding::encode(quest_id)));
        let resp = self
            .client
            .post(&url)
            .json(&ClaimRequest { address })
            .send()
            .await?;
        parse(resp, "claim quest").await
    }
}

async fn parse<T: DeserializeOwned>(resp: Response, action: &str) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }

    let text = resp.text().await.unwrap_or_else(|_| "Unknown error".into());
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(anyhow!(
            "Failed to {} ({}): {} [{}]",
            action,
            status,
            body.message,
            body.error
        )),
        Err(_) => Err(anyhow!("Failed to {} ({}): {}", action, status, text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_strips_trailing_slash() {
        let client = BroskiClient::new("http://localhost:5000/");
        assert_eq!(client.base_url, "http://localhost:5000");
    }

    #[test]
    fn test_api_url() {
        let client = BroskiClient::new("http://localhost:5000");
        assert_eq!(
            client.api_url("/rewards/leaderboard?timeframe=week&limit=5"),
            "http://localhost:5000/api/rewards/leaderboard?timeframe=week&limit=5"
        );
    }
}
