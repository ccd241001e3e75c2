//! Twitch API client.
//!
//! Everything the miner needs from Twitch besides pubsub goes through
//! [`TwitchApi`]. [`GqlClient`] implements it over the public GraphQL
//! endpoint using persisted queries.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::drops::DropCampaign;
use crate::error::{MinerError, Result};
use crate::prediction::PredictionEvent;
use crate::streamer::Streamer;

pub const GQL_URL: &str = "https://gql.twitch.tv/gql";
pub const SPADE_URL: &str = "https://spade.twitch.tv/track";
/// Client id of the Twitch web player.
pub const CLIENT_ID: &str = "kimne78kx3ncx6brgo4mv6wki5h1ko";

/// Calls the miner makes against Twitch.
#[async_trait]
pub trait TwitchApi: Send + Sync {
    fn login(&self) -> &str;
    fn user_id(&self) -> &str;
    fn auth_token(&self) -> &str;

    /// Resolve a login to its channel id. Fails with `EntityNotFound`.
    async fn get_channel_id(&self, login: &str) -> Result<String>;

    /// Load the balance and claim any bonus waiting on the channel.
    async fn load_channel_points_context(&self, streamer: &mut Streamer) -> Result<()>;

    /// Refresh online state and stream metadata.
    async fn check_streamer_online(&self, streamer: &mut Streamer) -> Result<()>;

    async fn viewer_is_mod(&self, streamer: &Streamer) -> Result<bool>;

    async fn make_prediction(
        &self,
        event: &PredictionEvent,
        outcome_id: &str,
        amount: u64,
    ) -> Result<()>;

    /// One watch heartbeat.
    async fn send_minute_watched(&self, streamer: &Streamer) -> Result<()>;

    /// Logins of every channel the user follows.
    async fn get_followers(&self) -> Result<Vec<String>>;

    async fn claim_bonus(&self, streamer: &Streamer, claim_id: &str) -> Result<()>;

    async fn join_raid(&self, raid_id: &str) -> Result<()>;

    /// Claim every finished drop in the inventory. Returns how many were claimed.
    async fn claim_available_rewards(&self) -> Result<usize>;

    /// Drop campaigns in progress that still have unclaimed rewards.
    async fn drop_campaigns(&self) -> Result<Vec<DropCampaign>>;
}

/// Persisted query: operation name and hash.
#[derive(Debug, Clone, Copy)]
struct Operation {
    name: &'static str,
    sha256: &'static str,
}

const GET_ID_FROM_LOGIN: Operation = Operation {
    name: "GetIDFromLogin",
    sha256: "94e82a7b1e3c21e186daa73ee2afc4b8f23bade1fbbff6fe8ac133f50a2f58ca",
};
const CHANNEL_POINTS_CONTEXT: Operation = Operation {
    name: "ChannelPointsContext",
    sha256: "1530a003a7d374b0380b79db0be0534f30ff46e61cffa2bc0e2468a909fbc024",
};
const STREAM_INFO: Operation = Operation {
    name: "VideoPlayerStreamInfoOverlayChannel",
    sha256: "a5f2e34d626a9f4f5c0204f910bab2194948a9502089be558bb6e779a9e1b3d2",
};
const MOD_VIEW: Operation = Operation {
    name: "ModViewChannelQuery",
    sha256: "df5d55b6401389afb12d3017c9b2cf1237164220c8ef4ed754eae8188068a807",
};
const MAKE_PREDICTION: Operation = Operation {
    name: "MakePrediction",
    sha256: "b44682ecc88358817009f20e69d75081b1e58825bb40aa53d5dbadcc17c881d8",
};
const CLAIM_COMMUNITY_POINTS: Operation = Operation {
    name: "ClaimCommunityPoints",
    sha256: "46aaeebe02c99afdf4fc97c7c0cba964124bf6b0af229395f1f6d1feed05b3d0",
};
const JOIN_RAID: Operation = Operation {
    name: "JoinRaid",
    sha256: "c6a332a86d1087fbbb1a8623aa01bd1313d2386e7c63be60fdb2d1901f01a4ae",
};
const CHANNEL_FOLLOWS: Operation = Operation {
    name: "ChannelFollows",
    sha256: "eecf815273d3d949e5cf0085cc5084cd8a1b5b7b6f7990cf43cb0beadf546907",
};
const INVENTORY: Operation = Operation {
    name: "Inventory",
    sha256: "37fea486d6179047c41d0f549088a4c3a7dd60c05c70956a1490262f532dccd9",
};
const CLAIM_DROP: Operation = Operation {
    name: "DropsPage_ClaimDropRewards",
    sha256: "a455deea71bdc9015b78eb49f4acfbce8baa7ccbedd28e549bb025bd0f751930",
};

/// Raw `ChannelPointsContext` response.
#[derive(Debug, Deserialize)]
struct RawPointsContext {
    community: Option<RawCommunity>,
}

#[derive(Debug, Deserialize)]
struct RawCommunity {
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    channel: Option<RawPointsChannel>,
}

#[derive(Debug, Deserialize)]
struct RawPointsChannel {
    #[serde(rename = "self")]
    viewer: Option<RawPointsViewer>,
}

#[derive(Debug, Deserialize)]
struct RawPointsViewer {
    #[serde(rename = "communityPoints")]
    community_points: RawCommunityPoints,
}

#[derive(Debug, Deserialize)]
struct RawCommunityPoints {
    balance: u64,
    #[serde(rename = "availableClaim")]
    available_claim: Option<RawClaim>,
}

#[derive(Debug, Deserialize)]
struct RawClaim {
    id: String,
}

/// Raw `VideoPlayerStreamInfoOverlayChannel` response.
#[derive(Debug, Deserialize)]
struct RawStreamInfo {
    user: Option<RawStreamUser>,
}

#[derive(Debug, Deserialize)]
struct RawStreamUser {
    stream: Option<RawStream>,
    #[serde(rename = "broadcastSettings")]
    broadcast_settings: Option<RawBroadcastSettings>,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    id: String,
    #[serde(rename = "viewersCount", default)]
    viewers_count: u64,
}

#[derive(Debug, Deserialize)]
struct RawBroadcastSettings {
    title: Option<String>,
    game: Option<RawGame>,
}

#[derive(Debug, Deserialize)]
struct RawGame {
    name: Option<String>,
}

/// GraphQL implementation of [`TwitchApi`].
pub struct GqlClient {
    client: Client,
    gql_url: String,
    spade_url: String,
    login: String,
    user_id: String,
    auth_token: String,
    dry_run: bool,
}

impl GqlClient {
    /// Build the client and resolve the user's own id.
    pub async fn connect(login: &str, auth_token: &str, dry_run: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| MinerError::Api(e.to_string()))?;
        let mut api = Self {
            client,
            gql_url: GQL_URL.to_string(),
            spade_url: SPADE_URL.to_string(),
            login: login.trim().to_lowercase(),
            user_id: String::new(),
            auth_token: auth_token.to_string(),
            dry_run,
        };
        api.user_id = api.get_channel_id(&api.login).await?;
        tracing::info!(login = %api.login, user_id = %api.user_id, dry_run, "Logged in");
        Ok(api)
    }

    async fn gql(&self, op: Operation, variables: Value) -> Result<Value> {
        let body = json!({
            "operationName": op.name,
            "variables": variables,
            "extensions": {
                "persistedQuery": { "version": 1, "sha256Hash": op.sha256 }
            }
        });
        let response = self
            .client
            .post(&self.gql_url)
            .header("Client-Id", CLIENT_ID)
            .header("Authorization", format!("OAuth {}", self.auth_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| MinerError::Api(format!("{}: {}", op.name, e)))?;

        if !response.status().is_success() {
            return Err(MinerError::Api(format!(
                "{}: HTTP {}",
                op.name,
                response.status()
            )));
        }

        let mut value: Value = response
            .json()
            .await
            .map_err(|e| MinerError::Api(format!("{}: {}", op.name, e)))?;

        if let Some(errors) = value.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(MinerError::Api(format!("{}: {}", op.name, Value::Array(errors.clone()))));
            }
        }
        Ok(value.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }

    async fn claim_drop(&self, drop_instance_id: &str) -> Result<bool> {
        let data = self
            .gql(CLAIM_DROP, json!({ "input": { "dropInstanceID": drop_instance_id } }))
            .await?;
        let status = data
            .pointer("/claimDropRewards/status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(matches!(status, "ELIGIBLE_FOR_ALL" | "DROP_INSTANCE_ALREADY_CLAIMED"))
    }
}

/// Random hex transaction id for mutations.
/// Campaigns from an `Inventory` response that still have an unclaimed drop.
fn unclaimed_campaigns(inventory: &Value) -> Vec<DropCampaign> {
    let campaigns = inventory
        .pointer("/currentUser/inventory/dropCampaignsInProgress")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    campaigns
        .iter()
        .filter(|campaign| {
            campaign
                .get("timeBasedDrops")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .any(|drop| {
                    !drop
                        .pointer("/self/isClaimed")
                        .and_then(Value::as_bool)
                        .unwrap_or(true)
                })
        })
        .filter_map(|campaign| {
            let game = campaign
                .pointer("/game/name")
                .or_else(|| campaign.pointer("/game/displayName"))
                .and_then(Value::as_str)?;
            let channels = campaign
                .pointer("/allow/channels")
                .and_then(Value::as_array)
                .map(|channels| {
                    channels
                        .iter()
                        .filter_map(|c| c.get("name").and_then(Value::as_str))
                        .map(str::to_lowercase)
                        .collect()
                })
                .unwrap_or_default();
            Some(DropCampaign {
                name: campaign
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                game: game.to_string(),
                channels,
            })
        })
        .collect()
}

fn transaction_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// `data=` payload for a spade minute-watched event.
pub fn minute_watched_payload(streamer: &Streamer, user_id: &str) -> Option<String> {
    let broadcast_id = streamer.stream.broadcast_id.as_ref()?;
    let event = json!([{
        "event": "minute-watched",
        "properties": {
            "channel_id": streamer.channel_id,
            "broadcast_id": broadcast_id,
            "player": "site",
            "user_id": user_id,
        }
    }]);
    Some(BASE64.encode(event.to_string()))
}

#[async_trait]
impl TwitchApi for GqlClient {
    fn login(&self) -> &str {
        &self.login
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn auth_token(&self) -> &str {
        &self.auth_token
    }

    async fn get_channel_id(&self, login: &str) -> Result<String> {
        let data = self.gql(GET_ID_FROM_LOGIN, json!({ "login": login })).await?;
        data.pointer("/user/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| MinerError::EntityNotFound(login.to_string()))
    }

    async fn load_channel_points_context(&self, streamer: &mut Streamer) -> Result<()> {
        let data = self
            .gql(CHANNEL_POINTS_CONTEXT, json!({ "channelLogin": streamer.username }))
            .await?;
        let raw: RawPointsContext = serde_json::from_value(data)?;
        let community = raw
            .community
            .ok_or_else(|| MinerError::EntityNotFound(streamer.username.clone()))?;
        if let Some(name) = community.display_name {
            streamer.display_name = name;
        }
        let Some(points) = community.channel.and_then(|c| c.viewer) else {
            return Ok(());
        };
        streamer.channel_points = points.community_points.balance;
        if let Some(claim) = points.community_points.available_claim {
            if let Err(e) = self.claim_bonus(streamer, &claim.id).await {
                tracing::warn!(channel = %streamer.username, error = %e, "Bonus claim failed");
            }
        }
        Ok(())
    }

    async fn check_streamer_online(&self, streamer: &mut Streamer) -> Result<()> {
        let data = self
            .gql(STREAM_INFO, json!({ "channel": streamer.username }))
            .await?;
        let raw: RawStreamInfo = serde_json::from_value(data)?;
        let user = raw
            .user
            .ok_or_else(|| MinerError::EntityNotFound(streamer.username.clone()))?;
        match user.stream {
            Some(stream) => {
                streamer.stream.broadcast_id = Some(stream.id);
                streamer.stream.viewers = stream.viewers_count;
                if let Some(settings) = user.broadcast_settings {
                    streamer.stream.title = settings.title;
                    streamer.stream.game = settings.game.and_then(|g| g.name);
                }
                streamer.set_online();
            }
            None => streamer.set_offline(),
        }
        Ok(())
    }

    async fn viewer_is_mod(&self, streamer: &Streamer) -> Result<bool> {
        let data = self
            .gql(MOD_VIEW, json!({ "channelLogin": streamer.username }))
            .await?;
        Ok(data
            .pointer("/user/self/isModerator")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn make_prediction(
        &self,
        event: &PredictionEvent,
        outcome_id: &str,
        amount: u64,
    ) -> Result<()> {
        if self.dry_run {
            tracing::info!(event = %event.event_id, outcome = outcome_id, amount, "[DRY RUN] Would place prediction");
            return Ok(());
        }
        let variables = json!({
            "input": {
                "eventID": event.event_id,
                "outcomeID": outcome_id,
                "points": amount,
                "transactionID": transaction_id(),
            }
        });
        let data = self
            .gql(MAKE_PREDICTION, variables)
            .await
            .map_err(|e| MinerError::BetPlacement {
                event_id: event.event_id.clone(),
                reason: e.to_string(),
            })?;
        match data.pointer("/makePrediction/error/code").and_then(Value::as_str) {
            Some(code) => Err(MinerError::BetPlacement {
                event_id: event.event_id.clone(),
                reason: code.to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn send_minute_watched(&self, streamer: &Streamer) -> Result<()> {
        let payload = minute_watched_payload(streamer, &self.user_id)
            .ok_or_else(|| MinerError::Api(format!("{} has no broadcast id", streamer.username)))?;
        let response = self
            .client
            .post(&self.spade_url)
            .form(&[("data", payload)])
            .send()
            .await
            .map_err(|e| MinerError::Api(format!("minute-watched: {}", e)))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(MinerError::Api(format!("minute-watched: HTTP {}", response.status())))
        }
    }

    async fn get_followers(&self) -> Result<Vec<String>> {
        let mut logins = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let data = self
                .gql(
                    CHANNEL_FOLLOWS,
                    json!({ "limit": 100, "order": "ASC", "cursor": cursor }),
                )
                .await?;
            let edges = data
                .pointer("/user/follows/edges")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for edge in &edges {
                if let Some(login) = edge.pointer("/node/login").and_then(Value::as_str) {
                    logins.push(login.to_lowercase());
                }
                cursor = edge.get("cursor").and_then(Value::as_str).map(str::to_string);
            }
            let has_next = data
                .pointer("/user/follows/pageInfo/hasNextPage")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !has_next || edges.is_empty() {
                break;
            }
        }
        Ok(logins)
    }

    async fn claim_bonus(&self, streamer: &Streamer, claim_id: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!(channel = %streamer.username, "[DRY RUN] Would claim bonus");
            return Ok(());
        }
        self.gql(
            CLAIM_COMMUNITY_POINTS,
            json!({ "input": { "channelID": streamer.channel_id, "claimID": claim_id } }),
        )
        .await?;
        tracing::info!(channel = %streamer.username, "Claimed bonus");
        Ok(())
    }

    async fn join_raid(&self, raid_id: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!(raid = raid_id, "[DRY RUN] Would join raid");
            return Ok(());
        }
        self.gql(JOIN_RAID, json!({ "input": { "raidID": raid_id } }))
            .await?;
        Ok(())
    }

    async fn claim_available_rewards(&self) -> Result<usize> {
        let data = self.gql(INVENTORY, json!({})).await?;
        let campaigns = data
            .pointer("/currentUser/inventory/dropCampaignsInProgress")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut claimed = 0;
        for campaign in &campaigns {
            let drops = campaign
                .get("timeBasedDrops")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for drop in drops {
                let is_claimed = drop
                    .pointer("/self/isClaimed")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let Some(instance) = drop.pointer("/self/dropInstanceID").and_then(Value::as_str)
                else {
                    continue;
                };
                if is_claimed {
                    continue;
                }
                if self.dry_run {
                    tracing::info!(drop = instance, "[DRY RUN] Would claim drop");
                    continue;
                }
                match self.claim_drop(instance).await {
                    Ok(true) => claimed += 1,
                    Ok(false) => tracing::debug!(drop = instance, "Drop not claimable yet"),
                    Err(e) => tracing::warn!(drop = instance, error = %e, "Drop claim failed"),
                }
            }
        }
        Ok(claimed)
    }

    async fn drop_campaigns(&self) -> Result<Vec<DropCampaign>> {
        let data = self.gql(INVENTORY, json!({})).await?;
        Ok(unclaimed_campaigns(&data))
    }
}
