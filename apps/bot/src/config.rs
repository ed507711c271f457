use std::net::SocketAddr;

use anyhow::{Result, bail};
use visor_auth::TokenConfig;
use visor_bus::BusConfig;

const TOKEN_PLACEHOLDER: &str = "your_telegram_bot_token_here";

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub telegram_api_base: String,
    pub nats_url: String,
    pub topic_outgoing: String,
    pub topic_user_events: String,
    pub consumer_group: String,
    pub metrics_addr: SocketAddr,
    pub session_ttl_secs: u64,
    pub token: TokenConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bot_token = std::env::var("BOT_TOKEN").unwrap_or_default();
        if !bot_token_valid(&bot_token) {
            bail!("BOT_TOKEN is not configured; set it in .env or the environment");
        }
        let metrics_port: u16 = std::env::var("METRICS_PORT")
            .unwrap_or_else(|_| "9101".into())
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid METRICS_PORT: {err}"))?;
        let session_ttl_secs: u64 = std::env::var("SESSION_TTL_SECS")
            .unwrap_or_else(|_| "1800".into())
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid SESSION_TTL_SECS: {err}"))?;

        Ok(Self {
            bot_token,
            telegram_api_base: std::env::var("TELEGRAM_API_BASE")
                .unwrap_or_else(|_| "https://api.telegram.org".into()),
            nats_url: std::env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://127.0.0.1:4222".into()),
            topic_outgoing: std::env::var("TOPIC_OUTGOING")
                .unwrap_or_else(|_| "telegram.outgoing.messages".into()),
            topic_user_events: std::env::var("TOPIC_USER_EVENTS")
                .unwrap_or_else(|_| "user.events".into()),
            consumer_group: std::env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "visor-bot".into()),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], metrics_port)),
            session_ttl_secs,
            token: TokenConfig {
                token_url: std::env::var("OAUTH_TOKEN_URL")
                    .unwrap_or_else(|_| "http://localhost:9099/oauth2/token".into()),
                client_id: std::env::var("OAUTH_CLIENT_ID")
                    .unwrap_or_else(|_| "svc_product_visor".into()),
                client_secret: std::env::var("OAUTH_CLIENT_SECRET")
                    .unwrap_or_else(|_| "secret".into()),
                scope: std::env::var("OAUTH_SCOPE").unwrap_or_else(|_| "internal".into()),
            },
        })
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            servers: self.nats_url.clone(),
            outgoing_topic: self.topic_outgoing.clone(),
            user_events_topic: self.topic_user_events.clone(),
            consumer_group: self.consumer_group.clone(),
        }
    }
}

fn bot_token_valid(token: &str) -> bool {
    !token.is_empty() && token != TOKEN_PLACEHOLDER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_rejected() {
        assert!(!bot_token_valid(""));
    }

    #[test]
    fn placeholder_token_is_rejected() {
        assert!(!bot_token_valid(TOKEN_PLACEHOLDER));
    }

    #[test]
    fn real_token_is_accepted() {
        assert!(bot_token_valid("123456:ABC-DEF"));
    }
}
