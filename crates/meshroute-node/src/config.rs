//! Node configuration.

use crate::advertise::AdvertisementConfig;
use anyhow::{Context, Result};
use meshroute_core::{BrokerId, StaticRouteTable};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Id of this broker
    pub broker_id: BrokerId,

    /// Capacity of the runtime command channel
    pub channel_capacity: usize,

    /// Advertisement debouncing and batching
    pub advertisement: AdvertisementConfig,

    /// Bound on redirections; `None` waits for the continuity check forever
    pub redirection_timeout: Option<Duration>,

    /// Next hop per target broker, used to seed a [`StaticRouteTable`]
    pub static_routes: BTreeMap<BrokerId, BrokerId>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            broker_id: BrokerId(1),
            channel_capacity: 1024,
            advertisement: AdvertisementConfig::default(),
            redirection_timeout: None,
            static_routes: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MESHROUTE_BROKER_ID`: Broker id (required)
    /// - `MESHROUTE_CHANNEL_CAPACITY`: Command channel capacity
    /// - `MESHROUTE_ADD_DEBOUNCE_MS`: Advertisement addition delay
    /// - `MESHROUTE_REMOVE_DEBOUNCE_MS`: Advertisement removal delay
    /// - `MESHROUTE_MAX_OBJECTS`: Object ids per advertisement update
    /// - `MESHROUTE_MAX_USAGES`: Attribute-usage ids per advertisement update
    /// - `MESHROUTE_REDIRECT_TIMEOUT_MS`: Redirection timeout
    /// - `MESHROUTE_STATIC_ROUTES`: JSON object `{"<target>": <next hop>}`
    ///
    /// # Errors
    ///
    /// Returns error if the broker id is missing or a variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns error if the broker id is missing or a variable does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        let broker_id = lookup("MESHROUTE_BROKER_ID").context("MESHROUTE_BROKER_ID is not set")?;
        config.broker_id = BrokerId(parse(&broker_id, "MESHROUTE_BROKER_ID")?);

        if let Some(capacity) = lookup("MESHROUTE_CHANNEL_CAPACITY") {
            config.channel_capacity = parse(&capacity, "MESHROUTE_CHANNEL_CAPACITY")?;
            anyhow::ensure!(
                config.channel_capacity > 0,
                "MESHROUTE_CHANNEL_CAPACITY must be positive"
            );
        }

        if let Some(ms) = lookup("MESHROUTE_ADD_DEBOUNCE_MS") {
            config.advertisement.addition_delay =
                Duration::from_millis(parse(&ms, "MESHROUTE_ADD_DEBOUNCE_MS")?);
        }

        if let Some(ms) = lookup("MESHROUTE_REMOVE_DEBOUNCE_MS") {
            config.advertisement.removal_delay =
                Duration::from_millis(parse(&ms, "MESHROUTE_REMOVE_DEBOUNCE_MS")?);
        }

        if let Some(max) = lookup("MESHROUTE_MAX_OBJECTS") {
            config.advertisement.max_objects = parse(&max, "MESHROUTE_MAX_OBJECTS")?;
        }

        if let Some(max) = lookup("MESHROUTE_MAX_USAGES") {
            config.advertisement.max_usages = parse(&max, "MESHROUTE_MAX_USAGES")?;
        }

        if let Some(ms) = lookup("MESHROUTE_REDIRECT_TIMEOUT_MS") {
            config.redirection_timeout = Some(Duration::from_millis(parse(
                &ms,
                "MESHROUTE_REDIRECT_TIMEOUT_MS",
            )?));
        }

        // JSON object keys are always strings
        if let Some(routes_json) = lookup("MESHROUTE_STATIC_ROUTES") {
            let routes: BTreeMap<String, i64> = serde_json::from_str(&routes_json)
                .context("Invalid MESHROUTE_STATIC_ROUTES JSON")?;
            for (target, hop) in routes {
                let target: i64 = parse(&target, "MESHROUTE_STATIC_ROUTES target")?;
                config.static_routes.insert(BrokerId(target), BrokerId(hop));
            }
        }

        Ok(config)
    }

    /// A route table holding the configured static routes.
    ///
    /// [`NodeRuntime::spawn`](crate::NodeRuntime::spawn) announces these
    /// targets to the engine on startup.
    #[must_use]
    pub fn route_table(&self) -> StaticRouteTable {
        StaticRouteTable::with_routes(self.static_routes.iter().map(|(t, h)| (*t, *h)))
    }
}

fn parse<T>(value: &str, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {name}: {value:?}"))
}
