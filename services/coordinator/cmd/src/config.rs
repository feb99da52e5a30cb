//! Configuration handling for the coordinator service.
//!
//! Settings come from a YAML file (the `coordinator` section) and `ZB_*`
//! environment variables, on top of built-in defaults.

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zb_stack::StackConfig;
use zb_storage::{NetworkParameters, PersistedState};
use zb_wire::security::WELL_KNOWN_TC_LINK_KEY;

/// Coordinator service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Where the Trust Center state record lives
    pub state_file: PathBuf,
    /// Address of the radio bridge
    pub bridge_addr: String,
    /// Open joins for this many seconds after startup (0 keeps them closed)
    pub permit_join_secs: u64,
    /// Parameters used when forming a new network
    pub network: NetworkConfig,
    /// Protocol engine settings
    pub stack: StackConfig,
}

/// Network formation parameters; unset identifiers and keys are random
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Coordinator IEEE address
    pub eui64: Option<u64>,
    /// PAN identifier
    pub pan_id: Option<u16>,
    /// Extended PAN identifier
    pub extended_pan_id: Option<u64>,
    /// Radio channel (11-26)
    pub channel: u8,
    /// Transmit power in dBm
    pub tx_power: i8,
    /// Network key as 32 hex digits
    pub network_key: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            eui64: None,
            pan_id: None,
            extended_pan_id: None,
            channel: 15,
            tx_power: 5,
            network_key: None,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("zb-coordinator.state"),
            bridge_addr: "127.0.0.1:9999".to_string(),
            permit_join_secs: 0,
            network: NetworkConfig::default(),
            stack: StackConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML layout)
#[derive(Debug, Deserialize)]
struct RootConfig {
    coordinator: Option<CoordinatorConfig>,
}

impl CoordinatorConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file falls back to defaults; a file that does not parse is
    /// an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.coordinator.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        info!(
            "Final coordinator configuration: state_file={:?}, bridge={}, channel={}, permit_join={}s",
            config.state_file, config.bridge_addr, config.network.channel, config.permit_join_secs
        );
        Ok(config)
    }

    /// Apply `ZB_*` overrides read through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(state_file) = lookup("ZB_STATE_FILE") {
            self.state_file = PathBuf::from(state_file);
            info!("State file overridden by environment: {:?}", self.state_file);
        }

        if let Some(bridge_addr) = lookup("ZB_BRIDGE_ADDR") {
            self.bridge_addr = bridge_addr;
            info!("Bridge address overridden by environment: {}", self.bridge_addr);
        }

        if let Some(value) = lookup("ZB_PERMIT_JOIN_SECS") {
            match value.parse::<u64>() {
                Ok(secs) => self.permit_join_secs = secs,
                Err(_) => warn!("Ignoring invalid ZB_PERMIT_JOIN_SECS {:?}", value),
            }
        }

        if let Some(value) = lookup("ZB_CHANNEL") {
            match value.parse::<u8>() {
                Ok(channel) => self.network.channel = channel,
                Err(_) => warn!("Ignoring invalid ZB_CHANNEL {:?}", value),
            }
        }

        if let Some(value) = lookup("ZB_PAN_ID") {
            match parse_u16(&value) {
                Some(pan_id) => self.network.pan_id = Some(pan_id),
                None => warn!("Ignoring invalid ZB_PAN_ID {:?}", value),
            }
        }

        if let Some(value) = lookup("ZB_EMIT_RAW_FRAMES") {
            self.stack.emit_raw_frames = value.eq_ignore_ascii_case("true") || value == "1";
        }
    }

    fn validate(&self) -> Result<()> {
        if !(11..=26).contains(&self.network.channel) {
            bail!("Channel {} is outside 11-26", self.network.channel);
        }
        if let Some(pan_id) = self.network.pan_id {
            if pan_id == 0xffff {
                bail!("PAN ID 0xffff is reserved");
            }
        }
        if let Some(key) = &self.network.network_key {
            parse_key(key)?;
        }
        Ok(())
    }

    /// Build the initial state of a new network
    pub fn form_network(&self) -> Result<PersistedState> {
        let mut rng = rand::thread_rng();
        let network = &self.network;

        let network_key = match &network.network_key {
            Some(hex) => parse_key(hex)?,
            None => rng.gen(),
        };

        let parameters = NetworkParameters {
            eui64: network.eui64.unwrap_or_else(|| rng.gen()),
            pan_id: network.pan_id.unwrap_or_else(|| rng.gen_range(0x0001..0xfff0)),
            extended_pan_id: network
                .extended_pan_id
                .unwrap_or_else(|| rng.gen_range(1..u64::MAX)),
            channel: network.channel,
            update_id: 0,
            tx_power: network.tx_power,
            network_key,
            network_key_frame_counter: 0,
            network_key_sequence: 0,
            tc_key: WELL_KNOWN_TC_LINK_KEY,
            tc_key_frame_counter: 0,
        };

        info!(
            "Forming network: PAN 0x{:04x}, extended PAN {:016x}, channel {}",
            parameters.pan_id, parameters.extended_pan_id, parameters.channel
        );

        Ok(PersistedState {
            network: parameters,
            devices: Vec::new(),
            app_link_keys: Vec::new(),
        })
    }
}

fn parse_u16(value: &str) -> Option<u16> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn parse_key(hex: &str) -> Result<[u8; 16]> {
    let digits: String = hex.chars().filter(|c| *c != ':' && *c != ' ').collect();
    if digits.len() != 32 {
        bail!("Network key must be 32 hex digits, got {}", digits.len());
    }

    let mut key = [0u8; 16];
    for (i, byte) in key.iter_mut().enumerate() {
        let pair = digits
            .get(i * 2..i * 2 + 2)
            .ok_or_else(|| anyhow!("Network key is not ASCII hex"))?;
        *byte = u8::from_str_radix(pair, 16)
            .with_context(|| format!("Invalid hex {:?} in network key", pair))?;
    }
    Ok(key)
}
