//! Engine configuration and Trust Center policies

use serde::{Deserialize, Serialize};
use zb_routing::RouteScoringConfig;

/// Install code handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallCodePolicy {
    /// Joins use the global Trust Center link key
    NotRequired,
    /// Install codes are ignored
    NotSupported,
    /// Every join must use an install code; no codes are provisioned, so joins are denied
    Required,
}

/// Who may request the Trust Center link key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcKeyRequestPolicy {
    /// Requests are ignored
    Disallowed,
    /// Any device
    Allowed,
    /// Only devices that have not verified their key yet
    OnlyProvisional,
}

/// Who may request an application link key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppKeyRequestPolicy {
    /// Requests are ignored
    Disallowed,
    /// Any pair of known devices
    Allowed,
    /// Only pairs listed in `approved_app_key_pairs`
    OnlyApproved,
}

/// How a rotated network key is distributed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUpdateMethod {
    /// One NWK-secured broadcast
    Broadcast,
    /// APS-secured unicast to each device
    Unicast,
}

/// Trust Center policy, read by the engine and set by the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustCenterPolicies {
    /// Install code requirement
    pub install_code: InstallCodePolicy,
    /// Accept unsecured rejoins that need the well-known link key
    pub allow_rejoins_with_well_known_key: bool,
    /// Trust Center link key requests
    pub allow_tc_key_request: TcKeyRequestPolicy,
    /// Application link key requests
    pub allow_app_key_request: AppKeyRequestPolicy,
    /// Device pairs allowed to share an application link key
    pub approved_app_key_pairs: Vec<(u64, u64)>,
    /// Automatic network key rotation period in seconds (0 disables)
    pub network_key_update_period_secs: u64,
    /// Distribution of rotated keys
    pub network_key_update_method: KeyUpdateMethod,
}

impl Default for TrustCenterPolicies {
    fn default() -> Self {
        Self {
            install_code: InstallCodePolicy::NotRequired,
            allow_rejoins_with_well_known_key: true,
            allow_tc_key_request: TcKeyRequestPolicy::Allowed,
            allow_app_key_request: AppKeyRequestPolicy::Disallowed,
            approved_app_key_pairs: Vec::new(),
            network_key_update_period_secs: 0,
            network_key_update_method: KeyUpdateMethod::Broadcast,
        }
    }
}

/// RSSI window and sample history used for link quality
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkQualityConfig {
    /// RSSI mapped to LQI 0
    pub rssi_min: i8,
    /// RSSI mapped to LQI 255
    pub rssi_max: i8,
    /// Samples kept and averaged per device
    pub max_recent_samples: usize,
}

impl Default for LinkQualityConfig {
    fn default() -> Self {
        Self {
            rssi_min: -100,
            rssi_max: -25,
            max_recent_samples: 10,
        }
    }
}

/// Timer periods and protocol windows, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Link status broadcast period
    pub link_status_period_ms: u64,
    /// Random jitter applied to the link status period (+/-)
    pub link_status_jitter_ms: u64,
    /// Many-to-one route request period
    pub many_to_one_period_ms: u64,
    /// Minimum spacing between many-to-one route requests
    pub many_to_one_min_spacing_ms: u64,
    /// Periodic state save
    pub save_period_ms: u64,
    /// Housekeeping sweep
    pub housekeeping_period_ms: u64,
    /// APS acknowledgment wait
    pub aps_ack_timeout_ms: u64,
    /// APS retransmissions after the first attempt
    pub aps_max_retries: u8,
    /// APS duplicate rejection window
    pub aps_duplicate_window_ms: u64,
    /// Green Power duplicate rejection window
    pub gp_duplicate_window_ms: u64,
    /// Lifetime of pending association responses and indirect frames
    pub indirect_timeout_ms: u64,
    /// Delay between distributing a new network key and switching to it
    pub network_key_switch_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            link_status_period_ms: 15_000,
            link_status_jitter_ms: 1_000,
            many_to_one_period_ms: 60_000,
            many_to_one_min_spacing_ms: 10_000,
            save_period_ms: 60_000,
            housekeeping_period_ms: 1_000,
            aps_ack_timeout_ms: 1_500,
            aps_max_retries: 3,
            aps_duplicate_window_ms: 8_000,
            gp_duplicate_window_ms: 2_000,
            indirect_timeout_ms: 7_680,
            network_key_switch_delay_ms: 5_000,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Trust Center policies
    pub policies: TrustCenterPolicies,
    /// Source route scoring
    pub routing: RouteScoringConfig,
    /// Link quality mapping
    pub link_quality: LinkQualityConfig,
    /// Timers and windows
    pub timing: TimingConfig,
    /// Link status periods a neighbor may miss before its cost drops to zero
    pub link_status_max_missed: u8,
    /// Added to outgoing frame counters when saving
    pub frame_counter_save_margin: u32,
    /// Emit every received MAC frame as an event
    pub emit_raw_frames: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            policies: TrustCenterPolicies::default(),
            routing: RouteScoringConfig::default(),
            link_quality: LinkQualityConfig::default(),
            timing: TimingConfig::default(),
            link_status_max_missed: 3,
            frame_counter_save_margin: 1024,
            emit_raw_frames: false,
        }
    }
}
