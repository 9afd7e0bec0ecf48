//! # Stack Configuration
//!
//! Every knob the protocol core exposes, grouped by layer. Parsing these from
//! files or CLIs is the embedding application's concern; the structs carry
//! serde derives so any format plugs in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::measurement::ClassMask;
use crate::transport::MAX_TPDU_PAYLOAD;

/// Link-layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Our link address.
    pub local_address: u16,
    /// The remote's link address.
    pub remote_address: u16,
    /// Whether this endpoint is the master station (sets the DIR bit).
    pub is_master: bool,
    /// Retransmissions of a confirmed frame before giving up.
    pub num_retry: u8,
    /// How long to wait for an ACK before retrying.
    pub ack_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            local_address: 1,
            remote_address: 1024,
            is_master: false,
            num_retry: 3,
            ack_timeout: Duration::from_secs(1),
        }
    }
}

/// Application-layer configuration shared by both endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Maximum application fragment size in bytes.
    pub max_fragment_size: usize,
    /// How long to wait for a CONFIRM of a transmitted response.
    pub confirm_timeout: Duration,
    /// How long to wait for a solicited response.
    pub response_timeout: Duration,
}

/// Default and maximum application fragment size.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 2048;

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            confirm_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // A fragment must fit at least one transport segment and never exceed
        // the reassembly cap.
        if self.max_fragment_size < MAX_TPDU_PAYLOAD
            || self.max_fragment_size > DEFAULT_MAX_FRAGMENT_SIZE
        {
            return Err(ConfigError::InvalidRange {
                field: "app.max_fragment_size",
                value: self.max_fragment_size,
                min: MAX_TPDU_PAYLOAD,
                max: DEFAULT_MAX_FRAGMENT_SIZE,
            });
        }
        Ok(())
    }
}

/// Per-class event buffer capacities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EventBufferConfig {
    pub class1: usize,
    pub class2: usize,
    pub class3: usize,
}

impl Default for EventBufferConfig {
    fn default() -> Self {
        EventBufferConfig {
            class1: 100,
            class2: 100,
            class3: 100,
        }
    }
}

impl EventBufferConfig {
    pub fn total(&self) -> usize {
        self.class1 + self.class2 + self.class3
    }
}

/// Outstation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutstationConfig {
    /// Refuse all unsolicited operation when set.
    pub disable_unsol: bool,
    /// Classes enabled for unsolicited reporting at startup.
    pub unsol_class_mask: ClassMask,
    /// Hold time between the first queued event and the unsolicited transmit.
    pub unsol_pack_timer: Duration,
    /// Retry delay after a failed unsolicited response.
    pub unsol_retry_timer: Duration,
    /// Select-before-operate arming window.
    pub select_timeout: Duration,
    /// Maximum command objects accepted per request.
    pub max_controls_per_request: usize,
    /// Event buffer sizing.
    pub event_buffer: EventBufferConfig,
    /// Period between NEED_TIME re-assertions. `None` disables time-sync
    /// prompting entirely.
    pub time_sync_period: Option<Duration>,
}

impl Default for OutstationConfig {
    fn default() -> Self {
        OutstationConfig {
            disable_unsol: false,
            unsol_class_mask: ClassMask::ALL,
            unsol_pack_timer: Duration::from_millis(200),
            unsol_retry_timer: Duration::from_secs(2),
            select_timeout: Duration::from_secs(5),
            max_controls_per_request: 16,
            event_buffer: EventBufferConfig::default(),
            time_sync_period: None,
        }
    }
}

impl OutstationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_controls_per_request == 0 {
            return Err(ConfigError::InvalidRange {
                field: "outstation.max_controls_per_request",
                value: 0,
                min: 1,
                max: usize::MAX,
            });
        }
        if self.event_buffer.total() == 0 {
            return Err(ConfigError::InvalidRange {
                field: "outstation.event_buffer",
                value: 0,
                min: 1,
                max: usize::MAX,
            });
        }
        Ok(())
    }
}

/// When the master writes time to the outstation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeSyncMode {
    /// Never synchronize time.
    Disabled,
    /// Run the time-sync task whenever a response carries NEED_TIME.
    #[default]
    OnNeedTime,
}

/// Master configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Period of the integrity poll.
    pub integrity_rate: Duration,
    /// Retry delay applied to failed tasks.
    pub task_retry_rate: Duration,
    /// Disable unsolicited before the integrity poll on startup.
    pub unsol_on_startup: bool,
    /// Re-enable unsolicited after a successful integrity poll.
    pub enable_unsol: bool,
    /// Classes to enable for unsolicited reporting.
    pub unsol_class_mask: ClassMask,
    pub time_sync_mode: TimeSyncMode,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            integrity_rate: Duration::from_secs(3600),
            task_retry_rate: Duration::from_secs(5),
            unsol_on_startup: true,
            enable_unsol: true,
            unsol_class_mask: ClassMask::ALL,
            time_sync_mode: TimeSyncMode::OnNeedTime,
        }
    }
}
