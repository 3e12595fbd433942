//! Client library for TP-Link Tapo P110/P115 smart plugs.
//!
//! Implements the KLAP session protocol (mutual authentication, per-request
//! AES-CBC encryption and keyed signatures) and link-local UDP discovery,
//! with typed wrappers for the energy-monitoring commands.
//!
//! ```no_run
//! use p110_lib::Client;
//!
//! # async fn example() -> Result<(), p110_lib::TapoError> {
//! let client = Client::new("user@example.com", "password");
//! let plug = client.connect("192.168.1.50").await?;
//! let power = plug.get_current_power().await?;
//! println!("{} mW", power.current_power);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod constants;
pub mod device;
pub mod discovery;
pub mod error;
pub mod session;
pub mod types;

// Re-export the main entry points for easy access
pub use device::{Client, P110};
pub use discovery::{discover, discover_first, DiscoveredDevice};
pub use error::{DeviceErrorKind, TapoError};
pub use types::{
    energy_window, CurrentPower, DeviceInfo, DeviceUsage, EnergyData, EnergyDataInterval,
    EnergyUsage, UsageEntry,
};
