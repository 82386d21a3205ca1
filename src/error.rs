//! Error types for the Switchmate service.
//!
//! This module defines all error types that can occur while discovering,
//! connecting to, and commanding Switchmate devices, including Bluetooth,
//! D-Bus, I/O, configuration, and device protocol errors.

use smol_str::SmolStr;
use thiserror::Error;

use crate::switchmate::parser::ProtoError;

/// Main error type for the Switchmate service.
#[derive(Error, Debug)]
pub enum SwitchmateError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Protocol error: {0}")]
   Protocol(#[from] ProtoError),

   #[error("Connect timed out")]
   ConnectTimeout,

   #[error("Write timed out")]
   WriteTimeout,

   #[error("Power state confirmation timed out")]
   PowerStateTimeout,

   #[error("Battery read timed out")]
   BatteryTimeout,

   #[error("Device reported an unknown state: {0}")]
   UnknownState(SmolStr),

   #[error("Characteristic missing: {0}")]
   CharacteristicMissing(SmolStr),

   #[error("Device has reset itself, re-pair to obtain a new auth code")]
   Reset,

   #[error("Device rejected the write")]
   WriteFailed,

   #[error("Device not connected")]
   NotConnected,

   #[error("Device not found: {0}")]
   DeviceNotFound(SmolStr),

   #[error("Invalid device id: {0}")]
   InvalidDeviceId(SmolStr),

   #[error("Channel {0:?} is not supported by this device")]
   UnsupportedChannel(Option<u8>),

   #[error("No auth code configured for legacy device")]
   MissingAuthCode,

   #[error("Invalid auth code: {0}")]
   InvalidAuthCode(#[from] base64::DecodeError),

   #[error("Pairing failed: {0}")]
   PairingFailed(&'static str),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Adapter not found")]
   AdapterNotFound,
}

impl SwitchmateError {
   /// Whether the command retry loop may try again after this error.
   ///
   /// A reset legacy device has discarded its pairing; no number of retries
   /// will make the stored auth code valid again.
   pub const fn is_retryable(&self) -> bool {
      !matches!(
         self,
         Self::Reset | Self::MissingAuthCode | Self::UnsupportedChannel(_)
      )
   }
}

/// Convenience type alias for Results with `SwitchmateError`.
pub type Result<T> = std::result::Result<T, SwitchmateError>;
