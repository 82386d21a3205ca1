//! Switchmate protocol definitions and data structures.
//!
//! This module contains the vendor GATT layout (service and characteristic
//! UUIDs), the fixed byte sequences exchanged with the devices, device
//! identifiers, and the legacy authorization signature.

use std::{fmt, str::FromStr};

use bluer::Address;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};
use uuid::Uuid;

use crate::{
   bluetooth::radio::{GattChar, Packet},
   error::{Result, SwitchmateError},
};

// Advertised services
pub const SERVICE_V1: Uuid = Uuid::from_u128(0x00001523_1212_efde_1523_785feabcd123);
pub const SERVICE_V3: Uuid = Uuid::from_u128(0xa22bd383_ebdd_49ac_b2e7_40eb55f5d0ab);
pub const SERVICE_BATTERY: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Services scanned for when the caller passes no filter.
pub const DEFAULT_SCAN_SERVICES: [Uuid; 2] = [SERVICE_V1, SERVICE_V3];

// Legacy (v1) characteristics
pub const CHAR_V1_STATUS: GattChar = GattChar::new(
   SERVICE_V1,
   Uuid::from_u128(0x00001526_1212_efde_1523_785feabcd123),
);
pub const CHAR_V1_AUTH: GattChar = GattChar::new(
   SERVICE_V1,
   Uuid::from_u128(0x00001529_1212_efde_1523_785feabcd123),
);

// Current (v3) characteristics. The first relay shares the switch layout.
pub const CHAR_POWER_WRITE: GattChar = GattChar::new(
   SERVICE_V3,
   Uuid::from_u128(0xa22b0090_ebdd_49ac_b2e7_40eb55f5d0ab),
);
pub const CHAR_POWER_NOTIFY: GattChar = GattChar::new(
   SERVICE_V3,
   Uuid::from_u128(0xa22b0070_ebdd_49ac_b2e7_40eb55f5d0ab),
);
pub const CHAR_OUTLET2_WRITE: GattChar = GattChar::new(
   SERVICE_V3,
   Uuid::from_u128(0xa22b0095_ebdd_49ac_b2e7_40eb55f5d0ab),
);
pub const CHAR_OUTLET2_NOTIFY: GattChar = GattChar::new(
   SERVICE_V3,
   Uuid::from_u128(0xa22b0075_ebdd_49ac_b2e7_40eb55f5d0ab),
);
pub const CHAR_OUTLET_LIGHT: GattChar = GattChar::new(
   SERVICE_V3,
   Uuid::from_u128(0xa22b0080_ebdd_49ac_b2e7_40eb55f5d0ab),
);
pub const CHAR_BATTERY_LEVEL: GattChar = GattChar::new(
   SERVICE_BATTERY,
   Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb),
);

// v3 power notifications
pub const SEQ_ON: &[u8] = &[0x01, 0x00, 0x00, 0x00];
pub const SEQ_OFF: &[u8] = &[0x00, 0x00, 0x00, 0x00];

// v1 status notifications
pub const SEQ_V1_CHANGED: &[u8] = &[0x20, 0x01, 0x00];
pub const SEQ_V1_AUTH_FAILED: &[u8] = &[0x20, 0x01, 0x03];
pub const SEQ_V1_RESET: &[u8] = &[0x20, 0x01, 0x04];

// v1 opcodes and pairing
pub const OP_V1_ON: [u8; 2] = [0x01, 0x01];
pub const OP_V1_OFF: [u8; 2] = [0x01, 0x00];
pub const PKT_V1_AUTH_START: &[u8] = &[0x00, 0x00, 0x00, 0x00, 0x01];

/// Prefix of an auth notification that precedes the credential bytes.
pub const AUTH_RESPONSE_PREFIX_LEN: usize = 3;

/// 12-hex-digit hardware address, lowercase and without separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(SmolStr);

impl DeviceId {
   pub fn from_address(address: Address) -> Self {
      Self(SmolStr::new(hex::encode(address.0)))
   }

   pub fn address(&self) -> Address {
      let mut bytes = [0u8; 6];
      // Validated on construction.
      let _ = hex::decode_to_slice(self.0.as_str(), &mut bytes);
      Address::new(bytes)
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }

   /// Last four hex digits, used for default device names.
   pub fn short(&self) -> &str {
      &self.0[8..]
   }
}

impl FromStr for DeviceId {
   type Err = SwitchmateError;

   fn from_str(s: &str) -> Result<Self> {
      let cleaned: String = s.chars().filter(|c| *c != ':').collect();
      if cleaned.len() != 12 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
         return Err(SwitchmateError::InvalidDeviceId(s.into()));
      }
      Ok(Self(cleaned.to_ascii_lowercase().into()))
   }
}

impl TryFrom<String> for DeviceId {
   type Error = SwitchmateError;

   fn try_from(value: String) -> Result<Self> {
      value.parse()
   }
}

impl From<DeviceId> for String {
   fn from(id: DeviceId) -> Self {
      id.0.into()
   }
}

impl fmt::Display for DeviceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

/// Hardware family advertised by a device.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
   Switch,
   Outlet,
}

/// Protocol generation, which decides GATT layout and authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::FromRepr)]
#[repr(u8)]
pub enum ProtocolVersion {
   V1 = 1,
   V3 = 3,
}

impl ProtocolVersion {
   pub const fn number(self) -> u8 {
      self as u8
   }
}

impl fmt::Display for ProtocolVersion {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "v{}", self.number())
   }
}

/// Addressable sub-control of a multi-relay outlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::FromRepr)]
#[repr(u8)]
pub enum Channel {
   Light = 0,
   First = 1,
   Second = 2,
}

impl Channel {
   pub const fn index(self) -> u8 {
      self as u8
   }

   /// Manufacturer-data offset carrying this relay's state bit.
   pub const fn state_offset(self) -> Option<usize> {
      match self {
         Self::First => Some(0),
         Self::Second => Some(4),
         Self::Light => None,
      }
   }

   pub const fn write_char(self) -> GattChar {
      match self {
         Self::First => CHAR_POWER_WRITE,
         Self::Second => CHAR_OUTLET2_WRITE,
         Self::Light => CHAR_OUTLET_LIGHT,
      }
   }

   pub const fn notify_char(self) -> Option<GattChar> {
      match self {
         Self::First => Some(CHAR_POWER_NOTIFY),
         Self::Second => Some(CHAR_OUTLET2_NOTIFY),
         Self::Light => None,
      }
   }
}

impl fmt::Display for Channel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Light => f.write_str("light"),
         Self::First => f.write_str("1"),
         Self::Second => f.write_str("2"),
      }
   }
}

/// Computes the legacy authorization payload.
///
/// The signature folds every byte of `data` (opcode followed by the paired
/// credential) with 32-bit wrapping arithmetic:
/// `sig = ((1000003 * sig) ^ byte) ^ len`, seeded with `data[0] << 7`.
/// The result is six bytes: the little-endian signature followed by as many
/// leading bytes of `data` as fit, i.e. the opcode.
pub fn sign(data: &[u8]) -> Packet {
   let len = data.len() as u32;
   let mut sig = data.first().map_or(0, |b| u32::from(*b) << 7);
   for &byte in data {
      sig = (sig.wrapping_mul(1_000_003) ^ u32::from(byte)) ^ len;
   }

   let mut out = Packet::from_slice(&sig.to_le_bytes());
   out.extend(data.iter().copied().take(2));
   out
}

/// Builds the signed on/off payloads for a legacy switch.
pub fn legacy_codes(auth_code: &[u8]) -> (Packet, Packet) {
   let with_op = |op: [u8; 2]| -> Packet {
      let data: Vec<u8> = op.iter().chain(auth_code).copied().collect();
      sign(&data)
   };
   (with_op(OP_V1_ON), with_op(OP_V1_OFF))
}

/// Hex representation used when logging payloads.
pub fn hex_short(data: &[u8]) -> SmolStr {
   if data.len() < 16 {
      hex::encode(data).into()
   } else {
      format_smolstr!("{}..{}", hex::encode(&data[..8]), hex::encode(&data[data.len() - 4..]))
   }
}
