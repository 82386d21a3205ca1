//! Device recognition logic for Switchmate devices.
//!
//! Classifies an advertisement into a protocol version and device kind based
//! on the advertised services, the manufacturer data length, and the legacy
//! service data.

use log::debug;

use crate::{
   bluetooth::radio::Advertisement,
   switchmate::protocol::{DeviceKind, ProtocolVersion, SERVICE_V1, SERVICE_V3, hex_short},
};

/// Classification of a recognized advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recognized {
   pub version: ProtocolVersion,
   pub kind: DeviceKind,
}

/// Maps a v3 manufacturer data length to the device kind it identifies.
const fn kind_for_length(len: usize) -> Option<DeviceKind> {
   match len {
      4 | 6 => Some(DeviceKind::Switch),
      8 => Some(DeviceKind::Outlet),
      _ => None,
   }
}

/// Service data carried by a legacy advertisement, if any.
///
/// Prefers the entry keyed by the legacy service and falls back to any
/// non-empty entry, since some stacks key it by a shortened UUID.
pub fn legacy_service_data(adv: &Advertisement) -> Option<&[u8]> {
   adv.service_data
      .get(&SERVICE_V1)
      .filter(|d| !d.is_empty())
      .or_else(|| adv.service_data.values().find(|d| !d.is_empty()))
      .map(Vec::as_slice)
}

/// Classifies an advertisement, returning `None` for anything unrecognized.
pub fn classify(adv: &Advertisement) -> Option<Recognized> {
   if adv.service_uuids.contains(&SERVICE_V3)
      && let Some(data) = &adv.manufacturer_data
   {
      let kind = kind_for_length(data.len());
      if kind.is_none() {
         debug!(
            "Failed to classify v3 advertisement: {} bytes => {}",
            data.len(),
            hex_short(data)
         );
      }
      return kind.map(|kind| Recognized {
         version: ProtocolVersion::V3,
         kind,
      });
   }

   if adv.service_uuids.contains(&SERVICE_V1) && legacy_service_data(adv).is_some() {
      return Some(Recognized {
         version: ProtocolVersion::V1,
         kind: DeviceKind::Switch,
      });
   }

   debug!("Unrecognized advertisement from {:?}", adv.id);
   None
}
