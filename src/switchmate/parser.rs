//! Payload parsing utilities for the Switchmate protocol.
//!
//! Decodes live state from advertisement bytes and interprets the
//! notifications and reads returned by the device characteristics.

use thiserror::Error;

use crate::{
   bluetooth::radio::Advertisement,
   error::{Result, SwitchmateError},
   switchmate::{
      protocol::{
         AUTH_RESPONSE_PREFIX_LEN, Channel, SEQ_OFF, SEQ_ON, SEQ_V1_AUTH_FAILED, SEQ_V1_CHANGED,
         SEQ_V1_RESET, hex_short,
      },
      recognition::legacy_service_data,
   },
};

/// Byte offset of the state bit inside legacy service data.
const V1_STATE_OFFSET: usize = 4;

/// Error type for payload parsing.
#[derive(Error, Debug)]
pub enum ProtoError {
   /// Payload is too short for the expected field
   #[error("Payload too short: expected at least {expected} bytes, got {actual}")]
   PayloadTooShort { expected: usize, actual: usize },

   /// Advertisement lacks the data block the decoder needs
   #[error("Advertisement has no {0}")]
   MissingData(&'static str),
}

/// Reads the low-order bit of `data[offset]`.
pub fn decode_bit(data: &[u8], offset: usize) -> Result<bool> {
   let byte = data.get(offset).ok_or(ProtoError::PayloadTooShort {
      expected: offset + 1,
      actual: data.len(),
   })?;
   Ok(byte & 0x01 == 0x01)
}

/// State of a v3 switch (or outlet relay) from its manufacturer data.
pub fn advertised_power(adv: &Advertisement, channel: Channel) -> Result<bool> {
   let data = adv
      .manufacturer_data
      .as_deref()
      .ok_or(ProtoError::MissingData("manufacturer data"))?;
   let offset = channel
      .state_offset()
      .ok_or(SwitchmateError::UnsupportedChannel(Some(channel.index())))?;
   decode_bit(data, offset)
}

/// State of a legacy switch from its service data.
pub fn advertised_legacy_power(adv: &Advertisement) -> Result<bool> {
   let data = legacy_service_data(adv).ok_or(ProtoError::MissingData("service data"))?;
   decode_bit(data, V1_STATE_OFFSET)
}

/// Interprets a v3 power notification.
pub fn parse_power_notify(data: &[u8]) -> Result<bool> {
   if data == SEQ_ON {
      Ok(true)
   } else if data == SEQ_OFF {
      Ok(false)
   } else {
      Err(SwitchmateError::UnknownState(hex_short(data)))
   }
}

/// Interprets the legacy status notification that follows a signed write.
pub fn parse_legacy_status(data: &[u8]) -> Result<()> {
   if data == SEQ_V1_CHANGED {
      Ok(())
   } else if data == SEQ_V1_RESET {
      Err(SwitchmateError::Reset)
   } else {
      Err(SwitchmateError::WriteFailed)
   }
}

pub fn parse_battery_level(data: &[u8]) -> Result<u8> {
   let level = *data.first().ok_or(ProtoError::PayloadTooShort {
      expected: 1,
      actual: 0,
   })?;
   Ok(level.min(100))
}

pub fn parse_light(data: &[u8]) -> Result<bool> {
   decode_bit(data, 0)
}

/// Extracts the credential from a pairing notification.
pub fn parse_auth_response(data: &[u8]) -> Result<Vec<u8>> {
   if data == SEQ_V1_AUTH_FAILED {
      return Err(SwitchmateError::PairingFailed("device refused pairing"));
   }
   if data.len() <= AUTH_RESPONSE_PREFIX_LEN {
      return Err(
         ProtoError::PayloadTooShort {
            expected: AUTH_RESPONSE_PREFIX_LEN + 1,
            actual: data.len(),
         }
         .into(),
      );
   }
   Ok(data[AUTH_RESPONSE_PREFIX_LEN..].to_vec())
}
