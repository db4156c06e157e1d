//! Service and characteristic identifier codec.
//!
//! Identifiers travel as strings on the command side and are compared by their
//! canonical lowercase hyphenated form.

use serde::Serializer;
use uuid::Uuid;

use crate::error::{CentralError, Result};

/// Bluetooth base UUID; short 16/32-bit identifiers live in its top 32 bits.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34fb);

/// Expands a 16- or 32-bit assigned number against the base UUID.
pub const fn from_short(short: u32) -> Uuid {
   Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Returns the assigned number if `uuid` is derived from the base UUID.
pub fn to_short(uuid: Uuid) -> Option<u32> {
   let raw = uuid.as_u128();
   if raw & ((1u128 << 96) - 1) == BLUETOOTH_BASE_UUID.as_u128() {
      Some((raw >> 96) as u32)
   } else {
      None
   }
}

/// Parses any accepted textual form into a [`Uuid`].
///
/// Accepts hyphenated and simple 32-digit forms in either case, optionally
/// wrapped in braces, plus 4- and 8-digit short forms.
pub fn parse_uuid(s: &str) -> Result<Uuid> {
   let invalid = || CentralError::InvalidUuid(s.to_string());
   let trimmed = s.trim();
   let body = trimmed
      .strip_prefix('{')
      .and_then(|rest| rest.strip_suffix('}'))
      .unwrap_or(trimmed);

   match body.len() {
      4 | 8 if body.bytes().all(|b| b.is_ascii_hexdigit()) => {
         let short = u32::from_str_radix(body, 16).map_err(|_| invalid())?;
         Ok(from_short(short))
      },
      32 | 36 => Uuid::try_parse(body).map_err(|_| invalid()),
      _ => Err(invalid()),
   }
}

/// Canonical form: lowercase, hyphenated 8-4-4-4-12.
pub fn uuid_to_string(uuid: &Uuid) -> String {
   uuid.hyphenated().to_string()
}

/// `serialize_with` target writing the canonical form.
pub fn serialize_canonical<S: Serializer>(
   uuid: &Uuid,
   serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
   serializer.serialize_str(&uuid_to_string(uuid))
}
