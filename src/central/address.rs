//! Bluetooth device addresses.
//!
//! A [`DeviceAddress`] is the 48-bit MAC of a remote device, carried as a
//! `u64` whose top 16 bits are always zero. Hosts refer to devices by the
//! decimal rendering of that integer (the "device id"); logs and paired-device
//! records use the colon-separated hex form.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{CentralError, Result};

const ADDRESS_MASK: u64 = 0xFFFF_FFFF_FFFF;

#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
   /// Wraps a raw address, rejecting values wider than 48 bits.
   pub fn new(raw: u64) -> Result<Self> {
      if raw & !ADDRESS_MASK != 0 {
         return Err(CentralError::InvalidAddress(format!("{raw:#x}")));
      }
      Ok(Self(raw))
   }

   pub const fn from_octets(octets: [u8; 6]) -> Self {
      let [a, b, c, d, e, f] = octets;
      Self(u64::from_be_bytes([0, 0, a, b, c, d, e, f]))
   }

   /// Parses the decimal device id used by inbound commands.
   pub fn from_device_id(id: &str) -> Result<Self> {
      let raw = id
         .trim()
         .parse::<u64>()
         .map_err(|_| CentralError::InvalidAddress(id.to_string()))?;
      Self::new(raw)
   }

   pub const fn as_u64(self) -> u64 {
      self.0
   }

   pub fn octets(self) -> [u8; 6] {
      let bytes = self.0.to_be_bytes();
      [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]
   }

   /// Decimal form, as echoed back in events.
   pub fn device_id(self) -> String {
      self.0.to_string()
   }

   /// Unpadded lowercase hex, used as a display name for unnamed advertisers.
   pub fn short_hex(self) -> String {
      format!("{:x}", self.0)
   }
}

impl fmt::Display for DeviceAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.octets();
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for DeviceAddress {
   type Err = CentralError;

   fn from_str(s: &str) -> Result<Self> {
      let invalid = || CentralError::InvalidAddress(s.to_string());

      let mut octets = [0u8; 6];
      let mut parts = s.split(':');
      for octet in &mut octets {
         let part = parts.next().ok_or_else(invalid)?;
         if part.len() != 2 {
            return Err(invalid());
         }
         *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
      }
      if parts.next().is_some() {
         return Err(invalid());
      }
      Ok(Self::from_octets(octets))
   }
}
