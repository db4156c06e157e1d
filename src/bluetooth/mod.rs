//! Platform Bluetooth layer.
//!
//! [`driver::BleDriver`] is the seam between the session manager and the OS
//! stack. The BlueZ implementation is behind the `bluez` feature.

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod driver;
#[cfg(test)]
pub mod stub;
