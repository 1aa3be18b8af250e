pub mod bytestream;
pub mod dbus;
pub mod handle;
pub mod socket;
pub mod tube;
