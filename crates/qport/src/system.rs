use crate::port::{ChangeReason, PortData};

/// Hooks into the surrounding firmware.
///
/// The device never manages networking, updates or power itself: it only
/// notifies the system through these hooks.
pub trait System {
    /// Restarts the device.
    ///
    /// When `factory` is set, the configuration has already been erased.
    fn reset(&mut self, factory: bool);

    /// Called after the configuration was saved to the store.
    fn on_config_saved(&mut self) {}
}

/// A [`System`] doing nothing, used by hosts and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSystem;

impl System for NoSystem {
    fn reset(&mut self, factory: bool) {
        log::info!("Reset requested (factory: {factory})");
    }
}

/// Receives port value changes, typically to forward them to clients.
pub trait EventSink {
    /// Called after the value of a port changed.
    fn value_changed(&mut self, port: &PortData, reason: ChangeReason);
}
