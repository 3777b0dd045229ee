//! Transport-agnostic feature negotiation (spec §4.7's negotiation state
//! machine), grounded on the teacher's `drivers/src/virtio/pci.rs`
//! `negotiate_features`/`set_driver_ok`, generalized to run over either
//! transport through one trait instead of being PCI-specific.

pub mod status {
    pub const ACKNOWLEDGE: u8 = 0x01;
    pub const DRIVER: u8 = 0x02;
    pub const DRIVER_OK: u8 = 0x04;
    pub const FEATURES_OK: u8 = 0x08;
    pub const DEVICE_NEEDS_RESET: u8 = 0x40;
    pub const FAILED: u8 = 0x80;
}

/// `VIRTIO_F_VERSION_1`: required by both transports in this kernel, since
/// neither the legacy pre-1.0 MMIO layout nor legacy PCI is supported.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// Operations feature negotiation and queue setup need from a transport,
/// implemented by [`crate::mmio::MmioTransport`] and
/// [`crate::pci::PciTransport`]. Drivers in `microq-drivers` are written
/// once against this trait and never match on which transport they're on.
pub trait VirtioTransport {
    fn reset(&mut self);
    fn set_status(&mut self, status: u8);
    fn get_status(&self) -> u8;
    fn read_device_features(&mut self) -> u64;
    fn write_driver_features(&mut self, features: u64);

    /// Select queue `index` and report the device's maximum size for it.
    fn select_queue(&mut self, index: u16) -> u16;
    fn set_queue_enabled(&mut self, index: u16, enabled: bool);

    /// Program the descriptor table / available ring / used ring addresses
    /// for whichever queue `select_queue` last selected.
    fn set_queue_layout(&mut self, desc_addr: u64, driver_addr: u64, device_addr: u64);

    fn notify(&mut self, index: u16);
    fn read_isr(&mut self) -> u8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationError {
    MissingRequiredFeatures,
    FeaturesRejected,
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureNegotiation {
    pub device_features: u64,
    pub driver_features: u64,
}

/// Run the device status state machine: reset -> ACKNOWLEDGE -> DRIVER ->
/// read/select features -> FEATURES_OK -> verify. Returns the negotiated
/// feature set, or an error (with `FAILED` already latched on the device).
pub fn negotiate(
    transport: &mut dyn VirtioTransport,
    required: u64,
    optional: u64,
) -> Result<FeatureNegotiation, NegotiationError> {
    transport.reset();
    transport.set_status(status::ACKNOWLEDGE);
    transport.set_status(status::ACKNOWLEDGE | status::DRIVER);

    let device_features = transport.read_device_features();
    let required = required | VIRTIO_F_VERSION_1;
    if device_features & required != required {
        transport.set_status(status::FAILED);
        return Err(NegotiationError::MissingRequiredFeatures);
    }

    let driver_features = device_features & (required | optional);
    transport.write_driver_features(driver_features);
    transport.set_status(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK);

    if transport.get_status() & status::FEATURES_OK == 0 {
        transport.set_status(status::FAILED);
        return Err(NegotiationError::FeaturesRejected);
    }

    Ok(FeatureNegotiation {
        device_features,
        driver_features,
    })
}

/// Final step once all queues are set up: announce the driver is ready.
pub fn set_driver_ok(transport: &mut dyn VirtioTransport) {
    let s = transport.get_status();
    transport.set_status(s | status::DRIVER_OK);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A bare in-memory device model exercising only the status/feature
    /// registers, enough to drive `negotiate`/`set_driver_ok` in isolation
    /// from any queue mechanics.
    struct FakeTransport {
        status: u8,
        device_features: u64,
        driver_features: u64,
        reject_features_ok: bool,
    }

    impl VirtioTransport for FakeTransport {
        fn reset(&mut self) {
            self.status = 0;
        }
        fn set_status(&mut self, status: u8) {
            if status & status::FEATURES_OK != 0 && self.reject_features_ok {
                self.status = status & !status::FEATURES_OK;
            } else {
                self.status = status;
            }
        }
        fn get_status(&self) -> u8 {
            self.status
        }
        fn read_device_features(&mut self) -> u64 {
            self.device_features
        }
        fn write_driver_features(&mut self, features: u64) {
            self.driver_features = features;
        }
        fn select_queue(&mut self, _index: u16) -> u16 {
            64
        }
        fn set_queue_enabled(&mut self, _index: u16, _enabled: bool) {}
        fn set_queue_layout(&mut self, _desc_addr: u64, _driver_addr: u64, _device_addr: u64) {}
        fn notify(&mut self, _index: u16) {}
        fn read_isr(&mut self) -> u8 {
            0
        }
    }

    #[test]
    fn negotiate_succeeds_with_supported_required_features() {
        let mut t = FakeTransport {
            status: 0,
            device_features: VIRTIO_F_VERSION_1 | 0b1,
            driver_features: 0,
            reject_features_ok: false,
        };
        let result = negotiate(&mut t, 0b1, 0).unwrap();
        assert_eq!(result.driver_features, VIRTIO_F_VERSION_1 | 0b1);
        set_driver_ok(&mut t);
        assert_eq!(t.get_status() & status::DRIVER_OK, status::DRIVER_OK);
    }

    #[test]
    fn negotiate_fails_when_required_feature_missing() {
        let mut t = FakeTransport {
            status: 0,
            device_features: VIRTIO_F_VERSION_1,
            driver_features: 0,
            reject_features_ok: false,
        };
        let err = negotiate(&mut t, 0b10, 0).unwrap_err();
        assert_eq!(err, NegotiationError::MissingRequiredFeatures);
        assert_eq!(t.get_status(), status::FAILED);
    }

    #[test]
    fn negotiate_fails_when_device_rejects_features_ok() {
        let mut t = FakeTransport {
            status: 0,
            device_features: VIRTIO_F_VERSION_1,
            driver_features: 0,
            reject_features_ok: true,
        };
        let err = negotiate(&mut t, 0, 0).unwrap_err();
        assert_eq!(err, NegotiationError::FeaturesRejected);
        assert_eq!(t.get_status(), status::FAILED);
    }
}
