// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::port::TlpHandler;
use crate::port::TlpSink;
use crate::tlp::Tlp;
use parking_lot::Mutex;
use pci_core::spec::hwid::ClassCode;
use pci_core::spec::hwid::HardwareIds;
use pci_core::spec::hwid::ProgrammingInterface;
use pci_core::spec::hwid::Subclass;
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn bridge_hardware_ids() -> HardwareIds {
    HardwareIds {
        vendor_id: 0x1234,
        device_id: 0x5678,
        revision_id: 0,
        prog_if: ProgrammingInterface::NONE,
        sub_class: Subclass::BRIDGE_PCI_TO_PCI,
        base_class: ClassCode::BRIDGE,
        type0_sub_vendor_id: 0,
        type0_sub_system_id: 0,
    }
}

pub fn endpoint_hardware_ids() -> HardwareIds {
    HardwareIds {
        vendor_id: 0x1234,
        device_id: 0xABCD,
        revision_id: 1,
        prog_if: ProgrammingInterface::NONE,
        sub_class: Subclass::NONE,
        base_class: ClassCode::NETWORK_CONTROLLER,
        type0_sub_vendor_id: 0x1234,
        type0_sub_system_id: 0x0001,
    }
}

/// Records every packet it is handed. Clones share the same log.
#[derive(Clone, Default)]
pub struct TlpLog(Arc<Mutex<Vec<Tlp>>>);

impl TlpLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Tlp> {
        std::mem::take(&mut *self.0.lock())
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

impl TlpSink for TlpLog {
    fn send(&mut self, tlp: Tlp) {
        self.0.lock().push(tlp);
    }
}

impl TlpHandler for TlpLog {
    fn handle_tlp(&mut self, tlp: Tlp, _responses: &mut Vec<Tlp>) {
        self.0.lock().push(tlp);
    }
}
