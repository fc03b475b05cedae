/// Default first emulator console/adb port; the emulator claims it and the
/// following odd port per instance, hence the stride of two.
pub const DEFAULT_BASE_PORT: u16 = 5554;
/// Default first automation-server port, strided identically.
pub const DEFAULT_AUTOMATION_BASE_PORT: u16 = 4723;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAssignment {
    pub device_port: u16,
    pub automation_port: u16,
}

/// Deterministic worker-index to port-pair mapping. Distinct indices always
/// receive disjoint pairs, so concurrently running workers never contend for
/// a port.
pub fn assign_ports(
    worker_index: u16,
    base_port: u16,
    automation_base_port: u16,
) -> PortAssignment {
    PortAssignment {
        device_port: base_port + 2 * worker_index,
        automation_port: automation_base_port + 2 * worker_index,
    }
}
