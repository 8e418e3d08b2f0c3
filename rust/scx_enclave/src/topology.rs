//! CPU topology of the enclave.
//!
//! The set of CPUs under delegated scheduling is fixed at construction.
//! CPU hotplug is out of scope.

use crate::types::CpuId;

/// One CPU in the enclave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cpu {
    pub id: CpuId,
    /// NUMA node hint for channel placement.
    pub node: u32,
}

/// The iterable set of CPUs participating in the enclave.
#[derive(Debug, Clone)]
pub struct Topology {
    cpus: Vec<Cpu>,
}

impl Topology {
    pub fn new(nr_cpus: u32) -> Self {
        // TODO: derive the node from the machine topology once the enclave
        // spans more than one socket.
        let cpus = (0..nr_cpus)
            .map(|i| Cpu {
                id: CpuId(i),
                node: 0,
            })
            .collect();
        Topology { cpus }
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    /// Look up a CPU by id. Panics on an id outside the enclave.
    pub fn cpu(&self, id: CpuId) -> Cpu {
        self.cpus[id.index()]
    }
}
