use std::path::PathBuf;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{HyperboxError, HyperboxResult};

use super::{DEFAULT_MAX_CPUS, DEFAULT_MAX_MEM_MIB, DEFAULT_NUM_VCPUS, DEFAULT_RAM_MIB};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a sandbox VM is booted.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct BootConfig {
    /// The number of vCPUs to boot with.
    #[serde(default = "default_cpus")]
    #[builder(default = DEFAULT_NUM_VCPUS)]
    cpus: u32,

    /// The amount of RAM in MiB to boot with.
    #[serde(default = "default_memory")]
    #[builder(default = DEFAULT_RAM_MIB)]
    memory_mib: u32,

    /// The guest kernel image.
    #[builder(setter(into))]
    kernel: PathBuf,

    /// The guest initrd carrying the agent.
    #[builder(setter(into))]
    initrd: PathBuf,

    /// An optional firmware image.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option, into))]
    bios: Option<PathBuf>,

    /// An optional coreboot filesystem image.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option, into))]
    cbfs: Option<PathBuf>,

    /// Whether the guest agent is reached over vsock instead of unix sockets.
    #[serde(default)]
    #[builder(default)]
    enable_vsock: bool,

    /// Extra options passed through to the hypervisor backend.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option, into))]
    options: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BootConfig {
    /// Checks that the boot parameters describe a bootable VM.
    pub fn validate(&self) -> HyperboxResult<()> {
        if self.cpus == 0 {
            return Err(HyperboxError::Spec("number of vCPUs is zero".to_string()));
        }

        if self.cpus > DEFAULT_MAX_CPUS {
            return Err(HyperboxError::Spec(format!(
                "number of vCPUs {} exceeds the maximum of {DEFAULT_MAX_CPUS}",
                self.cpus
            )));
        }

        if self.memory_mib == 0 {
            return Err(HyperboxError::Spec("amount of RAM is zero".to_string()));
        }

        if self.memory_mib > DEFAULT_MAX_MEM_MIB {
            return Err(HyperboxError::Spec(format!(
                "amount of RAM {} MiB exceeds the maximum of {DEFAULT_MAX_MEM_MIB} MiB",
                self.memory_mib
            )));
        }

        if self.kernel.as_os_str().is_empty() {
            return Err(HyperboxError::Spec("kernel path is empty".to_string()));
        }

        if self.initrd.as_os_str().is_empty() {
            return Err(HyperboxError::Spec("initrd path is empty".to_string()));
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_cpus() -> u32 {
    DEFAULT_NUM_VCPUS
}

fn default_memory() -> u32 {
    DEFAULT_RAM_MIB
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
