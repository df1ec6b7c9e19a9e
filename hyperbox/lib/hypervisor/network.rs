//! Network interface bookkeeping of a sandbox.

use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::{
    config::{SandboxConfig, SHARE_DIR_TAG},
    hyperstart::{Pod, PortmappingWhiteList, Route},
    HyperboxError, HyperboxResult,
};

use super::NetworkSettings;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The guest device name of loopback aliases.
pub const LO_DEVICE_NAME: &str = "lo";

/// The mask of loopback aliases.
pub const LO_NET_MASK: &str = "255.255.255.255";

/// The destination of a default route.
pub const DEFAULT_ROUTE: &str = "0.0.0.0/0";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An interface to add to a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescription {
    /// The interface id.
    pub id: String,

    /// Whether this is a loopback alias, which only carries an address.
    #[serde(default)]
    pub lo: bool,

    /// The bridge to attach the host device to.
    #[serde(default)]
    pub bridge: String,

    /// The IPv4 address in CIDR form. Empty to let the host allocate one.
    #[serde(default)]
    pub ip: String,

    /// The MAC address.
    #[serde(default)]
    pub mac: String,

    /// The gateway. An interface with a gateway carries the default route.
    #[serde(default)]
    pub gateway: String,

    /// The host tap device to use.
    #[serde(default)]
    pub tap_name: String,

    /// The MTU.
    #[serde(default)]
    pub mtu: u32,

    /// Backend specific options.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub options: BTreeMap<String, String>,
}

/// An interface attached to a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCreated {
    /// The interface id.
    pub id: String,

    /// The eth slot.
    pub index: usize,

    /// The PCI address.
    pub pci_addr: u32,

    /// The bridge of the host device.
    pub bridge: String,

    /// The host device. Empty for loopback aliases.
    pub host_device: String,

    /// The device name inside the guest.
    pub device_name: String,

    /// The MAC address.
    pub mac: String,

    /// The IPv4 address.
    pub ip_addr: String,

    /// The dotted network mask.
    pub net_mask: String,

    /// Routes through this interface.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub route_table: Vec<RouteRule>,
}

/// A route through an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// The destination network in CIDR form.
    pub destination: String,

    /// The gateway.
    pub gateway: String,

    /// Whether traffic leaves through the interface owning the rule.
    pub via_this: bool,
}

/// The interfaces of a sandbox and the sandbox-wide network environment.
///
/// Eth slots are reserved before the backend is asked for a device, so concurrent adds never
/// collide. A reserved slot holds no interface until the host side has been configured.
#[derive(Debug)]
pub struct NetworkContext {
    state: Mutex<NetworkState>,
    max_nics: usize,
}

#[derive(Debug, Default)]
struct NetworkState {
    config: SandboxConfig,
    eth: BTreeMap<usize, EthSlot>,
    lo: HashMap<String, InterfaceCreated>,
    ids: HashMap<String, InterfaceCreated>,
}

#[derive(Debug)]
struct EthSlot {
    owner: String,
    device_name: String,
    inf: Option<InterfaceCreated>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetworkState {
    fn ensure_unused(&self, id: &str) -> HyperboxResult<()> {
        if self.ids.contains_key(id) || self.eth.values().any(|slot| slot.owner == id) {
            return Err(HyperboxError::Conflict(format!("interface {id} already exists")));
        }
        Ok(())
    }
}

impl InterfaceCreated {
    /// Builds the guest side of an interface from the host settings.
    ///
    /// The first interface of an automatically configured sandbox, or any interface with an
    /// explicit gateway, carries the default route.
    pub fn from_settings(
        id: &str,
        index: usize,
        pci_addr: u32,
        device_name: String,
        settings: &NetworkSettings,
    ) -> HyperboxResult<Self> {
        let ip: Ipv4Addr = settings.ip_address.parse().map_err(|e| {
            HyperboxError::Spec(format!("invalid address {:?}: {e}", settings.ip_address))
        })?;
        let network = Ipv4Network::new(ip, settings.ip_prefix_len)
            .map_err(|e| HyperboxError::Spec(format!("invalid prefix: {e}")))?;

        let mut route_table = Vec::new();
        if (index == 0 && settings.automatic) || (!settings.automatic && !settings.gateway.is_empty())
        {
            route_table.push(RouteRule {
                destination: DEFAULT_ROUTE.to_string(),
                gateway: settings.gateway.clone(),
                via_this: true,
            });
        }

        Ok(Self {
            id: id.to_string(),
            index,
            pci_addr,
            bridge: settings.bridge.clone(),
            host_device: settings.device.clone(),
            device_name,
            mac: settings.mac.clone(),
            ip_addr: ip.to_string(),
            net_mask: network.mask().to_string(),
            route_table,
        })
    }

    /// Returns `true` for a loopback alias.
    pub fn is_lo(&self) -> bool {
        self.host_device.is_empty()
    }
}

impl NetworkContext {
    /// Creates an empty context with `max_nics` eth slots.
    pub fn new(max_nics: usize) -> Self {
        Self {
            state: Mutex::new(NetworkState::default()),
            max_nics,
        }
    }

    /// Sets the sandbox-wide network environment.
    pub fn set_config(&self, config: SandboxConfig) {
        self.lock().config = config;
    }

    /// Returns the sandbox-wide network environment.
    pub fn config(&self) -> SandboxConfig {
        self.lock().config.clone()
    }

    /// Files a loopback alias. Aliases use no slot and no PCI address.
    pub fn add_lo(&self, inf: &InterfaceDescription) -> HyperboxResult<()> {
        if inf.ip.is_empty() {
            return Err(HyperboxError::Spec(format!(
                "interface {} has no address",
                inf.id
            )));
        }

        let ip = inf.ip.split('/').next().unwrap_or_default().to_string();
        let created = InterfaceCreated {
            id: inf.id.clone(),
            device_name: LO_DEVICE_NAME.to_string(),
            ip_addr: ip.clone(),
            net_mask: LO_NET_MASK.to_string(),
            ..Default::default()
        };

        let mut state = self.lock();
        state.ensure_unused(&inf.id)?;
        state.lo.insert(ip, created.clone());
        state.ids.insert(created.id.clone(), created);
        Ok(())
    }

    /// Reserves the lowest free eth slot and the lowest unused guest device name for the
    /// interface `id`, which must not be attached or being attached already.
    ///
    /// The guest renames hotplugged devices, so the name does not follow the slot.
    pub fn apply_slot(&self, id: &str) -> HyperboxResult<(usize, String)> {
        let mut state = self.lock();
        state.ensure_unused(id)?;
        let slot = (0..self.max_nics)
            .find(|i| !state.eth.contains_key(i))
            .ok_or_else(|| HyperboxError::Busy("no available ethernet slot".to_string()))?;

        let device_name = (0..)
            .map(|n| format!("eth{n}"))
            .find(|name| state.eth.values().all(|s| &s.device_name != name))
            .unwrap_or_default();

        state.eth.insert(
            slot,
            EthSlot {
                owner: id.to_string(),
                device_name: device_name.clone(),
                inf: None,
            },
        );
        tracing::debug!(slot, interface = id, device = %device_name, "eth slot reserved");
        Ok((slot, device_name))
    }

    /// Frees an eth slot and forgets its interface.
    pub fn free_slot(&self, slot: usize) {
        let mut state = self.lock();
        match state.eth.remove(&slot) {
            None => tracing::warn!(slot, "freeing an unoccupied eth slot"),
            Some(freed) => {
                if let Some(inf) = freed.inf {
                    state.ids.remove(&inf.id);
                }
                tracing::debug!(slot, "eth slot freed");
            }
        }
    }

    /// Records the interface configured in a reserved slot.
    pub fn configured(&self, created: InterfaceCreated) {
        let mut state = self.lock();
        state.ids.insert(created.id.clone(), created.clone());
        state.eth.insert(
            created.index,
            EthSlot {
                owner: created.id.clone(),
                device_name: created.device_name.clone(),
                inf: Some(created),
            },
        );
    }

    /// Returns `true` if the slot is reserved or in use.
    pub fn has_slot(&self, slot: usize) -> bool {
        self.lock().eth.contains_key(&slot)
    }

    /// Looks an interface up by id.
    pub fn get_interface(&self, id: &str) -> Option<InterfaceCreated> {
        self.lock().ids.get(id).cloned()
    }

    /// Forgets a loopback alias.
    pub fn remove_lo(&self, id: &str) {
        let mut state = self.lock();
        if let Some(inf) = state.ids.remove(id) {
            state.lo.remove(&inf.ip_addr);
        }
    }

    /// Forgets an interface id without touching slots.
    pub fn forget(&self, id: &str) {
        self.lock().ids.remove(id);
    }

    /// Returns every interface, eth ones by slot order and then loopback aliases.
    pub fn interfaces(&self) -> Vec<InterfaceCreated> {
        let state = self.lock();
        let mut lo: Vec<_> = state.lo.values().cloned().collect();
        lo.sort_by(|a, b| a.id.cmp(&b.id));
        state
            .eth
            .values()
            .filter_map(|s| s.inf.clone())
            .chain(lo)
            .collect()
    }

    /// Returns the addresses of the eth interfaces.
    pub fn get_ip_addrs(&self) -> Vec<String> {
        self.lock()
            .eth
            .values()
            .filter_map(|s| s.inf.as_ref())
            .map(|inf| inf.ip_addr.clone())
            .collect()
    }

    /// Returns the complete route table of the sandbox.
    pub fn get_routes(&self) -> Vec<Route> {
        let state = self.lock();
        let mut interfaces: Vec<_> = state.ids.values().collect();
        interfaces.sort_by_key(|inf| (inf.is_lo(), inf.index, inf.id.clone()));

        interfaces
            .into_iter()
            .flat_map(|inf| {
                inf.route_table.iter().map(|rule| Route {
                    dest: rule.destination.clone(),
                    gateway: rule.gateway.clone(),
                    device: inf.device_name.clone(),
                })
            })
            .collect()
    }

    /// Builds the sandbox description sent to the guest when the sandbox starts.
    pub fn sandbox_info(&self) -> Pod {
        let config = self.config();
        Pod {
            hostname: config.get_hostname().clone(),
            dns: config.get_dns().clone(),
            dns_search: config.get_dns_search().clone(),
            dns_options: config.get_dns_options().clone(),
            routes: self.get_routes(),
            share_dir: SHARE_DIR_TAG.to_string(),
            portmapping_white_lists: config.get_port_whitelist().as_ref().map(|w| {
                PortmappingWhiteList {
                    internal_networks: w.get_internal_networks().clone(),
                    external_networks: w.get_external_networks().clone(),
                }
            }),
        }
    }

    /// Restores an interface recorded in a snapshot.
    pub(crate) fn restore(&self, inf: InterfaceCreated) {
        if inf.device_name == LO_DEVICE_NAME {
            let mut state = self.lock();
            state.lo.insert(inf.ip_addr.clone(), inf.clone());
            state.ids.insert(inf.id.clone(), inf);
        } else {
            self.configured(inf);
        }
    }

    /// Forgets every interface.
    pub fn close(&self) {
        let mut state = self.lock();
        state.eth.clear();
        state.lo.clear();
        state.ids.clear();
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
