//! Network and power conditions that gate background refresh.

use std::fs;
use std::path::{Path, PathBuf};

/// Kind of network link a device is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Wifi,
    Cellular,
    Ethernet,
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStatus {
    pub transports: Vec<Transport>,
    pub has_internet: bool,
}

impl NetworkStatus {
    pub fn offline() -> Self {
        Self::default()
    }

    /// Wi-Fi, cellular or ethernet, plus a route to the internet.
    pub fn is_usable(&self) -> bool {
        self.has_internet
            && self
                .transports
                .iter()
                .any(|t| matches!(t, Transport::Wifi | Transport::Cellular | Transport::Ethernet))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerPolicy {
    pub min_battery_percent: u8,
}

impl Default for PowerPolicy {
    fn default() -> Self {
        Self { min_battery_percent: 15 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerStatus {
    pub power_save: bool,
    /// `None` when the level cannot be read (no battery, unsupported platform)
    pub battery_percent: Option<u8>,
}

impl PowerStatus {
    pub fn is_acceptable(&self, policy: PowerPolicy) -> bool {
        if self.power_save {
            return false;
        }
        self.battery_percent.map_or(true, |level| level >= policy.min_battery_percent)
    }
}

/// Source of device state. Reads may block briefly (filesystem).
pub trait DeviceConditions: Send + Sync {
    fn network(&self) -> NetworkStatus;
    fn power(&self) -> PowerStatus;
}

/// Whether a background batch may run right now.
pub fn allows_background_refresh(conditions: &dyn DeviceConditions, policy: PowerPolicy) -> bool {
    let network = conditions.network();
    if !network.is_usable() {
        tracing::debug!("Background refresh gated: no usable network ({:?})", network);
        return false;
    }
    let power = conditions.power();
    if !power.is_acceptable(policy) {
        tracing::debug!("Background refresh gated: power not acceptable ({:?})", power);
        return false;
    }
    true
}

/// Fixed conditions, for configuration overrides and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticConditions {
    pub network: NetworkStatus,
    pub power: PowerStatus,
}

impl StaticConditions {
    pub fn new(network: NetworkStatus, power: PowerStatus) -> Self {
        Self { network, power }
    }

    /// Wi-Fi with internet, no power saving, unknown battery.
    pub fn online() -> Self {
        Self::new(
            NetworkStatus { transports: vec![Transport::Wifi], has_internet: true },
            PowerStatus::default(),
        )
    }

    pub fn offline() -> Self {
        Self::new(NetworkStatus::offline(), PowerStatus::default())
    }

    pub fn with_battery(mut self, percent: u8) -> Self {
        self.power.battery_percent = Some(percent);
        self
    }

    pub fn with_power_save(mut self, power_save: bool) -> Self {
        self.power.power_save = power_save;
        self
    }
}

impl DeviceConditions for StaticConditions {
    fn network(&self) -> NetworkStatus {
        self.network.clone()
    }

    fn power(&self) -> PowerStatus {
        self.power
    }
}

/// Linux conditions read from sysfs and procfs.
///
/// An interface counts when its `operstate` is `up`. Internet capability means
/// the kernel routing table has a default route.
#[derive(Debug, Clone)]
pub struct SysfsConditions {
    net_root: PathBuf,
    route_table: PathBuf,
    power_root: PathBuf,
    platform_profile: PathBuf,
}

impl Default for SysfsConditions {
    fn default() -> Self {
        Self {
            net_root: PathBuf::from("/sys/class/net"),
            route_table: PathBuf::from("/proc/net/route"),
            power_root: PathBuf::from("/sys/class/power_supply"),
            platform_profile: PathBuf::from("/sys/firmware/acpi/platform_profile"),
        }
    }
}

impl SysfsConditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read from alternative roots (containers, tests).
    pub fn with_roots(
        net_root: impl Into<PathBuf>,
        route_table: impl Into<PathBuf>,
        power_root: impl Into<PathBuf>,
        platform_profile: impl Into<PathBuf>,
    ) -> Self {
        Self {
            net_root: net_root.into(),
            route_table: route_table.into(),
            power_root: power_root.into(),
            platform_profile: platform_profile.into(),
        }
    }

    fn active_transports(&self) -> Vec<Transport> {
        let Ok(entries) = fs::read_dir(&self.net_root) else {
            return Vec::new();
        };

        let mut transports = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "lo" {
                continue;
            }
            let dir = entry.path();
            if read_trimmed(&dir.join("operstate")).as_deref() != Some("up") {
                continue;
            }
            let transport = classify_interface(&name, &dir);
            if !transports.contains(&transport) {
                transports.push(transport);
            }
        }
        transports
    }

    fn has_default_route(&self) -> bool {
        let Some(table) = fs::read_to_string(&self.route_table).ok() else {
            return false;
        };
        // Columns: Iface Destination Gateway ...
        table
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|destination| destination == "00000000")
    }

    fn battery_percent(&self) -> Option<u8> {
        let entries = fs::read_dir(&self.power_root).ok()?;
        entries.flatten().find_map(|entry| {
            let dir = entry.path();
            if read_trimmed(&dir.join("type")).as_deref() != Some("Battery") {
                return None;
            }
            read_trimmed(&dir.join("capacity"))?.parse::<u8>().ok().map(|p| p.min(100))
        })
    }

    fn power_save(&self) -> bool {
        read_trimmed(&self.platform_profile).as_deref() == Some("low-power")
    }
}

impl DeviceConditions for SysfsConditions {
    fn network(&self) -> NetworkStatus {
        NetworkStatus {
            transports: self.active_transports(),
            has_internet: self.has_default_route(),
        }
    }

    fn power(&self) -> PowerStatus {
        PowerStatus {
            power_save: self.power_save(),
            battery_percent: self.battery_percent(),
        }
    }
}

fn classify_interface(name: &str, dir: &Path) -> Transport {
    if dir.join("wireless").exists() || name.starts_with("wl") {
        Transport::Wifi
    } else if name.starts_with("wwan") || name.starts_with("rmnet") || name.starts_with("ppp") {
        Transport::Cellular
    } else if name.starts_with("en") || name.starts_with("eth") {
        Transport::Ethernet
    } else {
        Transport::Other
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}
