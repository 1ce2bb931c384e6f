//! Device identity across platform families.
//!
//! Hosts enumerate hardware in one of two shapes: numeric device ids (desktop
//! audio servers) or named ports that may expose several data sources (a
//! microphone port with front and back capsules, for instance). Both collapse
//! into a [`DeviceIdentity`] whose [`DeviceId`] carries the family as its tag.
//!
//! ```
//! use kanalwahl::device::{DataSource, DeviceIdentity, PlatformDescriptor, PortDescription};
//!
//! let front = DataSource::new("Front");
//! let back = DataSource::new("Back");
//! let port = PortDescription::new("Built-In Microphone", "mic-0")
//!     .with_channels(1)
//!     .with_data_sources(vec![front.clone(), back])
//!     .with_selected_data_source(front);
//!
//! let devices = DeviceIdentity::from_platform_descriptor(&PlatformDescriptor::Port(port));
//! assert_eq!(devices.len(), 2);
//! assert_eq!(devices[0].to_string(), "Built-In Microphone Front");
//! ```

use core::fmt;
use core::hash::{Hash, Hasher};

#[cfg(feature = "cpal_device")]
use cpal::traits::{DeviceTrait, HostTrait};

/// Identifier of a device within its platform family.
///
/// Values from different families are never equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceId {
    /// Numeric hardware id
    Hardware(u32),
    /// Port uid string
    Port(String),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Hardware(id) => write!(f, "{}", id),
            DeviceId::Port(uid) => f.write_str(uid),
        }
    }
}

/// A selectable data source on a port (e.g. one microphone capsule).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSource {
    pub name: String,
}

impl DataSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Snapshot of a numerically identified device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HardwareDescription {
    pub name: Option<String>,
    pub device_id: Option<u32>,
    pub input_channels: Option<u16>,
    pub output_channels: Option<u16>,
}

impl HardwareDescription {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: Some(name.into()),
            device_id: Some(device_id),
            ..Self::default()
        }
    }

    pub fn with_input_channels(mut self, channels: u16) -> Self {
        self.input_channels = Some(channels);
        self
    }

    pub fn with_output_channels(mut self, channels: u16) -> Self {
        self.output_channels = Some(channels);
        self
    }
}

/// Snapshot of a named port.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortDescription {
    pub port_name: Option<String>,
    pub uid: Option<String>,
    /// Channel count, if the platform exposes one
    pub channels: Option<u16>,
    pub data_sources: Vec<DataSource>,
    pub selected_data_source: Option<DataSource>,
}

impl PortDescription {
    pub fn new(port_name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            port_name: Some(port_name.into()),
            uid: Some(uid.into()),
            ..Self::default()
        }
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_data_sources(mut self, data_sources: Vec<DataSource>) -> Self {
        self.data_sources = data_sources;
        self
    }

    pub fn with_selected_data_source(mut self, data_source: DataSource) -> Self {
        self.selected_data_source = Some(data_source);
        self
    }
}

/// One entry of a platform device enumeration feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformDescriptor {
    Hardware(HardwareDescription),
    Port(PortDescription),
}

/// An immutable, comparable handle to an audio endpoint.
///
/// Equality uses the id and the data source name; the display name is ignored.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    name: String,
    id: DeviceId,
    input_channels: Option<u16>,
    output_channels: Option<u16>,
    data_source_name: Option<String>,
}

impl DeviceIdentity {
    /// Build every identity a descriptor expands to.
    ///
    /// Ports with several data sources yield one identity per source; everything
    /// else yields at most one. Descriptors missing their name or id yield none.
    pub fn from_platform_descriptor(descriptor: &PlatformDescriptor) -> Vec<DeviceIdentity> {
        match descriptor {
            PlatformDescriptor::Hardware(hw) => Self::from_hardware(hw).into_iter().collect(),
            PlatformDescriptor::Port(port) => Self::devices_from_port(port),
        }
    }

    /// Expand every descriptor of an enumeration snapshot.
    pub fn from_enumeration<'a>(
        descriptors: impl IntoIterator<Item = &'a PlatformDescriptor>,
    ) -> Vec<DeviceIdentity> {
        descriptors
            .into_iter()
            .flat_map(Self::from_platform_descriptor)
            .collect()
    }

    pub fn from_hardware(hw: &HardwareDescription) -> Option<Self> {
        Some(Self {
            name: hw.name.clone()?,
            id: DeviceId::Hardware(hw.device_id?),
            input_channels: hw.input_channels,
            output_channels: hw.output_channels,
            data_source_name: None,
        })
    }

    /// Identity for one data source of a port.
    ///
    /// Without an explicit `data_source` the port's selected source is used.
    pub fn from_port(port: &PortDescription, data_source: Option<&DataSource>) -> Option<Self> {
        let data_source = data_source.or(port.selected_data_source.as_ref());
        Some(Self {
            name: port.port_name.clone()?,
            id: DeviceId::Port(port.uid.clone()?),
            input_channels: port.channels,
            output_channels: port.channels,
            data_source_name: data_source.map(|ds| ds.name.clone()),
        })
    }

    fn devices_from_port(port: &PortDescription) -> Vec<DeviceIdentity> {
        if port.data_sources.is_empty() {
            return Self::from_port(port, None).into_iter().collect();
        }
        port.data_sources
            .iter()
            .filter_map(|ds| Self::from_port(port, Some(ds)))
            .collect()
    }

    /// Look a port up by name in the current enumeration.
    ///
    /// An empty or absent `data_source_name` selects the port's current data
    /// source. Returns `None` when the port or the named data source is gone.
    pub fn find_port(
        ports: &[PortDescription],
        port_name: &str,
        data_source_name: Option<&str>,
    ) -> Option<Self> {
        let port = ports
            .iter()
            .find(|p| p.port_name.as_deref() == Some(port_name))?;

        match data_source_name.filter(|name| !name.is_empty()) {
            None => Self::from_port(port, None),
            Some(wanted) => {
                let ds = port.data_sources.iter().find(|ds| ds.name == wanted)?;
                Self::from_port(port, Some(ds))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn input_channels(&self) -> Option<u16> {
        self.input_channels
    }

    pub fn output_channels(&self) -> Option<u16> {
        self.output_channels
    }

    pub fn data_source_name(&self) -> Option<&str> {
        self.data_source_name.as_deref()
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        match (&self.id, &other.id) {
            (DeviceId::Hardware(a), DeviceId::Hardware(b)) => a == b,
            (DeviceId::Port(a), DeviceId::Port(b)) => {
                a == b && self.data_source_name == other.data_source_name
            }
            _ => false,
        }
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        if let DeviceId::Port(_) = self.id {
            self.data_source_name.hash(state);
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            DeviceId::Hardware(id) => write!(f, "<Device: {} ({})>", self.name, id),
            DeviceId::Port(_) => write!(
                f,
                "{} {}",
                self.name,
                self.data_source_name.as_deref().unwrap_or("")
            ),
        }
    }
}

/// Enumerate the default cpal host.
///
/// cpal names devices rather than numbering them, so every device becomes a
/// port descriptor whose uid is its name. Channel counts come from the
/// device's default config and stay unset when it can't be queried.
#[cfg(feature = "cpal_device")]
pub struct CpalEnumeration;

#[cfg(feature = "cpal_device")]
impl CpalEnumeration {
    /// List all input devices of the default host.
    ///
    /// Returns an empty list if enumeration fails.
    pub fn inputs() -> Vec<PlatformDescriptor> {
        let host = cpal::default_host();
        host.input_devices()
            .map(|devices| {
                devices
                    .filter_map(|device| {
                        let channels = device.default_input_config().ok().map(|c| c.channels());
                        Self::describe(&device, channels)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// List all output devices of the default host.
    pub fn outputs() -> Vec<PlatformDescriptor> {
        let host = cpal::default_host();
        host.output_devices()
            .map(|devices| {
                devices
                    .filter_map(|device| {
                        let channels = device.default_output_config().ok().map(|c| c.channels());
                        Self::describe(&device, channels)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn describe(device: &cpal::Device, channels: Option<u16>) -> Option<PlatformDescriptor> {
        let name = device.name().ok()?;
        let mut port = PortDescription::new(name.clone(), name);
        port.channels = channels;
        Some(PlatformDescriptor::Port(port))
    }
}
