//! Named stations and the acquisition backends available to them.
//!
//! All methods take `&mut self`; wrap the manager in a mutex to configure
//! stations from more than one thread.

use std::collections::BTreeMap;
use std::str::FromStr;

use tracing::{info, warn};

use crate::backend::AcquisitionAdapter;
use crate::controller::{MAX_PRIORITY, Station, StationConfig, StationHandle};
use crate::error::ConfigurationError;
use crate::logging;

/// A setup-time command addressed to one station.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetupCommand {
    /// Associate with the registered backend of this name
    Associate(String),
    Priority(u8),
    Start,
}

impl SetupCommand {
    /// Parse a `(key, value)` pair. Keys are case-insensitive; `value` is ignored for `THRD_CRAT`.
    pub fn parse(key: &str, value: &str) -> Result<Self, ConfigurationError> {
        match key.to_ascii_uppercase().as_str() {
            "RFCFW_NAME" | "BACKEND" => Ok(SetupCommand::Associate(value.trim().to_owned())),
            "THRD_PRIO" | "PRIORITY" => value
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= MAX_PRIORITY)
                .map(SetupCommand::Priority)
                .ok_or_else(|| ConfigurationError::InvalidPriority(value.to_owned())),
            "THRD_CRAT" | "START" => Ok(SetupCommand::Start),
            _ => Err(ConfigurationError::UnknownCommand(key.to_owned())),
        }
    }
}

enum BackendSlot {
    Available(Box<dyn AcquisitionAdapter>),
    /// Associated with the named station
    Claimed(String),
}

/// Owns every station and backend of a process.
#[derive(Default)]
pub struct Manager {
    stations: BTreeMap<String, Station>,
    backends: BTreeMap<String, BackendSlot>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a backend available for association under `name`.
    pub fn register_backend(
        &mut self,
        name: &str,
        backend: Box<dyn AcquisitionAdapter>,
    ) -> Result<(), ConfigurationError> {
        validate_name(name)?;
        if self.backends.contains_key(name) {
            return Err(ConfigurationError::DuplicateBackend(name.to_owned()));
        }
        info!("Registered backend {name} ({})", backend.kind());
        self.backends
            .insert(name.to_owned(), BackendSlot::Available(backend));
        Ok(())
    }

    /// Create a station with default configuration.
    pub fn create(&mut self, name: &str) -> Result<StationHandle, ConfigurationError> {
        self.create_with(StationConfig::new(name))
    }

    pub fn create_with(&mut self, config: StationConfig) -> Result<StationHandle, ConfigurationError> {
        validate_name(&config.name)?;
        if self.stations.contains_key(&config.name) {
            return Err(ConfigurationError::DuplicateName(config.name));
        }
        let station = Station::new(config);
        let handle = station.handle();
        info!("Created station {}", station.name());
        self.stations.insert(station.name().to_owned(), station);
        Ok(handle)
    }

    /// Stop and remove a station, returning its backend to the pool.
    pub fn delete(&mut self, name: &str) -> Result<(), ConfigurationError> {
        let mut station = self
            .stations
            .remove(name)
            .ok_or_else(|| ConfigurationError::UnknownStation(name.to_owned()))?;
        match station.release_backend() {
            Some((backend_name, backend)) => {
                self.backends
                    .insert(backend_name, BackendSlot::Available(backend));
            }
            None => {
                // The backend went down with a panicked or unspawned thread
                let lost: Vec<String> = self
                    .backends
                    .iter()
                    .filter(|(_, slot)| matches!(slot, BackendSlot::Claimed(s) if s == name))
                    .map(|(backend, _)| backend.clone())
                    .collect();
                for backend in lost {
                    warn!("Backend {backend} was lost with station {name} and is unregistered");
                    self.backends.remove(&backend);
                }
            }
        }
        logging::close_station_log(name);
        info!("Deleted station {name}");
        Ok(())
    }

    /// Apply a `(key, value)` setup command to a station.
    pub fn configure(&mut self, name: &str, key: &str, value: &str) -> Result<(), ConfigurationError> {
        if !self.stations.contains_key(name) {
            return Err(ConfigurationError::UnknownStation(name.to_owned()));
        }
        match SetupCommand::parse(key, value)? {
            SetupCommand::Associate(backend) => self.associate(name, &backend),
            SetupCommand::Priority(p) => self.station_mut(name)?.set_priority(p),
            SetupCommand::Start => self.station_mut(name)?.start(),
        }
    }

    /// Associate a station with a registered backend, initializing the backend.
    pub fn associate(&mut self, name: &str, backend_name: &str) -> Result<(), ConfigurationError> {
        self.station_mut(name)?.check_unassociated()?;

        let slot = self
            .backends
            .get_mut(backend_name)
            .ok_or_else(|| ConfigurationError::UnknownBackend(backend_name.to_owned()))?;
        match &mut *slot {
            BackendSlot::Claimed(station) => {
                return Err(ConfigurationError::BackendClaimed {
                    backend: backend_name.to_owned(),
                    station: station.clone(),
                });
            }
            BackendSlot::Available(backend) => {
                backend
                    .init()
                    .map_err(|source| ConfigurationError::BackendInit {
                        name: backend_name.to_owned(),
                        source,
                    })?;
            }
        }

        let BackendSlot::Available(backend) =
            std::mem::replace(slot, BackendSlot::Claimed(name.to_owned()))
        else {
            return Err(ConfigurationError::UnknownBackend(backend_name.to_owned()));
        };
        self.station_mut(name)?.attach(backend_name, backend)
    }

    pub fn station(&self, name: &str) -> Option<StationHandle> {
        self.stations.get(name).map(Station::handle)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.stations.get(name).is_some_and(Station::is_running)
    }

    pub fn station_names(&self) -> impl Iterator<Item = &str> {
        self.stations.keys().map(String::as_str)
    }

    /// Backend names not yet claimed by a station
    pub fn available_backends(&self) -> impl Iterator<Item = &str> {
        self.backends
            .iter()
            .filter(|(_, slot)| matches!(slot, BackendSlot::Available(_)))
            .map(|(name, _)| name.as_str())
    }

    fn station_mut(&mut self, name: &str) -> Result<&mut Station, ConfigurationError> {
        self.stations
            .get_mut(name)
            .ok_or_else(|| ConfigurationError::UnknownStation(name.to_owned()))
    }
}

/// Names end up in thread names and log file names.
fn validate_name(name: &str) -> Result<(), ConfigurationError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidName(name.to_owned()))
    }
}

impl FromStr for SetupCommand {
    type Err = ConfigurationError;

    /// Parse `KEY=VALUE` or a bare `KEY`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s.split_once('=').unwrap_or((s, ""));
        Self::parse(key.trim(), value)
    }
}
