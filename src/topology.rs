//! The benchmark topology: which services run where, and in what order they may start.
//!
//! A topology is loaded once from a benchmark descriptor and never mutated afterwards. Loading
//! validates that every service has exactly one host, that dependencies name real roles, and that
//! the dependency graph is acyclic, so nothing downstream has to re-check these properties.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TopologyError};
use crate::executor::quote;

/// The SSH port used when neither the host nor the runtime config names one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Where and how to reach the machine that runs one role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSpec {
    /// The role this host serves (e.g. `frontend`).
    pub role: String,
    /// A network address for the host, without the port.
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// The username to log in as. Falls back to the runtime config.
    #[serde(default)]
    pub username: Option<String>,
    /// A private key to authenticate with. Falls back to the runtime config.
    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// A local file and the place it should be copied to on the remote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileMapping {
    pub local: PathBuf,
    pub remote: String,
}

/// One service of the benchmark.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub role: String,

    /// The program or container image this service runs. Used to derive the default stop and
    /// health commands.
    pub binary: String,

    /// Starts the service. The command must return once the service is launched in the background
    /// (e.g. `docker run -d ...` or `nohup ... &`).
    pub start: String,

    /// Stops the service. Defaults to `pkill -f` of the binary's command line.
    #[serde(default)]
    pub stop: Option<String>,

    /// Exits with zero once the service accepts work. Defaults to `pgrep -f` of the binary's
    /// command line, i.e. "process alive".
    #[serde(default)]
    pub health: Option<String>,

    /// The service's configuration file.
    #[serde(default)]
    pub config: Option<FileMapping>,

    /// Additional files (usually binaries) to push before starting.
    #[serde(default)]
    pub uploads: Vec<FileMapping>,

    /// Remote paths of the result files this service produces.
    #[serde(default)]
    pub artifacts: Vec<String>,

    /// Roles that must be ready before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// The remote directory commands run in. Overrides the runtime config's `workdir`.
    #[serde(default)]
    pub workdir: Option<String>,

    /// Extra environment for this service's commands.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn stop_command(&self) -> String {
        self.stop.clone().unwrap_or_else(|| {
            format!("pkill -f -- {}", quote(&process_pattern(&self.binary)))
        })
    }

    pub fn health_command(&self) -> String {
        self.health.clone().unwrap_or_else(|| {
            format!("pgrep -f -- {}", quote(&process_pattern(&self.binary)))
        })
    }

    /// Every file that has to be on the host before `start` runs, config first.
    pub fn pushes(&self) -> impl Iterator<Item = &FileMapping> {
        self.config.iter().chain(self.uploads.iter())
    }
}

/// An extended regex matching `binary` literally. The first alphanumeric character is bracketed,
/// so the pattern does not match the command line of the shell or `pgrep` that carries it.
pub(crate) fn process_pattern(binary: &str) -> String {
    let mut pattern = String::with_capacity(binary.len() + 2);
    let mut bracketed = false;
    for c in binary.chars() {
        if !bracketed && c.is_ascii_alphanumeric() {
            pattern.push('[');
            pattern.push(c);
            pattern.push(']');
            bracketed = true;
        } else {
            if r".^$*+?()[]{}|\".contains(c) {
                pattern.push('\\');
            }
            pattern.push(c);
        }
    }
    pattern
}

/// The descriptor as written on disk.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BenchmarkDescriptor {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "host")]
    hosts: Vec<HostSpec>,
    #[serde(default, rename = "service")]
    services: Vec<ServiceSpec>,
}

/// A validated benchmark topology.
#[derive(Clone, Debug)]
pub struct Topology {
    name: String,
    description: Option<String>,
    /// In declaration order.
    services: Vec<ServiceSpec>,
    hosts: BTreeMap<String, HostSpec>,
    index: HashMap<String, usize>,
    /// Indices into `services`, dependencies before dependents.
    order: Vec<usize>,
}

impl Topology {
    /// Read and validate the benchmark descriptor at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let desc: BenchmarkDescriptor =
            toml::from_str(&contents).map_err(|e| ConfigError::parse(path, e))?;
        let mut topology = Topology::new(&desc.name, desc.hosts, desc.services)?;
        topology.description = desc.description;
        Ok(topology)
    }

    /// Validate the given hosts and services and compute the start order.
    pub fn new(
        name: &str,
        hosts: Vec<HostSpec>,
        services: Vec<ServiceSpec>,
    ) -> Result<Self, TopologyError> {
        let mut index = HashMap::new();
        for (i, svc) in services.iter().enumerate() {
            check_role_name(&svc.role)?;
            if index.insert(svc.role.clone(), i).is_some() {
                return Err(TopologyError::DuplicateService {
                    role: svc.role.clone(),
                });
            }
        }

        let mut host_map = BTreeMap::new();
        for host in hosts.into_iter() {
            if !index.contains_key(&host.role) {
                return Err(TopologyError::UnusedHost { role: host.role });
            }
            let role = host.role.clone();
            if host_map.insert(role.clone(), host).is_some() {
                return Err(TopologyError::DuplicateHost { role });
            }
        }

        for svc in services.iter() {
            if !host_map.contains_key(&svc.role) {
                return Err(TopologyError::MissingHost {
                    role: svc.role.clone(),
                });
            }
            for dep in svc.depends_on.iter() {
                if !index.contains_key(dep) {
                    return Err(TopologyError::UnknownDependency {
                        role: svc.role.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let order = sort_by_dependencies(&services, &index)?;

        Ok(Topology {
            name: name.to_owned(),
            description: None,
            services,
            hosts: host_map,
            index,
            order,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Services in declaration order.
    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    pub fn service(&self, role: &str) -> Option<&ServiceSpec> {
        self.index.get(role).map(|&i| &self.services[i])
    }

    pub fn host(&self, role: &str) -> Option<&HostSpec> {
        self.hosts.get(role)
    }

    /// Services ordered so that every service comes after all of its dependencies. Ties keep
    /// declaration order.
    pub fn start_order(&self) -> impl Iterator<Item = &ServiceSpec> + '_ {
        self.order.iter().map(move |&i| &self.services[i])
    }

    /// The roles that list `role` in their `depends_on`.
    pub fn dependents(&self, role: &str) -> Vec<&str> {
        self.services
            .iter()
            .filter(|svc| svc.depends_on.iter().any(|d| d == role))
            .map(|svc| svc.role.as_str())
            .collect()
    }
}

/// Role names end up in local file names, so keep them to a safe alphabet.
fn check_role_name(role: &str) -> Result<(), TopologyError> {
    let valid = !role.is_empty()
        && role
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TopologyError::InvalidRole { role: role.into() })
    }
}

/// Kahn's algorithm, always picking the earliest-declared service among those whose dependencies
/// are satisfied.
fn sort_by_dependencies(
    services: &[ServiceSpec],
    index: &HashMap<String, usize>,
) -> Result<Vec<usize>, TopologyError> {
    let mut remaining: Vec<HashSet<usize>> = services
        .iter()
        .map(|svc| svc.depends_on.iter().map(|d| index[d]).collect())
        .collect();
    let mut placed = vec![false; services.len()];
    let mut order = Vec::with_capacity(services.len());

    while order.len() < services.len() {
        let next = (0..services.len()).find(|&i| !placed[i] && remaining[i].is_empty());

        let next = match next {
            Some(next) => next,
            None => {
                let stuck: Vec<_> = (0..services.len())
                    .filter(|&i| !placed[i])
                    .map(|i| services[i].role.as_str())
                    .collect();
                return Err(TopologyError::Cycle {
                    roles: stuck.join(", "),
                });
            }
        };

        placed[next] = true;
        order.push(next);
        for deps in remaining.iter_mut() {
            deps.remove(&next);
        }
    }

    Ok(order)
}
