//! Pure server selection over a [`TopologyDescription`].
//!
//! The waiting and retrying part lives on [`Topology::select_server`](crate::Topology::select_server);
//! everything here is a deterministic filter except the final random pick.
use std::{collections::HashMap, time::Duration};

use rand::seq::SliceRandom;

use crate::{
    error_chain_fmt,
    server_description::{ServerDescription, ServerType},
    topology_description::{wire_compatibility_error, TopologyDescription, TopologyType},
};

/// Smallest `max_staleness` a read preference may ask for.
pub const SMALLEST_MAX_STALENESS: Duration = Duration::from_secs(90);
/// How often an idle primary writes a no-op, bounding staleness measurement error.
pub const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

pub type TagSet = HashMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadPreferenceOptions {
    /// Tried in order; the first set matching any candidate wins.
    pub tag_sets: Option<Vec<TagSet>>,
    pub max_staleness: Option<Duration>,
}

/// Which members may serve a read.
///
/// `Primary` carries no options, tag sets and staleness bounds are meaningless for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPreference {
    Primary,
    Secondary { options: ReadPreferenceOptions },
    PrimaryPreferred { options: ReadPreferenceOptions },
    SecondaryPreferred { options: ReadPreferenceOptions },
    Nearest { options: ReadPreferenceOptions },
}

impl ReadPreference {
    pub fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { options }
            | ReadPreference::PrimaryPreferred { options }
            | ReadPreference::SecondaryPreferred { options }
            | ReadPreference::Nearest { options } => Some(options),
        }
    }
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::Primary
    }
}

/// What an operation needs from the server it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionCriteria {
    ReadPreference(ReadPreference),
    Write,
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_preference: ReadPreference) -> Self {
        SelectionCriteria::ReadPreference(read_preference)
    }
}

#[derive(thiserror::Error)]
pub enum SelectionError {
    #[error("Server selection timed out: {message}")]
    Timeout {
        message: String,
        description: Box<TopologyDescription>,
    },
    #[error("The deployment is incompatible with this client: {0}")]
    IncompatibleCluster(String),
    #[error("Invalid read preference: {0}")]
    InvalidReadPreference(String),
    #[error("The topology has been closed")]
    TopologyClosed,
}

impl std::fmt::Debug for SelectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// Every member eligible for `criteria`, after the latency window is applied.
///
/// An empty result is not an error: the caller is expected to wait for the topology to change.
pub fn suitable_servers<'a>(
    description: &'a TopologyDescription,
    criteria: &SelectionCriteria,
) -> Result<Vec<&'a ServerDescription>, SelectionError> {
    let known = description
        .sorted_servers()
        .into_iter()
        .filter(|server| server.is_known())
        .collect::<Vec<_>>();

    let compatible = known
        .iter()
        .copied()
        .filter(|server| wire_compatibility_error(server).is_none())
        .collect::<Vec<_>>();

    let candidates = eligible_for(description, &compatible, criteria)?;

    // Fatal when the only members that would qualify are incompatible
    if candidates.is_empty()
        && !known.is_empty()
        && (compatible.is_empty() || !eligible_for(description, &known, criteria)?.is_empty())
    {
        let message = description
            .compatibility_error
            .clone()
            .unwrap_or_else(|| "no server supports a compatible wire version".to_string());
        return Err(SelectionError::IncompatibleCluster(message));
    }

    Ok(latency_window(description, candidates))
}

/// Members of the right type for `criteria`, before the latency window.
fn eligible_for<'a>(
    description: &TopologyDescription,
    servers: &[&'a ServerDescription],
    criteria: &SelectionCriteria,
) -> Result<Vec<&'a ServerDescription>, SelectionError> {
    let eligible = match description.topology_type {
        TopologyType::Unknown => Vec::new(),
        TopologyType::Single => match criteria {
            SelectionCriteria::Write => filter_type(servers, |s| s.is_writable()),
            SelectionCriteria::ReadPreference(_) => servers.to_vec(),
        },
        TopologyType::Sharded => filter_type(servers, |s| s.server_type == ServerType::Mongos),
        TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => match criteria {
            SelectionCriteria::Write => primaries(servers),
            SelectionCriteria::ReadPreference(read_preference) => {
                replica_set_candidates(description, servers, read_preference)?
            }
        },
    };
    Ok(eligible)
}

/// Picks one eligible server uniformly at random.
pub fn select_server<'a>(
    description: &'a TopologyDescription,
    criteria: &SelectionCriteria,
) -> Result<Option<&'a ServerDescription>, SelectionError> {
    let suitable = suitable_servers(description, criteria)?;
    Ok(suitable.choose(&mut rand::thread_rng()).copied())
}

fn filter_type<'a>(
    servers: &[&'a ServerDescription],
    predicate: impl Fn(&ServerDescription) -> bool,
) -> Vec<&'a ServerDescription> {
    servers.iter().copied().filter(|s| predicate(*s)).collect()
}

fn primaries<'a>(servers: &[&'a ServerDescription]) -> Vec<&'a ServerDescription> {
    filter_type(servers, |s| s.server_type == ServerType::RsPrimary)
}

fn secondaries<'a>(servers: &[&'a ServerDescription]) -> Vec<&'a ServerDescription> {
    filter_type(servers, |s| s.server_type == ServerType::RsSecondary)
}

fn replica_set_candidates<'a>(
    description: &TopologyDescription,
    servers: &[&'a ServerDescription],
    read_preference: &ReadPreference,
) -> Result<Vec<&'a ServerDescription>, SelectionError> {
    let options = match read_preference.options() {
        Some(options) => options,
        None => return Ok(primaries(servers)),
    };
    validate_max_staleness(description, options)?;

    let eligible = |members: Vec<&'a ServerDescription>| {
        let fresh = filter_stale(description, members, options.max_staleness);
        filter_tag_sets(fresh, options.tag_sets.as_deref())
    };

    let candidates = match read_preference {
        ReadPreference::Primary => primaries(servers),
        ReadPreference::Secondary { .. } => eligible(secondaries(servers)),
        ReadPreference::PrimaryPreferred { .. } => {
            let primary = primaries(servers);
            if primary.is_empty() {
                eligible(secondaries(servers))
            } else {
                primary
            }
        }
        ReadPreference::SecondaryPreferred { .. } => {
            let secondaries = eligible(secondaries(servers));
            if secondaries.is_empty() {
                primaries(servers)
            } else {
                secondaries
            }
        }
        ReadPreference::Nearest { .. } => eligible(filter_type(servers, |s| {
            matches!(s.server_type, ServerType::RsPrimary | ServerType::RsSecondary)
        })),
    };

    Ok(candidates)
}

fn validate_max_staleness(
    description: &TopologyDescription,
    options: &ReadPreferenceOptions,
) -> Result<(), SelectionError> {
    let max_staleness = match options.max_staleness {
        Some(max_staleness) => max_staleness,
        None => return Ok(()),
    };

    let variance = description.heartbeat_frequency + IDLE_WRITE_PERIOD;
    if max_staleness < variance {
        return Err(SelectionError::InvalidReadPreference(format!(
            "max staleness must be at least {} seconds, got {}",
            variance.as_secs(),
            max_staleness.as_secs()
        )));
    }
    if max_staleness < SMALLEST_MAX_STALENESS {
        return Err(SelectionError::InvalidReadPreference(format!(
            "max staleness must be at least {} seconds, got {}",
            SMALLEST_MAX_STALENESS.as_secs(),
            max_staleness.as_secs()
        )));
    }
    Ok(())
}

/// Estimated staleness of `server`, or `None` when it can't be measured.
fn staleness(description: &TopologyDescription, server: &ServerDescription) -> Option<chrono::Duration> {
    let heartbeat = chrono::Duration::from_std(description.heartbeat_frequency).ok()?;
    let last_write = server.last_write_date?;

    if let Some(primary) = description.primary() {
        let primary_lag = primary.last_update_time - primary.last_write_date?;
        return Some((server.last_update_time - last_write) - primary_lag + heartbeat);
    }

    let freshest = description
        .servers
        .values()
        .filter(|s| s.server_type == ServerType::RsSecondary)
        .filter_map(|s| s.last_write_date)
        .max()?;
    Some(freshest - last_write + heartbeat)
}

fn filter_stale<'a>(
    description: &TopologyDescription,
    servers: Vec<&'a ServerDescription>,
    max_staleness: Option<Duration>,
) -> Vec<&'a ServerDescription> {
    let max_staleness = match max_staleness.and_then(|m| chrono::Duration::from_std(m).ok()) {
        Some(max_staleness) => max_staleness,
        None => return servers,
    };

    servers
        .into_iter()
        .filter(|server| {
            staleness(description, server).map_or(false, |staleness| staleness <= max_staleness)
        })
        .collect()
}

fn tags_match(tag_set: &TagSet, server: &ServerDescription) -> bool {
    tag_set
        .iter()
        .all(|(key, value)| server.tags.get(key) == Some(value))
}

fn filter_tag_sets<'a>(
    servers: Vec<&'a ServerDescription>,
    tag_sets: Option<&[TagSet]>,
) -> Vec<&'a ServerDescription> {
    let tag_sets = match tag_sets {
        Some(tag_sets) if !tag_sets.is_empty() => tag_sets,
        _ => return servers,
    };

    for tag_set in tag_sets {
        let matching = servers
            .iter()
            .copied()
            .filter(|server| tags_match(tag_set, server))
            .collect::<Vec<_>>();
        if !matching.is_empty() {
            return matching;
        }
    }
    Vec::new()
}

fn latency_window<'a>(
    description: &TopologyDescription,
    servers: Vec<&'a ServerDescription>,
) -> Vec<&'a ServerDescription> {
    let fastest = match servers
        .iter()
        .map(|server| server.round_trip_time.unwrap_or_default())
        .min()
    {
        Some(fastest) => fastest,
        None => return servers,
    };
    let ceiling = fastest + description.local_threshold;

    servers
        .into_iter()
        .filter(|server| server.round_trip_time.unwrap_or_default() <= ceiling)
        .collect()
}
