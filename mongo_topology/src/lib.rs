/*!
mongo_topology keeps a document-database client aware of the deployment it talks to.

It discovers the members of a standalone server, a replica set or a sharded cluster, watches
each of them with a dedicated monitor task and keeps an immutable [`TopologyDescription`]
that is replaced, never mutated, whenever a monitor reports something new. Operations ask the
[`Topology`] for a server matching a [`SelectionCriteria`]; selection waits for the topology to
change when nothing qualifies, up to the configured timeout.

This library requires tokio and uses the actor pattern: the [`Topology`] handle is cheap to
clone and talks to a single background actor that owns all monitors. The transport is not part
of this crate; supply a [`Connector`] that runs handshakes against a server address.

# Example
```rust
# tokio_test::block_on(async {
use mongo_topology::{ReadPreference, SelectionCriteria, TopologyOptions};

let options = TopologyOptions::from_query_string("replicaSet=rs0&localThresholdMS=5").unwrap();
assert_eq!(options.replica_set.as_deref(), Some("rs0"));

// let topology = Topology::builder()
//     .set_options(options)
//     .set_hosts(&["db1:27017", "db2:27017"])
//     .set_connector(my_connector)
//     .build()?;
// let server = topology.select_server(&SelectionCriteria::Write).await?;
let _criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
# })
```

When the last [`Topology`] handle is dropped, the actor and every monitor stop on their own.
*/

mod monitor;
mod topology;

pub mod connector;
pub mod events;
pub mod hello;
pub mod membership;
pub mod operation_error;
pub mod server_address;
pub mod server_description;
pub mod server_selection;
pub mod topology_description;

pub use connector::{Connector, ConnectorError};
pub use events::SdamEvent;
pub use hello::{ClusterTime, HelloCommand, HelloReply, ObjectId, Timestamp, TopologyVersion};
pub use membership::{MemberRole, Membership, MembershipChange, MembershipSnapshot};
pub use monitor::{MonitorMessage, RoundTripTime, MIN_HEARTBEAT_FREQUENCY};
pub use operation_error::{ExecuteError, OperationError};
pub use server_address::ServerAddress;
pub use server_description::{ServerDescription, ServerType};
pub use server_selection::{
    ReadPreference, ReadPreferenceOptions, SelectionCriteria, SelectionError, TagSet,
};
pub use topology::*;
pub use topology_description::{TopologyDescription, TopologyType};

pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}
