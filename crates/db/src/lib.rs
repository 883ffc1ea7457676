pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use repositories::{
    ArchetypeRepository, AxisModelRepository, DiscoveryRunRepository, EventRepository,
    MembershipRepository, RepositoryError, SegmentCount,
};
