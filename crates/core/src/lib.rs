pub mod archetype;
pub mod assignment;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod fcm;
pub mod features;
pub mod preprocess;
pub mod registry;
pub mod sampling;
pub mod selection;

pub use archetype::ArchetypeComposer;
pub use assignment::{assign_vectors, PopulationAssigner};
pub use config::{AppConfig, AxisConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use domain::archetype::{Archetype, ArchetypeReport, ArchetypeSignature, Granularity};
pub use domain::customer::{CustomerEvent, CustomerHistory, CustomerId, EventKind, ObservationWindow};
pub use domain::feature::{AxisName, FeatureVector};
pub use domain::membership::FuzzyMembership;
pub use domain::model::{AxisModel, BalanceMetrics};
pub use engine::{AssignmentReport, AxisDiscovery, DiscoveryReport, SegmentationEngine};
pub use errors::{ApplicationError, AxisWarning, SegmentationError};
pub use fcm::{FcmFit, FcmParams};
pub use features::{FeatureCache, FeatureExtractor, Metric};
pub use preprocess::{Preprocessor, ScalerParams};
pub use registry::ModelRegistry;
pub use sampling::Sampler;
pub use selection::{ModelSelector, Selection};
