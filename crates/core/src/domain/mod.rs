pub mod archetype;
pub mod customer;
pub mod feature;
pub mod membership;
pub mod model;
