pub mod charger;
pub mod energy;
pub mod meters;
pub mod vehicle;

pub use charger::*;
pub use energy::*;
pub use meters::*;
pub use vehicle::*;
