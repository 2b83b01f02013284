pub mod audit;
pub mod inspect;
pub mod policy;

pub use audit::*;
pub use inspect::*;
pub use policy::*;
