mod call;
mod lease;
mod primitives;

pub use call::*;
pub use lease::*;
pub use primitives::*;
