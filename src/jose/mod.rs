mod jwk;
mod keyset;

pub use jwk::*;
pub use keyset::*;
