mod authorization;
mod client_id;
mod client_metadata;
mod credentials;
mod issuer;
mod redirect_uri;
mod request_uri;
mod scope;
mod server_metadata;
mod token;

pub use authorization::*;
pub use client_id::*;
pub use client_metadata::*;
pub use credentials::*;
pub use issuer::*;
pub use redirect_uri::*;
pub use request_uri::*;
pub use scope::*;
pub use server_metadata::*;
pub use token::*;
