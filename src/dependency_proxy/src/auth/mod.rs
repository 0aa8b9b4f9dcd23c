pub mod credentials;
pub mod token;

pub use credentials::{CredentialVerifier, StaticCredentials};
pub use token::{PullToken, PullTokenClaims, TokenService, ANONYMOUS_SUBJECT};
