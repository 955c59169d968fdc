pub mod claims;
pub mod log;
pub mod manifest;
pub mod models;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Audience expected in OIDC tokens minted for this platform.
pub const TOKEN_AUDIENCE: &str = "enclii";

/// Prefix that distinguishes opaque API tokens from OIDC JWTs.
pub const API_TOKEN_PREFIX: &str = "enclii_";

/// Exit codes spoken on the CLI wire.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC: i32 = 1;
    pub const VALIDATION: i32 = 2;
    pub const UNAUTHENTICATED: i32 = 3;
    pub const FORBIDDEN: i32 = 4;
    pub const NOT_FOUND: i32 = 5;
    pub const CONFLICT: i32 = 6;
}
