//! OAuth/OIDC flow state, PKCE and the post-callback token exchange.

mod exchange;
pub mod pkce;
mod state;

pub use exchange::TokenExchange;
pub use pkce::{PKCE_METHOD_S256, compute_code_challenge, validate_code_challenge, verify_code_verifier};
pub use state::{DEFAULT_STATE_TTL_SECONDS, NewOAuthState, OAuthState, OAuthStateManager, OAuthStateStore};
