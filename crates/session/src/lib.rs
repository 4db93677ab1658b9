//! Users, sessions, and the key-value store they live in.
//!
//! The gateway treats the KV store as an interface ([`KvStore`]) with two
//! implementations: [`kv::RedisStore`] for production and [`kv::MemoryStore`]
//! for tests and local development. Session creation is atomic
//! (create-if-absent) regardless of backend.

pub mod auth;
pub mod error;
pub mod kv;
pub mod session;
pub mod user;

pub use auth::{JwtValidator, StaticValidator, TokenValidator};
pub use error::{AuthError, KvError, SessionError};
pub use kv::{KvStore, MemoryStore, RedisStore};
pub use session::{Session, SessionStore, SIGN_IN_TIME_FIELD};
pub use user::{Device, User};
