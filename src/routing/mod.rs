//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming message (decoded path)
//!     → router.rs (snapshot lookup)
//!     → matcher.rs (candidate prefixes, longest first)
//!     → Return: HandlerEntry (early handlers + normal handler) or None
//!
//! Registration (any time):
//!     add_handler / add_early_handler / remove_handler
//!     → matcher.rs (normalize path into RouteKey)
//!     → router.rs (copy table, modify, atomic swap)
//! ```
//!
//! # Design Decisions
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always resolves to the same entry
//! - `*` and the catch-all are separate keys, never prefixes

pub mod matcher;
pub mod router;

pub use matcher::{RouteKey, WILDCARD_PATH};
pub use router::{Handler, HandlerEntry, HandlerFn, HandlerRegistry, HandlerTable, Phase};
