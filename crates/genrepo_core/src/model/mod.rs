//! Entity model shared by repositories, contexts and stores.
//!
//! # Responsibility
//! - Define the `Entity` capability contract and its `Document` mapping.
//! - Define identity key values and key shape validation.
//!
//! # Invariants
//! - Every entity instance is identified by an ordered `EntityKey` whose
//!   shape matches `Entity::KEY`.

pub mod entity;
pub mod key;
