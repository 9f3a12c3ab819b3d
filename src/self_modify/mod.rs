//! # Module: self_modify
//!
//! The self-modification pipeline: a proposed change is scanned, scored,
//! decided on, applied under optimistic concurrency, and can be rolled back.
//!
//! ## Sub-modules
//! - [`proposal`]: change sets, risk levels, proposal records and the status state machine
//! - [`patterns`]: precompiled glob table mapping paths to risk tiers
//! - [`guardrails`]: restricted-path deny-list, secret and dangerous-operation scan
//! - [`risk`]: required risk tier of a change set
//! - [`confidence`]: confidence score and per-kind outcome history
//! - [`decision`]: approve / escalate / reject
//! - [`gateway`]: compare-and-swap file store interface (in-memory and filesystem)
//! - [`rollback`]: capture and restore of pre-change state
//! - [`locks`]: exclusive path locks for apply and rollback
//! - [`repository`]: proposal persistence interface and in-memory store
//! - [`sqlite_repo`]: SQLite proposal store
//! - [`collaborators`]: review system and notification sink seams
//! - [`ledger`]: the orchestrating state machine

pub mod collaborators;
pub mod confidence;
pub mod decision;
pub mod gateway;
pub mod guardrails;
pub mod ledger;
pub mod locks;
pub mod patterns;
pub mod proposal;
pub mod repository;
pub mod risk;
pub mod rollback;
pub mod sqlite_repo;
