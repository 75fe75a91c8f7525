//! Event Coalescing Module
//!
//! Membership changes arrive one notification at a time and often in bursts
//! (a flapping node, a rolling restart). This module batches them before they
//! reach the application.
//!
//! ## Pipeline
//! Events enter a chain of coalescing stages, each a task owning one
//! [`coalesce::Coalescer`]:
//! 1. **Member stage**: deduplicates join/leave/failed/update/reap per member
//!    name and flushes one batch per kind.
//! 2. **User stage**: keeps only the newest coalescable user events per name.
//!
//! Events a stage does not handle are forwarded untouched, so queries and
//! non-coalescable user events pass straight through. Delivery to the
//! application is lossy when its queue is full.

pub mod coalesce;
pub mod member;
pub mod types;
pub mod user;
