// SPDX-License-Identifier: MPL-2.0

//! Metadata container logs.
//!
//! An MDC is a single append-only metadata log persisted as a *pair* of
//! mlogs, one active at a time. Compaction rewrites the net state into the
//! inactive mlog and atomically swaps roles, bounding log growth without a
//! window in which records could be lost.
mod mdc;
mod mlog;

pub use self::{
    mdc::Mdc,
    mlog::{Frame, Mlog},
};
