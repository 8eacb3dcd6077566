// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # IDM Wallet — Identity Core
//!
//! The lifecycle engine of a decentralized-identity wallet: identities as
//! first-class aggregates, DIDs as their anchors, and everything heavy —
//! storage engines, replication, DID networks — pushed behind trait seams
//! so the embedding application decides how bytes actually move.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual concerns of an
//! identity wallet:
//!
//! - **crypto** — Ambient primitives: identity ids, key material, signing.
//! - **didm** — The DID method registry; drivers plug in, callers dispatch.
//! - **identities** — The directory and the per-identity sub-stores
//!   (devices, profile, backup, apps).
//! - **storage** — Encrypted local key-value storage, as a trait.
//! - **linkage** — Replicated per-identity databases, as traits.
//!
//! ## Design Philosophy
//!
//! 1. The wallet coordinates; collaborators do the I/O.
//! 2. Revocation is a one-way door, and it closes exactly once.
//! 3. Private keys never enter a replicated store. Ever.
//! 4. A corrupt identity costs you that identity, not the wallet.

pub mod crypto;
pub mod didm;
pub mod identities;
pub mod linkage;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;
