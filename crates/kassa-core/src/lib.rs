//! # kassa-core: Pure Domain Logic for the Kassa Fiscal Adapter
//!
//! This crate is the **heart** of the adapter. It contains all domain logic
//! as pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Kassa Adapter Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                POS / ERP callers (HTTP, trusted LAN)            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          apps/adapter + kassa-sync (orchestration)              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ kassa-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   money   │  │   clock   │  │ validation│  │   │
//! │  │   │  Receipt  │  │   Money   │  │ HybridClk │  │   rules   │  │   │
//! │  │   │ FiscalDoc │  │  TaxCalc  │  │ HlcStamp  │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  kassa-buffer (Durable Buffer)                  │   │
//! │  │            SQLite WAL, migrations, repositories                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Receipt, FiscalDocument, DeadLetterEntry, ...)
//! - [`money`] - Money type with integer arithmetic (no floating point!)
//! - [`clock`] - Hybrid logical clock for skew-tolerant total ordering
//! - [`error`] - Domain error types
//! - [`validation`] - Receipt payload validation
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: Every function is deterministic (the clock reads
//!    wall time, nothing else touches the environment)
//! 2. **No I/O**: Database, network, file system access is FORBIDDEN here
//! 3. **Integer Money**: All monetary values are in cents (i64)
//! 4. **Explicit Errors**: All errors are typed, never strings or panics

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod error;
pub mod money;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================
// These allow users to do `use kassa_core::Receipt` instead of
// `use kassa_core::types::Receipt`

pub use clock::{HlcTimestamp, HybridClock};
pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use types::*;
pub use validation::{validate_item, validate_receipt_request, ValidationResult};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Permitted difference between item totals and payment totals, in cents.
///
/// ## Business Reason
/// Rounding of per-line tax can leave a one-cent discrepancy that fiscal
/// regulations tolerate. Anything larger is a malformed receipt.
pub const BALANCE_TOLERANCE_CENTS: i64 = 1;

/// Maximum line items on a single receipt.
///
/// ## Business Reason
/// Bounds payload size; fiscal printers reject documents beyond a few
/// hundred lines anyway.
pub const MAX_RECEIPT_ITEMS: usize = 100;

/// Maximum quantity of a single item.
///
/// ## Business Reason
/// Prevents accidental over-entry (e.g., typing 1000 instead of 10).
pub const MAX_ITEM_QUANTITY: i64 = 999;
