//! # place-core: Board model and admission policy for the shared canvas
//!
//! Pure, synchronous building blocks used by the server and its clients:
//!
//! ```text
//!   PixelWrite ──validate──► Pixel ──append──► change log
//!                                                  │
//!       ThrottleGate (per-user cooldown)           │ fold
//!                                                  ▼
//!   decode_changes ◄── live feed ◄─────────── Board (4 bpp)
//! ```
//!
//! ## Modules
//!
//! - [`pixel`] — Pixel records and submission validation
//! - [`board`] — Packed bitmap codec and board generation
//! - [`throttle`] — Per-user rate limiting and batch-size policy
//! - [`feed`] — Live update wire shapes

pub mod board;
pub mod feed;
pub mod pixel;
pub mod throttle;

pub use board::{
    unpack, ApplyReport, Board, BoardError, BoardGeometry, FillMode, ImageSeed, PaletteRule,
    DEFAULT_BOARD_SIZE,
};
pub use feed::{decode_changes, encode_changes, ChangeLogEntry, FeedDecodeError, PixelUpdate};
pub use pixel::{validate_batch, Pixel, PixelWrite, TimestampMs, ValidationError};
pub use throttle::{
    evaluate, is_admin_idp, ThrottleDecision, ThrottleReason, UserState,
    DEFAULT_ADMIN_IDP, DEFAULT_THROTTLE_SECONDS,
};
