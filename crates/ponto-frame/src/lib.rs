//! ponto-frame: Frame handling for the attendance engine.
//!
//! Decodes submitted frames, produces the canonical equalized grayscale
//! face patches the classifier is trained on, draws verdict boxes, and
//! holds the latest-frame slot shared between request handlers.

pub mod annotate;
pub mod frame;
pub mod gray;
pub mod slot;

pub use frame::{decode_frame, FrameError, Rect};
pub use gray::CANONICAL_FACE_SIZE;
pub use slot::FrameSlot;
