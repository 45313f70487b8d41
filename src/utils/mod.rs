//! Commonly used utilities shared by both schedulers.

pub mod xorshift;

pub use self::xorshift::XorShift64Star;
