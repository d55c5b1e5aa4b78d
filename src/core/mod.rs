//! Core value types shared by the presence and network layers.

pub mod position;

pub use position::Position;
