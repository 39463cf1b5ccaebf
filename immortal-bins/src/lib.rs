//! Shared setup for the immortal binaries

pub mod common;
