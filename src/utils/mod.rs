//! Process-level helpers shared by the binary and the composition root.

pub mod bootstrap;
