//! Wire protocol grammars for the bench instruments.

pub mod newfocus;
