//! Concrete frame sources.

pub mod desktop;
pub mod pattern;

pub use desktop::DesktopSource;
pub use pattern::PatternSource;
