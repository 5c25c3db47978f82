//! Auto-focus and polar-alignment control engines for an astrophotography
//! mount/camera supervisor.
//!
//! One module per concern (`error`, `config`, `geometry`, `device`,
//! `star_extractor`, `plate_solver`, `events`, `session`), with the two
//! engines under their own `focus`/`polar_align` directories alongside the
//! data model each one owns.

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod focus;
pub mod geometry;
pub mod plate_solver;
pub mod polar_align;
pub mod session;
pub mod star_extractor;

pub use error::EngineError;
pub use events::{Event, EventSink, LoggingSink};
pub use focus::engine::{AutoFocusEngine, AutoFocusState};
pub use polar_align::engine::{PolarAlignState, PolarAlignmentEngine};
pub use session::{SessionGuard, SessionHandle};
