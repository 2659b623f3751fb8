//! # pose_actions
//!
//! The two things a recognised gesture can do:
//!
//! * [`notes`]: play a per-class sequence of piano notes and rests.
//!   Note names resolve through a fixed C3–B5 table; durations come from
//!   five named lengths.
//! * [`motor`]: drive the ports of a LEGO hub.  Each class owns one
//!   setting per port; settings become guarded text statements that the
//!   hub's REPL executes line by line.
//!
//! ## Quick start
//!
//! ```rust
//! use pose_actions::motor::{command_block, Direction, MotorAction, MotorSetting, Port};
//! use pose_actions::notes::{NoteDuration, NoteSequence};
//!
//! let mut seq = NoteSequence::new();
//! seq.add_note("C4", NoteDuration::Short).unwrap();
//! seq.add_delay(NoteDuration::VeryShort);
//! seq.add_note("G4", NoteDuration::Long).unwrap();
//! assert_eq!(seq.len(), 3);
//!
//! let spin = MotorSetting {
//!     port:      Port::B,
//!     action:    MotorAction::RunDegrees,
//!     direction: Direction::Clockwise,
//!     speed:     80,
//!     degrees:   720,
//! };
//! assert!(command_block(&[spin]).contains("motor.run_for_degrees(port.B, 720, 80)"));
//! ```

pub mod notes;
pub mod motor;

pub use motor::{Direction, HubLayout, MotorAction, MotorBook, MotorConfig, MotorSetting, Port};
pub use notes::{Envelope, NoteDuration, NoteError, NoteSequence, SequenceBook, Slot};
