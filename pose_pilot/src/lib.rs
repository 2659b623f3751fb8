//! # pose_pilot
//!
//! Live hand-gesture controller.  A webcam feeds a MediaPipe hand
//! landmarker; the first hand's 21 landmarks are classified by a small
//! network trained on samples the user collects; a confidently recognised
//! gesture plays that class's note sequence or sends its motor commands to
//! a LEGO hub over Bluetooth LE.
//!
//! ## Pipeline
//!
//! ```text
//! Camera ─► DetectorLoop ─► LatestHands ─► PredictionLoop ─► fired class
//!                                                              │
//!                               Player (MIDI) ◄── audio mode ──┤
//!              MotorDispatcher ─► BleTransport ◄── motor mode ─┘
//! ```
//!
//! ## Feature flags
//!
//! * (default): frames come from a synthetic camera; pair it with
//!   `--replay` to drive the app from a recorded landmark file.
//! * `camera`: live webcam through OpenCV.
//!
//! ## Keys
//!
//! | Key | Action |
//! |---|---|
//! | `N` / `R` / `Del` | New / rename / delete class |
//! | `Up` `Down` | Select class |
//! | `C` (hold) | Collect samples for the selected class |
//! | `X` | Clear the selected class's samples |
//! | `T` | Train |
//! | `P` | Start / stop predicting |
//! | `V` | Start / stop the camera |
//! | `M` | Switch audio / motor mode |
//! | `K` `D` `L` | Add note, add rest, change slot length |
//! | `Backspace` `Z` `Space` | Undo slot, clear notes, play notes |
//! | `Tab` `A` `F` | Next port, cycle action, flip direction |
//! | `-` `+` `[` `]` | Speed, degrees |
//! | `0` `H` `Enter` | Reset motors, 3/6-port layout, send to hub |
//! | `B` / `Shift+B` | Connect / disconnect hub |
//! | `G` | Play every class on the hub in order |
//! | `Esc` | Stop all sound and motors |
//! | `S` `O` `E` | Save project, load project, export model |
//! | `Q` | Quit |

pub mod config;
pub mod single_flight;
pub mod detector;
pub mod landmarker;
pub mod camera;
pub mod prediction;
pub mod player;
pub mod ble;
pub mod bluez;
pub mod dispatch;
pub mod visualizer;
pub mod app;
