//! Host-side tuning rig for a two-wheeled balancing robot.
//!
//! The robot sits at the other end of a serial line and speaks a small
//! line-based protocol: it takes `key=value` settings and a handful of bare
//! commands, and streams back telemetry, status text and echoes of its
//! active parameters, all on the same wire with nothing but a tag prefix to
//! tell them apart.
//!
//! A tuning session walks a grid of PID gains. For every combination the
//! [scheduler] pushes the gains, waits until the robot has [verified](verify)
//! them, runs a timed [trial], [scores](score) the tilt trace it recorded
//! and writes the result down, then moves on. A robot that will not
//! confirm, will not start or will not report never stalls the sweep; that
//! job just gets the failure score.
//!
//! The pieces, roughly bottom up:
//! - [link] owns the serial port, reconnects when it drops, and turns the
//!   byte stream into [classified](protocol::classify) lines.
//! - [controller] is the one place those lines are acted on.
//! - [sim] is a pretend robot for trying all of this without hardware.

#![warn(missing_docs)]
pub mod args;
pub mod config;
pub mod controller;
pub mod link;
pub mod params;
pub mod protocol;
pub mod record;
pub mod scheduler;
pub mod score;
pub mod sim;
pub mod store;
pub mod sweep;
pub mod trial;
pub mod verify;
