//! Media engines for Duplex.
//!
//! [`GstEngine`] drives a real GStreamer pipeline around `webrtcbin` and is only
//! built with the `gstreamer-runtime` feature. [`DummyEngine`] needs no system
//! libraries and answers every command with plausible events, which is enough to
//! exercise signalling end to end.

#![forbid(unsafe_code)]

pub mod dummy;
#[cfg(feature = "gstreamer-runtime")]
pub mod gst;

pub use dummy::DummyEngine;
#[cfg(feature = "gstreamer-runtime")]
pub use gst::GstEngine;
