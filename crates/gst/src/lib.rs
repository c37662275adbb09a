//! GStreamer implementation of the meshcall [`MediaEngine`](meshcall::MediaEngine).
//!
//! Node kinds map onto stock elements:
//!
//! | Node kind | Element |
//! |-----------|---------|
//! | `RtpSession` | `rtpbin` |
//! | `UdpSource` / `UdpSink` | `udpsrc` / `multiudpsink` |
//! | `AudioCapture` / `AudioOutput` | `pulsesrc` / `pulsesink` |
//! | `VideoCapture` / `TestVideoSource` | `v4l2src` / `videotestsrc` |
//! | Opus encoder, decoder, (de)payloader | `opusenc`, `opusdec`, `rtpopuspay`, `rtpopusdepay` |
//! | JPEG encoder, decoder, (de)payloader | `jpegenc`, `jpegdec`, `rtpjpegpay`, `rtpjpegdepay` |
//! | `AudioMixer` | `audiomixer` |
//! | `VideoOutput` | `glimagesink` |
//! | `BridgeSink` / `BridgeSource` | `proxysink` / `proxysrc` |
//!
//! Pre-bound sockets are handed to `udpsrc`/`multiudpsink` as duplicated
//! descriptors wrapped in a `GSocket`, so the core stays the owner of every
//! port. Errors posted on a pipeline bus are attributed to the innermost
//! graph containing the failing element.
//!
//! ```no_run
//! use meshcall::{Config, LocalPeer};
//! use meshcall_gst::GstEngine;
//!
//! let handle = LocalPeer::new(Config::default()).engine(GstEngine::new()?).start()?;
//! # handle.stop();
//! # Ok::<(), meshcall::Error>(())
//! ```

mod engine;

pub use engine::GstEngine;
